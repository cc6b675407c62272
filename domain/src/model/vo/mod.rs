pub mod error;
pub mod switch;

#[rustfmt::skip]
pub use self::{
    error::QueueError,
    switch::SwitchState,
};
