mod execution_channel;
mod priority_service;

#[rustfmt::skip]
pub use self::{
    execution_channel::{ExecutionChannel, ExecutionChannelOpener},
    priority_service::PriorityService,
};
