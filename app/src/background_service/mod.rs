mod queue_manager;

pub mod prelude {
    #[rustfmt::skip]
    pub use super::{
        queue_manager::QueueManager,
    };
}
