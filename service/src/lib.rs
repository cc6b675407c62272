pub mod coordinator;
pub mod priority;

#[cfg(test)]
mod test_utils;

pub mod prelude {
    #[rustfmt::skip]
    pub use super::{
        coordinator::{CoordinatorConfig, Dispatched, PassReport, QueueCoordinator},
        priority::{priority_order, PriorityScheduler},
    };
}
