use std::sync::Arc;

use domain::repository::QueueRepository;
use service::prelude::*;
use typed_builder::TypedBuilder;

#[derive(TypedBuilder)]
pub struct Container {
    pub repo: Arc<dyn QueueRepository>,

    pub coordinator: Arc<QueueCoordinator>,
}
