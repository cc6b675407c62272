pub mod job;
pub mod server;
pub mod statistics;

#[rustfmt::skip]
pub use self::{
    job::{Job, JobStatus},
    server::{Server, ServerStatus},
    statistics::JobStatistics,
};
