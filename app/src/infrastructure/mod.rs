pub mod channel;
pub mod command;
pub mod database;
pub mod ioc;
mod repository;
