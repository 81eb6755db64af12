//! Async tasks

pub mod maintenance;

pub use maintenance::maintenance_task;
