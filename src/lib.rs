pub mod commands;
pub mod config;
pub mod error;
pub mod jobs;
pub mod pipeline;

pub use error::{JobError, JobResult};
