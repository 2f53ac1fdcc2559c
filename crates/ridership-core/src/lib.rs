pub mod admin;
pub mod aggregates;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod schema;
pub mod source;
pub mod staging;
pub mod transform;

pub use context::ExecutionContext;
pub use error::{ErrorKind, PipelineError, Result};
