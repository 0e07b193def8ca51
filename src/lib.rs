//! Copies the resources of one platform organization into another and keeps
//! the organizations' users and groups in step with an identity directory.

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod dependency_cache;
pub mod error;
pub mod logging;
pub mod migrator;
pub mod orchestrator;
pub mod report;
pub mod resource;
pub mod resources;
pub mod schema;
pub mod sync;

pub use error::{AppError, AppResult};
