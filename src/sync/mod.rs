//! Identity sync: mirrors directory users and groups into platform
//! organizations, assigns group roles on projects and reports drift.

pub mod assignments;
pub mod audit;
pub mod config;
pub mod drift;
pub mod executor;
pub mod identity;
pub mod planner;
pub mod projects;
pub mod state;

use crate::client::ClientError;

pub use projects::ProjectMatchError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid sync configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    ProjectMatch(#[from] ProjectMatchError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("no target organization named {0}")]
    UnknownOrganization(String),
    #[error("sync state {0} not found")]
    StateNotFound(String),
    #[error("{kind} {identifier} in {organization}: {message}")]
    ItemFailed {
        kind: &'static str,
        identifier: String,
        organization: String,
        message: String,
    },
}
