use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::client::ClientError;

/// Why a single resource (or a whole resource type) could not be migrated.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("{resource_type}: required dependency {field} ({source_id}) has no destination mapping")]
    MissingRequiredDependency {
        resource_type: &'static str,
        field: &'static str,
        source_id: String,
    },
    #[error("destination rejected {resource_type}: {message}")]
    CreateRejected {
        resource_type: &'static str,
        message: String,
    },
    #[error("failed to serialize {resource_type} {source_id}: {reason}")]
    SerializationFailed {
        resource_type: &'static str,
        source_id: String,
        reason: String,
    },
    #[error("{resource_type}: unsupported {field}: {reason}")]
    UnsupportedReference {
        resource_type: &'static str,
        field: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl MigrationError {
    pub fn kind(&self) -> &'static str {
        match self {
            MigrationError::MissingRequiredDependency { .. } => "missing_required_dependency",
            MigrationError::CreateRejected { .. } => "create_rejected",
            MigrationError::SerializationFailed { .. } => "serialization_failed",
            MigrationError::UnsupportedReference { .. } => "unsupported_reference",
            MigrationError::Client(_) => "client",
            MigrationError::Checkpoint(_) => "checkpoint",
        }
    }

    /// Maps a failed create call: client-side rejections become `CreateRejected`.
    pub(crate) fn from_create(resource_type: &'static str, err: ClientError) -> Self {
        match err {
            ClientError::Api {
                status, message, ..
            } if (400..500).contains(&status) => MigrationError::CreateRejected {
                resource_type,
                message: format!("status {status}: {message}"),
            },
            other => MigrationError::Client(other),
        }
    }
}
