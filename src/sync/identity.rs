use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::SyncError;

fn active() -> String {
    "ACTIVE".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: String,
    pub email: Option<String>,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub family_name: String,
    #[serde(default = "active")]
    pub status: String,
}

impl DirectoryUser {
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("active")
    }

    /// Lower-cased email, the key users are matched on.
    pub fn identifier(&self) -> Option<String> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .map(str::to_lowercase)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Directory user IDs.
    #[serde(default)]
    pub members: Vec<String>,
}

/// Source of the users and groups to mirror.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn users(&self) -> Result<Vec<DirectoryUser>, SyncError>;

    async fn groups(&self) -> Result<Vec<DirectoryGroup>, SyncError>;
}

/// A directory export: `{"users": [...], "groups": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonDirectory {
    #[serde(default)]
    pub users: Vec<DirectoryUser>,
    #[serde(default)]
    pub groups: Vec<DirectoryGroup>,
}

impl JsonDirectory {
    pub fn new(users: Vec<DirectoryUser>, groups: Vec<DirectoryGroup>) -> Self {
        Self { users, groups }
    }

    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        let raw = fs::read_to_string(path).map_err(|source| SyncError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| SyncError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn user(&self, id: &str) -> Option<&DirectoryUser> {
        self.users.iter().find(|user| user.id == id)
    }
}

#[async_trait]
impl IdentityProvider for JsonDirectory {
    async fn users(&self) -> Result<Vec<DirectoryUser>, SyncError> {
        Ok(self.users.clone())
    }

    async fn groups(&self) -> Result<Vec<DirectoryGroup>, SyncError> {
        Ok(self.groups.clone())
    }
}
