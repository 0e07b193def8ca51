//! Durable per-resource-type migration progress.
//!
//! In memory every source ID maps to exactly one [`ResourceStatus`]; on disk
//! the state keeps the `completed_ids` / `failed_ids` layout so existing
//! checkpoint directories stay readable.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

/// Source ID to destination ID, shared across every resource type in a run.
pub type IdMapping = BTreeMap<String, String>;

pub const STATE_FILE_SUFFIX: &str = "_state.json";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to create checkpoint directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write checkpoint {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode checkpoint {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    WrongPass,
    Unchanged,
    AlreadyExists,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::WrongPass => "wrong_pass",
            SkipReason::Unchanged => "unchanged",
            SkipReason::AlreadyExists => "already_exists",
        }
    }

    /// Heading used in the text summary.
    pub fn title(&self) -> &'static str {
        match self {
            SkipReason::WrongPass => "Wrong Pass",
            SkipReason::Unchanged => "Unchanged",
            SkipReason::AlreadyExists => "Already Exists",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceStatus {
    /// Known but due for (re)processing, e.g. after a content change.
    Pending,
    Skipped(SkipReason),
    Migrated { dest_id: String },
    Failed { error: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationState {
    statuses: BTreeMap<String, ResourceStatus>,
    pub id_mapping: IdMapping,
    checksums: BTreeMap<String, String>,
    metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    completed_ids: Vec<String>,
    #[serde(default)]
    failed_ids: Vec<String>,
    #[serde(default)]
    id_mapping: BTreeMap<String, String>,
    #[serde(default)]
    checksums: BTreeMap<String, String>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

pub fn state_file_path(dir: &Path, resource_name: &str) -> PathBuf {
    dir.join(format!("{}{}", resource_name.to_lowercase(), STATE_FILE_SUFFIX))
}

impl MigrationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a checkpoint, treating a missing or unreadable file as empty state.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(target: "orgmigrate", event = "checkpoint_missing", path = %path.display());
                return Self::default();
            }
            Err(err) => {
                warn!(
                    target: "orgmigrate",
                    event = "checkpoint_unreadable",
                    path = %path.display(),
                    error = %err
                );
                return Self::default();
            }
        };
        match serde_json::from_str::<CheckpointFile>(&raw) {
            Ok(file) => Self::from_file(file),
            Err(err) => {
                warn!(
                    target: "orgmigrate",
                    event = "checkpoint_corrupt",
                    path = %path.display(),
                    error = %err
                );
                Self::default()
            }
        }
    }

    fn from_file(file: CheckpointFile) -> Self {
        let mut statuses = BTreeMap::new();
        for id in file.completed_ids {
            let dest_id = file.id_mapping.get(&id).cloned().unwrap_or_default();
            statuses.insert(id, ResourceStatus::Migrated { dest_id });
        }
        // A hand-edited file listing an ID twice keeps it eligible for retry.
        for id in file.failed_ids {
            let error = file
                .metadata
                .get(&id)
                .and_then(|meta| meta.get("error"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            statuses.insert(id, ResourceStatus::Failed { error });
        }
        Self {
            statuses,
            id_mapping: file.id_mapping,
            checksums: file.checksums,
            metadata: file.metadata,
        }
    }

    fn to_file(&self) -> CheckpointFile {
        let mut file = CheckpointFile {
            id_mapping: self.id_mapping.clone(),
            checksums: self.checksums.clone(),
            metadata: self.metadata.clone(),
            ..CheckpointFile::default()
        };
        for (id, status) in &self.statuses {
            match status {
                ResourceStatus::Migrated { .. } => file.completed_ids.push(id.clone()),
                ResourceStatus::Failed { .. } => file.failed_ids.push(id.clone()),
                ResourceStatus::Pending | ResourceStatus::Skipped(_) => {}
            }
        }
        file
    }

    /// Writes the checkpoint atomically with two-space indentation.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|source| CheckpointError::CreateDir {
            path: dir.display().to_string(),
            source,
        })?;
        let body = serde_json::to_string_pretty(&self.to_file()).map_err(|source| {
            CheckpointError::Encode {
                path: path.display().to_string(),
                source,
            }
        })?;
        let write_err = |source| CheckpointError::Write {
            path: path.display().to_string(),
            source,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(body.as_bytes()).map_err(write_err)?;
        tmp.persist(path).map_err(|err| write_err(err.error))?;
        Ok(())
    }

    pub fn status(&self, source_id: &str) -> Option<&ResourceStatus> {
        self.statuses.get(source_id)
    }

    pub fn is_completed(&self, source_id: &str) -> bool {
        matches!(self.statuses.get(source_id), Some(ResourceStatus::Migrated { .. }))
    }

    pub fn is_failed(&self, source_id: &str) -> bool {
        matches!(self.statuses.get(source_id), Some(ResourceStatus::Failed { .. }))
    }

    pub fn completed_ids(&self) -> impl Iterator<Item = &str> {
        self.statuses.iter().filter_map(|(id, status)| match status {
            ResourceStatus::Migrated { .. } => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.statuses.iter().filter_map(|(id, status)| match status {
            ResourceStatus::Failed { .. } => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn checksum(&self, source_id: &str) -> Option<&str> {
        self.checksums.get(source_id).map(String::as_str)
    }

    pub fn metadata(&self, source_id: &str) -> Option<&Value> {
        self.metadata.get(source_id)
    }

    pub fn dest_id(&self, source_id: &str) -> Option<&str> {
        self.id_mapping.get(source_id).map(String::as_str)
    }

    pub fn add_mapping(&mut self, source_id: impl Into<String>, dest_id: impl Into<String>) {
        self.id_mapping.insert(source_id.into(), dest_id.into());
    }

    /// Merges mappings produced elsewhere in the run into this state.
    pub fn merge_mappings(&mut self, mappings: &IdMapping) {
        for (source_id, dest_id) in mappings {
            self.id_mapping.insert(source_id.clone(), dest_id.clone());
        }
    }

    pub fn record_success(
        &mut self,
        source_id: &str,
        dest_id: &str,
        checksum: &str,
        metadata: Option<Value>,
    ) {
        self.statuses.insert(
            source_id.to_string(),
            ResourceStatus::Migrated {
                dest_id: dest_id.to_string(),
            },
        );
        self.id_mapping
            .insert(source_id.to_string(), dest_id.to_string());
        self.checksums
            .insert(source_id.to_string(), checksum.to_string());
        match metadata {
            Some(meta) => {
                self.metadata.insert(source_id.to_string(), meta);
            }
            None => {
                self.metadata.remove(source_id);
            }
        }
    }

    pub fn record_failure(&mut self, source_id: &str, error: &str) {
        self.statuses.insert(
            source_id.to_string(),
            ResourceStatus::Failed {
                error: error.to_string(),
            },
        );
        self.metadata.insert(
            source_id.to_string(),
            json!({ "error": error, "failed_at": Utc::now().to_rfc3339() }),
        );
    }

    /// Notes a skip for an ID the checkpoint has no stronger opinion about.
    pub fn record_skip(&mut self, source_id: &str, reason: SkipReason) {
        match self.statuses.get(source_id) {
            None | Some(ResourceStatus::Pending) | Some(ResourceStatus::Skipped(_)) => {
                self.statuses
                    .insert(source_id.to_string(), ResourceStatus::Skipped(reason));
            }
            Some(_) => {}
        }
    }

    /// True when the resource is completed with an identical checksum.
    ///
    /// A completed resource whose content changed is moved back to
    /// [`ResourceStatus::Pending`] so it is processed again.
    pub fn should_skip(&mut self, source_id: &str, checksum: &str) -> bool {
        if !self.is_completed(source_id) {
            return false;
        }
        if self.checksums.get(source_id).map(String::as_str) == Some(checksum) {
            return true;
        }
        self.statuses
            .insert(source_id.to_string(), ResourceStatus::Pending);
        false
    }
}

/// SHA-256 over the key-sorted compact JSON encoding of `value`.
pub fn content_checksum(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        Value::String(key.clone()),
                        canonical_json(&map[key.as_str()])
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}
