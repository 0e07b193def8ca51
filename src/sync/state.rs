use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::SyncError;
use crate::checkpoint::content_checksum;

const STATE_PREFIX: &str = "sync_";
const CHECKPOINT_DIR: &str = "checkpoints";

/// First 16 hex digits of the canonical content hash.
pub fn short_hash(value: &Value) -> String {
    let mut digest = content_checksum(value);
    digest.truncate(16);
    digest
}

/// Role permissions as `{permission, restrict_object_type}` pairs in a fixed
/// order, so live and configured definitions hash alike.
pub fn normalize_permissions(permissions: &Value) -> Value {
    let mut pairs: Vec<(String, Option<String>)> = permissions
        .as_array()
        .map(|grants| {
            grants
                .iter()
                .filter_map(|grant| {
                    let permission = grant.get("permission")?.as_str()?.to_string();
                    let restrict = grant
                        .get("restrict_object_type")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    Some((permission, restrict))
                })
                .collect()
        })
        .unwrap_or_default();
    pairs.sort();
    pairs.dedup();
    Value::Array(
        pairs
            .into_iter()
            .map(|(permission, restrict)| {
                serde_json::json!({ "permission": permission, "restrict_object_type": restrict })
            })
            .collect(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagedKind {
    User,
    Group,
    Role,
    Project,
    Acl,
}

impl ManagedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagedKind::User => "user",
            ManagedKind::Group => "group",
            ManagedKind::Role => "role",
            ManagedKind::Project => "project",
            ManagedKind::Acl => "acl",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagementStatus {
    /// Created by sync.
    SyncManaged,
    /// Existed already; sync updates it.
    SyncModified,
    External,
    DriftDetected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMapping {
    pub directory_id: String,
    pub dest_id: String,
    pub organization: String,
    pub kind: ManagedKind,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedResource {
    pub resource_id: String,
    pub kind: ManagedKind,
    pub name: Option<String>,
    pub organization: String,
    pub status: ManagementStatus,
    pub created_by_sync: bool,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: DateTime<Utc>,
    pub config_hash: Option<String>,
    #[serde(default)]
    pub drift_details: Vec<String>,
}

impl ManagedResource {
    pub fn mark_drift(&mut self, details: impl Into<String>) {
        self.status = ManagementStatus::DriftDetected;
        self.drift_details.push(details.into());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleState {
    pub role_id: String,
    pub name: String,
    pub organization: String,
    pub created_by_sync: bool,
    /// The normalized `member_permissions` last applied.
    pub definition: Value,
    pub definition_hash: String,
    #[serde(default)]
    pub acl_ids: Vec<String>,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclState {
    pub acl_id: String,
    pub organization: String,
    pub group_id: String,
    pub group_name: String,
    pub role_id: String,
    pub role_name: String,
    pub project_id: String,
    pub project_name: String,
    /// Grants as `permission` names or `role:{id}`.
    pub permissions: Vec<String>,
    pub created_by_sync: bool,
    pub priority: i32,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: String,
    pub name: String,
    pub organization: String,
    pub discovered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub matched_patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    Modified,
    Deleted,
    PermissionChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftWarning {
    pub kind: ManagedKind,
    pub resource_id: String,
    pub resource_name: Option<String>,
    pub organization: String,
    pub drift_type: DriftType,
    pub details: String,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
}

/// Everything one sync run knows about what it manages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub sync_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    #[serde(default)]
    pub resource_mappings: BTreeMap<String, ResourceMapping>,
    #[serde(default)]
    pub managed_resources: BTreeMap<String, ManagedResource>,
    #[serde(default)]
    pub managed_roles: BTreeMap<String, RoleState>,
    #[serde(default)]
    pub managed_acls: BTreeMap<String, AclState>,
    #[serde(default)]
    pub discovered_projects: BTreeMap<String, ProjectState>,
    #[serde(default)]
    pub drift_warnings: Vec<DriftWarning>,
    pub last_drift_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: BTreeMap<String, Value>,
    #[serde(default)]
    pub config_snapshot: Value,
}

fn mapping_key(organization: &str, kind: ManagedKind, directory_id: &str) -> String {
    format!("{organization}:{}:{directory_id}", kind.as_str())
}

fn resource_key(kind: ManagedKind, resource_id: &str, organization: &str) -> String {
    format!("{}:{resource_id}:{organization}", kind.as_str())
}

fn org_key(id: &str, organization: &str) -> String {
    format!("{id}:{organization}")
}

impl SyncState {
    pub fn new(sync_id: impl Into<String>, config_snapshot: Value) -> Self {
        Self {
            sync_id: sync_id.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: SyncStatus::InProgress,
            resource_mappings: BTreeMap::new(),
            managed_resources: BTreeMap::new(),
            managed_roles: BTreeMap::new(),
            managed_acls: BTreeMap::new(),
            discovered_projects: BTreeMap::new(),
            drift_warnings: Vec::new(),
            last_drift_check: None,
            stats: BTreeMap::new(),
            config_snapshot,
        }
    }

    /// Carries what an earlier run manages into this one.
    pub fn inherit(&mut self, previous: SyncState) {
        self.resource_mappings = previous.resource_mappings;
        self.managed_resources = previous.managed_resources;
        self.managed_roles = previous.managed_roles;
        self.managed_acls = previous.managed_acls;
        self.discovered_projects = previous.discovered_projects;
    }

    pub fn mapping(&self, directory_id: &str, organization: &str, kind: ManagedKind) -> Option<&str> {
        self.resource_mappings
            .get(&mapping_key(organization, kind, directory_id))
            .map(|mapping| mapping.dest_id.as_str())
    }

    pub fn set_mapping(
        &mut self,
        directory_id: &str,
        dest_id: &str,
        organization: &str,
        kind: ManagedKind,
    ) {
        self.resource_mappings.insert(
            mapping_key(organization, kind, directory_id),
            ResourceMapping {
                directory_id: directory_id.to_string(),
                dest_id: dest_id.to_string(),
                organization: organization.to_string(),
                kind,
                synced_at: Utc::now(),
            },
        );
    }

    pub fn remove_mapping(&mut self, directory_id: &str, organization: &str, kind: ManagedKind) -> Option<ResourceMapping> {
        self.resource_mappings
            .remove(&mapping_key(organization, kind, directory_id))
    }

    /// Records provenance. A resource first tracked as existing stays `sync_modified`.
    pub fn track_resource(
        &mut self,
        kind: ManagedKind,
        resource_id: &str,
        name: Option<&str>,
        organization: &str,
        created_by_sync: bool,
        config: Option<&Value>,
    ) -> &mut ManagedResource {
        let now = Utc::now();
        let entry = self
            .managed_resources
            .entry(resource_key(kind, resource_id, organization))
            .or_insert_with(|| ManagedResource {
                resource_id: resource_id.to_string(),
                kind,
                name: name.map(str::to_string),
                organization: organization.to_string(),
                status: if created_by_sync {
                    ManagementStatus::SyncManaged
                } else {
                    ManagementStatus::SyncModified
                },
                created_by_sync,
                created_at: now,
                last_synced_at: now,
                config_hash: None,
                drift_details: Vec::new(),
            });
        entry.last_synced_at = now;
        if let Some(config) = config {
            entry.config_hash = Some(short_hash(config));
        }
        entry
    }

    pub fn track_role(
        &mut self,
        role_id: &str,
        name: &str,
        organization: &str,
        definition: Value,
        created_by_sync: bool,
    ) {
        let now = Utc::now();
        let definition = normalize_permissions(&definition);
        let definition_hash = short_hash(&definition);
        let role = self
            .managed_roles
            .entry(org_key(role_id, organization))
            .or_insert_with(|| RoleState {
                role_id: role_id.to_string(),
                name: name.to_string(),
                organization: organization.to_string(),
                created_by_sync,
                definition: Value::Null,
                definition_hash: String::new(),
                acl_ids: Vec::new(),
                last_synced_at: now,
            });
        role.definition = definition.clone();
        role.definition_hash = definition_hash;
        role.last_synced_at = now;
        self.track_resource(ManagedKind::Role, role_id, Some(name), organization, created_by_sync, Some(&definition));
    }

    pub fn track_acl(&mut self, acl: AclState) {
        let key = org_key(&acl.acl_id, &acl.organization);
        let role_key = org_key(&acl.role_id, &acl.organization);
        if let Some(role) = self.managed_roles.get_mut(&role_key) {
            if !role.acl_ids.contains(&acl.acl_id) {
                role.acl_ids.push(acl.acl_id.clone());
            }
        }
        let name = format!("{}:{}:{}", acl.group_name, acl.role_name, acl.project_name);
        self.track_resource(
            ManagedKind::Acl,
            &acl.acl_id,
            Some(&name),
            &acl.organization,
            acl.created_by_sync,
            None,
        );
        match self.managed_acls.get_mut(&key) {
            Some(existing) => {
                existing.permissions = acl.permissions;
                existing.last_synced_at = Utc::now();
            }
            None => {
                self.managed_acls.insert(key, acl);
            }
        }
    }

    pub fn track_project(
        &mut self,
        project_id: &str,
        name: &str,
        organization: &str,
        matched_patterns: Vec<String>,
    ) {
        let now = Utc::now();
        let project = self
            .discovered_projects
            .entry(org_key(project_id, organization))
            .or_insert_with(|| ProjectState {
                project_id: project_id.to_string(),
                name: name.to_string(),
                organization: organization.to_string(),
                discovered_at: now,
                last_seen_at: now,
                matched_patterns: Vec::new(),
            });
        project.last_seen_at = now;
        if !matched_patterns.is_empty() {
            project.matched_patterns = matched_patterns;
        }
    }

    /// Appends warnings and flags the managed resources they concern.
    pub fn record_drift(&mut self, warnings: &[DriftWarning]) {
        for warning in warnings {
            let key = resource_key(warning.kind, &warning.resource_id, &warning.organization);
            if let Some(resource) = self.managed_resources.get_mut(&key) {
                resource.mark_drift(warning.details.clone());
            }
        }
        self.drift_warnings.extend_from_slice(warnings);
        self.last_drift_check = Some(Utc::now());
    }

    /// Drops managed resources and projects not synced since `now - max_age_days`.
    pub fn cleanup_stale_resources(&mut self, max_age_days: i64, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(max_age_days);
        let before = self.managed_resources.len() + self.discovered_projects.len();
        self.managed_resources
            .retain(|_, resource| resource.last_synced_at >= cutoff);
        self.discovered_projects
            .retain(|_, project| project.last_seen_at >= cutoff);
        before - (self.managed_resources.len() + self.discovered_projects.len())
    }

    pub fn managed_summary(&self) -> Value {
        serde_json::json!({
            "total_managed_resources": self.managed_resources.len(),
            "managed_roles": self.managed_roles.len(),
            "managed_acls": self.managed_acls.len(),
            "discovered_projects": self.discovered_projects.len(),
            "drift_warnings": self.drift_warnings.len(),
            "resources_with_drift": self
                .managed_resources
                .values()
                .filter(|resource| resource.status == ManagementStatus::DriftDetected)
                .count(),
            "last_drift_check": self.last_drift_check,
        })
    }
}

/// Stores sync states as `<dir>/<sync_id>.json`; IDs sort chronologically.
pub struct StateManager {
    dir: PathBuf,
}

pub(super) fn io_error(path: &Path, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl StateManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, sync_id: &str) -> PathBuf {
        self.dir.join(format!("{sync_id}.json"))
    }

    fn backup_path(&self, sync_id: &str) -> PathBuf {
        self.dir.join(format!("{sync_id}.json.backup"))
    }

    pub fn create(&self, config_snapshot: Value) -> SyncState {
        let base = format!("{STATE_PREFIX}{}", Utc::now().format("%Y%m%d%H%M%S%3f"));
        let mut sync_id = base.clone();
        let mut suffix = 1;
        while self.path_for(&sync_id).exists() {
            sync_id = format!("{base}_{suffix}");
            suffix += 1;
        }
        info!(target: "orgmigrate", event = "sync_state_created", sync_id = %sync_id);
        SyncState::new(sync_id, config_snapshot)
    }

    /// Writes the state; an existing file is kept as `<id>.json.backup`.
    pub fn save(&self, state: &SyncState) -> Result<PathBuf, SyncError> {
        fs::create_dir_all(&self.dir).map_err(|err| io_error(&self.dir, err))?;
        let path = self.path_for(&state.sync_id);
        if path.exists() {
            let backup = self.backup_path(&state.sync_id);
            fs::rename(&path, &backup).map_err(|err| io_error(&backup, err))?;
        }
        write_json(&path, state)?;
        Ok(path)
    }

    pub fn load(&self, sync_id: &str) -> Result<SyncState, SyncError> {
        let path = self.path_for(sync_id);
        if !path.exists() {
            return Err(SyncError::StateNotFound(sync_id.to_string()));
        }
        let raw = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
        serde_json::from_str(&raw).map_err(|source| SyncError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Saved sync IDs, oldest first.
    pub fn list(&self) -> Result<Vec<String>, SyncError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|err| io_error(&self.dir, err))?;
        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(STATE_PREFIX))
            .filter_map(|name| name.strip_suffix(".json").map(str::to_string))
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn latest(&self) -> Result<Option<SyncState>, SyncError> {
        match self.list()?.last() {
            Some(sync_id) => self.load(sync_id).map(Some),
            None => Ok(None),
        }
    }

    /// Copies the state to `<dir>/checkpoints/<id>_<name>.json`.
    pub fn checkpoint(&self, state: &SyncState, name: &str) -> Result<PathBuf, SyncError> {
        let dir = self.dir.join(CHECKPOINT_DIR);
        fs::create_dir_all(&dir).map_err(|err| io_error(&dir, err))?;
        let path = dir.join(format!("{}_{name}.json", state.sync_id));
        write_json(&path, state)?;
        info!(target: "orgmigrate", event = "sync_checkpoint_written", sync_id = %state.sync_id, checkpoint = name);
        Ok(path)
    }

    /// Keeps the `keep` newest states and removes the rest with their backups.
    pub fn cleanup_old(&self, keep: usize) -> Result<usize, SyncError> {
        let ids = self.list()?;
        let excess = ids.len().saturating_sub(keep);
        for sync_id in &ids[..excess] {
            let path = self.path_for(sync_id);
            fs::remove_file(&path).map_err(|err| io_error(&path, err))?;
            let backup = self.backup_path(sync_id);
            if backup.exists() {
                if let Err(err) = fs::remove_file(&backup) {
                    warn!(target: "orgmigrate", event = "sync_backup_cleanup_failed", path = %backup.display(), error = %err);
                }
            }
        }
        if excess > 0 {
            info!(target: "orgmigrate", event = "sync_states_cleaned", removed = excess, kept = ids.len() - excess);
        }
        Ok(excess)
    }
}

fn write_json(path: &Path, state: &SyncState) -> Result<(), SyncError> {
    let body = serde_json::to_string_pretty(state).map_err(|source| SyncError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    fs::write(path, body).map_err(|err| io_error(path, err))
}
