use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::projects::ProjectMatchRule;
use super::SyncError;
use crate::client::RetryPolicy;
use crate::config::OrgConfig;

/// Permissions a role may carry.
pub const PERMISSIONS: [&str; 8] = [
    "create",
    "read",
    "update",
    "delete",
    "create_acls",
    "read_acls",
    "update_acls",
    "delete_acls",
];

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserRules {
    pub enabled: bool,
    pub create_missing: bool,
    pub update_existing: bool,
    /// Only users whose directory status is `ACTIVE`.
    pub only_active: bool,
    /// Restricts users to these email domains when non-empty.
    pub email_domains: Vec<String>,
}

impl Default for UserRules {
    fn default() -> Self {
        Self {
            enabled: true,
            create_missing: true,
            update_existing: true,
            only_active: true,
            email_domains: Vec::new(),
        }
    }
}

impl UserRules {
    pub fn accepts_email(&self, email: &str) -> bool {
        if self.email_domains.is_empty() {
            return true;
        }
        let Some((_, domain)) = email.rsplit_once('@') else {
            return false;
        };
        self.email_domains
            .iter()
            .any(|allowed| allowed.trim_start_matches('@').eq_ignore_ascii_case(domain))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupRules {
    pub enabled: bool,
    pub create_missing: bool,
    pub update_existing: bool,
    pub name_prefix: String,
    pub name_suffix: String,
    pub sync_memberships: bool,
    /// Regexes searched in the directory group name; empty accepts all.
    pub include_patterns: Vec<String>,
}

impl Default for GroupRules {
    fn default() -> Self {
        Self {
            enabled: true,
            create_missing: true,
            update_existing: true,
            name_prefix: String::new(),
            name_suffix: String::new(),
            sync_memberships: true,
            include_patterns: Vec::new(),
        }
    }
}

impl GroupRules {
    /// Name of the platform group mirroring a directory group.
    pub fn platform_name(&self, group_name: &str) -> String {
        format!("{}{}{}", self.name_prefix, group_name, self.name_suffix)
    }

    pub fn include_regexes(&self) -> Result<Vec<Regex>, SyncError> {
        self.include_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| {
                    SyncError::InvalidConfig(format!("groups.include_patterns '{pattern}': {err}"))
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePermission {
    pub permission: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrict_object_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub member_permissions: Vec<RolePermission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAssignment {
    pub group_name: String,
    pub role_name: String,
    pub project_match: ProjectMatchRule,
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleProjectConfig {
    #[serde(default)]
    pub standard_roles: Vec<RoleDefinition>,
    #[serde(default)]
    pub group_assignments: Vec<GroupAssignment>,
    #[serde(default = "enabled")]
    pub auto_create_roles: bool,
    #[serde(default)]
    pub update_existing_roles: bool,
    /// Accepted for compatibility; candidates are only logged.
    #[serde(default)]
    pub remove_unmanaged_acls: bool,
}

impl RoleProjectConfig {
    /// Enabled assignments, highest priority first, config order within a priority.
    pub fn ordered_assignments(&self) -> Vec<&GroupAssignment> {
        let mut assignments: Vec<&GroupAssignment> =
            self.group_assignments.iter().filter(|a| a.enabled).collect();
        assignments.sort_by(|a, b| b.priority.cmp(&a.priority));
        assignments
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: u32,
    /// Base delay in seconds.
    pub delay: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    pub enabled: bool,
    /// Size at which the current audit file is closed and a new part opened.
    pub max_file_size_mb: u64,
    pub retention_days: u32,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_file_size_mb: 100,
            retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Target organizations by name.
    pub organizations: BTreeMap<String, OrgConfig>,
    /// Directory export read by the JSON identity provider.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub users: UserRules,
    #[serde(default)]
    pub groups: GroupRules,
    #[serde(default)]
    pub role_project: Option<RoleProjectConfig>,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub audit: AuditSettings,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./sync_state")
}

impl SyncConfig {
    pub fn new(organizations: BTreeMap<String, OrgConfig>) -> Self {
        Self {
            organizations,
            identity_file: None,
            users: UserRules::default(),
            groups: GroupRules::default(),
            role_project: None,
            state_dir: default_state_dir(),
            retry: RetrySettings::default(),
            audit: AuditSettings::default(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, SyncError> {
        let raw = fs::read_to_string(path).map_err(|source| SyncError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: SyncConfig = serde_json::from_str(&raw).map_err(|source| SyncError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.attempts,
            Duration::from_secs_f64(self.retry.delay.max(0.0)),
        )
    }

    pub fn validate(&mut self) -> Result<(), SyncError> {
        if self.organizations.is_empty() {
            return Err(SyncError::InvalidConfig("at least one organization is required".into()));
        }
        for (name, org) in self.organizations.iter_mut() {
            org.api_key = org.api_key.trim().to_string();
            if org.api_key.is_empty() {
                return Err(SyncError::InvalidConfig(format!("organization {name}: API key cannot be empty")));
            }
            url::Url::parse(&org.url)
                .map_err(|err| SyncError::InvalidConfig(format!("organization {name}: {err}")))?;
        }
        if self.retry.attempts > 10 {
            return Err(SyncError::InvalidConfig("retry.attempts must be between 0 and 10".into()));
        }
        if self.audit.max_file_size_mb == 0 {
            return Err(SyncError::InvalidConfig("audit.max_file_size_mb must be at least 1".into()));
        }
        if !(1..=3650).contains(&self.audit.retention_days) {
            return Err(SyncError::InvalidConfig("audit.retention_days must be between 1 and 3650".into()));
        }
        self.groups.include_regexes()?;

        if let Some(role_project) = &self.role_project {
            for role in &role_project.standard_roles {
                if role.name.trim().is_empty() {
                    return Err(SyncError::InvalidConfig("role names cannot be empty".into()));
                }
                if role.member_permissions.is_empty() {
                    return Err(SyncError::InvalidConfig(format!(
                        "role {} must have at least one permission",
                        role.name
                    )));
                }
                if let Some(unknown) = role
                    .member_permissions
                    .iter()
                    .find(|grant| !PERMISSIONS.contains(&grant.permission.as_str()))
                {
                    return Err(SyncError::InvalidConfig(format!(
                        "role {}: unknown permission '{}'",
                        role.name, unknown.permission
                    )));
                }
            }
            for assignment in &role_project.group_assignments {
                assignment.project_match.validate()?;
            }
        }
        Ok(())
    }

    /// Rules that decide what a plan contains, used for the plan hash.
    pub fn rules_snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "organizations": self.organizations.keys().collect::<Vec<_>>(),
            "users": self.users,
            "groups": self.groups,
            "role_project": self.role_project,
        })
    }
}
