use std::collections::{BTreeSet, HashSet};

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use super::state::{normalize_permissions, short_hash, DriftType, DriftWarning, ManagedKind, Severity, SyncState};
use super::SyncError;
use crate::client::{collect_all, ListFilters, ObjectKind, PlatformClient};
use crate::resource::Resource;

/// Grants of a live ACL in the form tracked by [`super::state::AclState`].
pub fn acl_grants(acl: &Resource) -> BTreeSet<String> {
    let mut grants = BTreeSet::new();
    if let Some(permission) = acl.str_field("permission") {
        grants.insert(permission.to_string());
    }
    if let Some(role) = acl.str_field("role_id") {
        grants.insert(format!("role:{role}"));
    }
    grants
}

fn warning(
    kind: ManagedKind,
    resource_id: &str,
    resource_name: Option<&str>,
    organization: &str,
    drift_type: DriftType,
    severity: Severity,
    details: String,
) -> DriftWarning {
    DriftWarning {
        kind,
        resource_id: resource_id.to_string(),
        resource_name: resource_name.map(str::to_string),
        organization: organization.to_string(),
        drift_type,
        details,
        severity,
        detected_at: Utc::now(),
    }
}

/// Compares tracked roles and ACLs of `organization` with live objects.
/// Nothing is corrected; the warnings are returned for review.
pub fn detect_drift(
    state: &SyncState,
    organization: &str,
    live_roles: &[Resource],
    live_acls: &[Resource],
) -> Vec<DriftWarning> {
    let mut warnings = Vec::new();

    for role in state.managed_roles.values().filter(|role| role.organization == organization) {
        match live_roles.iter().find(|live| live.id() == Some(role.role_id.as_str())) {
            None if role.created_by_sync => warnings.push(warning(
                ManagedKind::Role,
                &role.role_id,
                Some(&role.name),
                organization,
                DriftType::Deleted,
                Severity::Error,
                format!("Managed role '{}' was deleted externally", role.name),
            )),
            None => {}
            Some(live) => {
                let permissions = normalize_permissions(live.get("member_permissions").unwrap_or(&Value::Null));
                if short_hash(&permissions) != role.definition_hash {
                    warnings.push(warning(
                        ManagedKind::Role,
                        &role.role_id,
                        Some(&role.name),
                        organization,
                        DriftType::Modified,
                        Severity::Warning,
                        format!("Role '{}' permissions were modified externally", role.name),
                    ));
                }
            }
        }
    }

    for acl in state.managed_acls.values().filter(|acl| acl.organization == organization) {
        let name = format!("{}:{}:{}", acl.group_name, acl.role_name, acl.project_name);
        match live_acls.iter().find(|live| live.id() == Some(acl.acl_id.as_str())) {
            None => warnings.push(warning(
                ManagedKind::Acl,
                &acl.acl_id,
                Some(&name),
                organization,
                DriftType::Deleted,
                Severity::Warning,
                format!(
                    "Managed ACL for '{}' on '{}' was deleted",
                    acl.group_name, acl.project_name
                ),
            )),
            Some(live) => {
                let expected: BTreeSet<String> = acl.permissions.iter().cloned().collect();
                let found = acl_grants(live);
                if expected != found {
                    warnings.push(warning(
                        ManagedKind::Acl,
                        &acl.acl_id,
                        Some(&name),
                        organization,
                        DriftType::PermissionChanged,
                        Severity::Warning,
                        format!("ACL permissions changed. Expected: {expected:?}, found: {found:?}"),
                    ));
                }
            }
        }
    }
    warnings
}

/// Re-fetches the roles and project ACLs tracked for `organization`,
/// records the drift found in `state` and returns it.
pub async fn check_organization(
    state: &mut SyncState,
    organization: &str,
    client: &dyn PlatformClient,
) -> Result<Vec<DriftWarning>, SyncError> {
    let live_roles = collect_all(client, ObjectKind::Role, &ListFilters::default()).await?;

    let projects: HashSet<&str> = state
        .managed_acls
        .values()
        .filter(|acl| acl.organization == organization)
        .map(|acl| acl.project_id.as_str())
        .collect();
    let mut live_acls = Vec::new();
    for project_id in projects {
        let filters = ListFilters::default()
            .with_extra("object_type", "project")
            .with_extra("object_id", project_id);
        live_acls.extend(collect_all(client, ObjectKind::Acl, &filters).await?);
    }

    let warnings = detect_drift(state, organization, &live_roles, &live_acls);
    for found in &warnings {
        warn!(
            target: "orgmigrate",
            event = "drift_detected",
            organization,
            kind = found.kind.as_str(),
            resource_id = %found.resource_id,
            drift_type = ?found.drift_type,
            severity = ?found.severity,
            details = %found.details
        );
    }
    state.record_drift(&warnings);
    info!(target: "orgmigrate", event = "drift_check_completed", organization, warnings = warnings.len());
    Ok(warnings)
}
