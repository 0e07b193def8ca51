use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::config::{GroupAssignment, RoleDefinition, RoleProjectConfig};
use super::state::{normalize_permissions, AclState, SyncState};
use super::SyncError;
use crate::client::{collect_all, ListFilters, ObjectKind, PlatformClient, RetryPolicy};
use crate::resource::Resource;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssignmentOutcome {
    pub roles_created: usize,
    pub roles_updated: usize,
    pub roles_existing: usize,
    pub projects_matched: usize,
    pub acls_created: usize,
    pub acls_existing: usize,
    /// Group ACLs on matched projects that no assignment accounts for.
    pub unmanaged_acls: usize,
    pub errors: Vec<String>,
}

fn project_acl_filters(project_id: &str) -> ListFilters {
    ListFilters::default()
        .with_extra("object_type", "project")
        .with_extra("object_id", project_id)
}

/// Grants group roles on matched projects in one organization.
pub struct RoleProjectAssigner<'a> {
    client: &'a dyn PlatformClient,
    organization: &'a str,
    config: &'a RoleProjectConfig,
    retry: RetryPolicy,
    dry_run: bool,
}

impl<'a> RoleProjectAssigner<'a> {
    pub fn new(
        client: &'a dyn PlatformClient,
        organization: &'a str,
        config: &'a RoleProjectConfig,
        retry: RetryPolicy,
        dry_run: bool,
    ) -> Self {
        Self {
            client,
            organization,
            config,
            retry,
            dry_run,
        }
    }

    pub async fn run(&self, state: &mut SyncState) -> Result<AssignmentOutcome, SyncError> {
        let mut outcome = AssignmentOutcome::default();
        let role_ids = self.ensure_roles(state, &mut outcome).await?;

        let projects = collect_all(self.client, ObjectKind::Project, &ListFilters::default()).await?;
        let groups = collect_all(self.client, ObjectKind::Group, &ListFilters::default()).await?;
        let mut project_acls: BTreeMap<String, Vec<Resource>> = BTreeMap::new();

        for assignment in self.config.ordered_assignments() {
            let Some(group_id) = groups
                .iter()
                .find(|group| group.name() == Some(assignment.group_name.as_str()))
                .and_then(Resource::id)
            else {
                outcome.errors.push(format!("Group '{}' not found", assignment.group_name));
                continue;
            };
            let Some(role_id) = role_ids.get(&assignment.role_name) else {
                outcome.errors.push(format!("Role '{}' not found", assignment.role_name));
                continue;
            };

            let matched = assignment.project_match.select(&projects)?;
            outcome.projects_matched += matched.len();
            for project in matched {
                let (Some(project_id), project_name) = (project.id(), project.name().unwrap_or_default()) else {
                    continue;
                };
                state.track_project(
                    project_id,
                    project_name,
                    self.organization,
                    assignment.project_match.describe_patterns(),
                );
                if !project_acls.contains_key(project_id) {
                    let acls = collect_all(self.client, ObjectKind::Acl, &project_acl_filters(project_id)).await?;
                    project_acls.insert(project_id.to_string(), acls);
                }
                let existing: Option<String> = project_acls
                    .get(project_id)
                    .and_then(|acls| {
                        acls.iter().find(|acl| {
                            acl.str_field("group_id") == Some(group_id)
                                && acl.str_field("role_id") == Some(role_id.as_str())
                                && acl.str_field("restrict_object_type").is_none()
                        })
                    })
                    .and_then(Resource::id)
                    .map(str::to_string);
                let target = AclTarget {
                    assignment,
                    group_id,
                    role_id,
                    project_id,
                    project_name,
                };
                match existing {
                    Some(acl_id) => {
                        state.track_acl(self.acl_state(&target, &acl_id, false));
                        outcome.acls_existing += 1;
                    }
                    None => {
                        if let Some(created) = self.create_acl(state, &target, &mut outcome).await {
                            project_acls.entry(project_id.to_string()).or_default().push(created);
                        }
                    }
                }
            }
        }

        if self.config.remove_unmanaged_acls {
            outcome.unmanaged_acls = self.report_unmanaged(state, &project_acls);
        }
        info!(
            target: "orgmigrate",
            event = "role_assignments_completed",
            organization = self.organization,
            roles_created = outcome.roles_created,
            acls_created = outcome.acls_created,
            acls_existing = outcome.acls_existing,
            errors = outcome.errors.len()
        );
        Ok(outcome)
    }

    /// Makes sure every standard role exists and returns role IDs by name.
    async fn ensure_roles(
        &self,
        state: &mut SyncState,
        outcome: &mut AssignmentOutcome,
    ) -> Result<BTreeMap<String, String>, SyncError> {
        let live = collect_all(self.client, ObjectKind::Role, &ListFilters::default()).await?;
        let mut role_ids: BTreeMap<String, String> = live
            .iter()
            .filter_map(|role| Some((role.name()?.to_string(), role.id()?.to_string())))
            .collect();

        for definition in &self.config.standard_roles {
            let desired = json!(definition.member_permissions);
            match live.iter().find(|role| role.name() == Some(definition.name.as_str())) {
                Some(role) => {
                    let Some(role_id) = role.id() else { continue };
                    let current = role.get("member_permissions").cloned().unwrap_or(Value::Null);
                    let differs = normalize_permissions(&current) != normalize_permissions(&desired);
                    if differs && self.config.update_existing_roles {
                        if !self.dry_run {
                            let mut fields = Map::new();
                            fields.insert("member_permissions".into(), desired.clone());
                            if let Err(err) = self
                                .retry
                                .run("update role", || self.client.update(ObjectKind::Role, role_id, fields.clone()))
                                .await
                            {
                                outcome.errors.push(format!("Failed to update role '{}': {err}", definition.name));
                                continue;
                            }
                            state.track_role(role_id, &definition.name, self.organization, desired, false);
                        }
                        outcome.roles_updated += 1;
                    } else {
                        if differs {
                            warn!(target: "orgmigrate", event = "role_definition_differs", organization = self.organization, role = %definition.name);
                        }
                        state.track_role(role_id, &definition.name, self.organization, current, false);
                        outcome.roles_existing += 1;
                    }
                }
                None if self.config.auto_create_roles => {
                    if let Some(role_id) = self.create_role(state, definition, outcome).await {
                        role_ids.insert(definition.name.clone(), role_id);
                    }
                }
                None => outcome.errors.push(format!(
                    "Role '{}' does not exist and auto_create_roles is disabled",
                    definition.name
                )),
            }
        }
        Ok(role_ids)
    }

    async fn create_role(
        &self,
        state: &mut SyncState,
        definition: &RoleDefinition,
        outcome: &mut AssignmentOutcome,
    ) -> Option<String> {
        outcome.roles_created += 1;
        if self.dry_run {
            info!(target: "orgmigrate", event = "dry_run_create_role", organization = self.organization, role = %definition.name);
            return Some(format!("dry-run:{}", definition.name));
        }
        let mut fields = Map::new();
        fields.insert("name".into(), json!(definition.name));
        fields.insert("description".into(), json!(definition.description));
        fields.insert("member_permissions".into(), json!(definition.member_permissions));
        match self
            .retry
            .run("create role", || self.client.create(ObjectKind::Role, fields.clone()))
            .await
        {
            Ok(created) => {
                let role_id = created.id()?.to_string();
                state.track_role(&role_id, &definition.name, self.organization, json!(definition.member_permissions), true);
                Some(role_id)
            }
            Err(err) => {
                outcome.roles_created -= 1;
                outcome.errors.push(format!("Failed to create role '{}': {err}", definition.name));
                None
            }
        }
    }

    fn acl_state(&self, target: &AclTarget<'_>, acl_id: &str, created_by_sync: bool) -> AclState {
        AclState {
            acl_id: acl_id.to_string(),
            organization: self.organization.to_string(),
            group_id: target.group_id.to_string(),
            group_name: target.assignment.group_name.clone(),
            role_id: target.role_id.to_string(),
            role_name: target.assignment.role_name.clone(),
            project_id: target.project_id.to_string(),
            project_name: target.project_name.to_string(),
            permissions: vec![format!("role:{}", target.role_id)],
            created_by_sync,
            priority: target.assignment.priority,
            last_synced_at: Utc::now(),
        }
    }

    async fn create_acl(
        &self,
        state: &mut SyncState,
        target: &AclTarget<'_>,
        outcome: &mut AssignmentOutcome,
    ) -> Option<Resource> {
        if self.dry_run {
            info!(
                target: "orgmigrate",
                event = "dry_run_create_acl",
                organization = self.organization,
                group = %target.assignment.group_name,
                role = %target.assignment.role_name,
                project = target.project_name
            );
            outcome.acls_created += 1;
            return None;
        }
        let mut fields = Map::new();
        fields.insert("object_type".into(), json!("project"));
        fields.insert("object_id".into(), json!(target.project_id));
        fields.insert("group_id".into(), json!(target.group_id));
        fields.insert("role_id".into(), json!(target.role_id));
        match self
            .retry
            .run("create acl", || self.client.create(ObjectKind::Acl, fields.clone()))
            .await
        {
            Ok(created) => match created.id() {
                Some(acl_id) => {
                    state.track_acl(self.acl_state(target, acl_id, true));
                    outcome.acls_created += 1;
                    Some(created)
                }
                None => {
                    outcome.errors.push(format!(
                        "ACL for '{}' on '{}' was created without an id",
                        target.assignment.group_name, target.project_name
                    ));
                    None
                }
            },
            Err(err) => {
                outcome.errors.push(format!(
                    "Failed to grant '{}' to '{}' on '{}': {err}",
                    target.assignment.role_name, target.assignment.group_name, target.project_name
                ));
                None
            }
        }
    }

    /// Logs group ACLs no assignment manages. Nothing is deleted.
    fn report_unmanaged(&self, state: &SyncState, project_acls: &BTreeMap<String, Vec<Resource>>) -> usize {
        let managed: BTreeSet<&str> = state
            .managed_acls
            .values()
            .filter(|acl| acl.organization == self.organization)
            .map(|acl| acl.acl_id.as_str())
            .collect();
        let mut candidates = 0;
        for (project_id, acls) in project_acls {
            for acl in acls {
                let Some(acl_id) = acl.id() else { continue };
                if acl.str_field("group_id").is_some() && !managed.contains(acl_id) {
                    warn!(
                        target: "orgmigrate",
                        event = "unmanaged_acl_candidate",
                        organization = self.organization,
                        project_id = %project_id,
                        acl_id
                    );
                    candidates += 1;
                }
            }
        }
        candidates
    }
}

struct AclTarget<'t> {
    assignment: &'t GroupAssignment,
    group_id: &'t str,
    role_id: &'t str,
    project_id: &'t str,
    project_name: &'t str,
}
