use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::config::SyncConfig;
use super::identity::{DirectoryGroup, DirectoryUser, IdentityProvider};
use super::state::{short_hash, ManagedKind, SyncState};
use super::SyncError;
use crate::client::{collect_all, ListFilters, ObjectKind, PlatformClient};
use crate::resource::Resource;

/// Target organizations by name.
pub type OrgClients<'a> = BTreeMap<String, &'a dyn PlatformClient>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Skip,
    Delete,
    Error,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Skip => "skip",
            SyncAction::Delete => "delete",
            SyncAction::Error => "error",
        }
    }

    /// Estimated minutes per item.
    fn estimate(&self) -> f64 {
        match self {
            SyncAction::Create => 0.5,
            SyncAction::Update => 0.3,
            SyncAction::Skip => 0.1,
            SyncAction::Delete | SyncAction::Error => 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub directory_id: String,
    pub kind: ManagedKind,
    pub organization: String,
    /// Email for users, platform name for groups.
    pub identifier: String,
    pub action: SyncAction,
    pub reason: String,
    pub existing_id: Option<String>,
    #[serde(default)]
    pub proposed_changes: Map<String, Value>,
    /// Directory IDs of user creates this item waits for.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Directory user IDs of a group's members.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub plan_id: String,
    pub config_hash: String,
    pub target_organizations: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub user_items: Vec<PlanItem>,
    pub group_items: Vec<PlanItem>,
    pub estimated_duration_minutes: f64,
    pub warnings: Vec<String>,
}

impl SyncPlan {
    /// Users first, then groups.
    pub fn items(&self) -> impl Iterator<Item = &PlanItem> {
        self.user_items.iter().chain(self.group_items.iter())
    }

    pub fn total_items(&self) -> usize {
        self.user_items.len() + self.group_items.len()
    }

    pub fn count(&self, action: SyncAction) -> usize {
        self.items().filter(|item| item.action == action).count()
    }

    pub fn items_by_action(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for item in self.items() {
            *counts.entry(item.action.as_str()).or_insert(0) += 1;
        }
        counts
    }

    pub fn items_by_org(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for item in self.items() {
            *counts.entry(item.organization.as_str()).or_insert(0) += 1;
        }
        counts
    }

    pub fn summary(&self) -> Value {
        json!({
            "plan_id": self.plan_id,
            "config_hash": self.config_hash,
            "target_organizations": self.target_organizations,
            "total_items": self.total_items(),
            "items_by_action": self.items_by_action(),
            "items_by_org": self.items_by_org(),
            "estimated_duration_minutes": self.estimated_duration_minutes,
            "warnings": self.warnings,
        })
    }

    fn estimate_duration(&self) -> f64 {
        let items: f64 = self.items().map(|item| item.action.estimate()).sum();
        let minutes = items * 1.2 + self.target_organizations.len() as f64 * 0.5;
        (minutes * 100.0).round() / 100.0
    }

    fn generate_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let total = self.total_items();
        if total > 1000 {
            warnings.push(format!(
                "Large sync plan with {total} items. Consider running in smaller batches for better error recovery."
            ));
        }
        let creates = self.count(SyncAction::Create);
        if creates > 100 {
            warnings.push(format!(
                "Plan includes {creates} resource creations. Ensure sufficient API rate limits and consider a dry run first."
            ));
        }
        if self.target_organizations.len() > 1 {
            warnings.push(
                "Syncing to multiple organizations. Ensure consistent identity mapping across organizations.".into(),
            );
        }
        let creates_of = |items: &[PlanItem]| items.iter().filter(|i| i.action == SyncAction::Create).count();
        let (user_creates, group_creates) = (creates_of(&self.user_items), creates_of(&self.group_items));
        if user_creates > 0 && group_creates > 0 {
            warnings.push(format!(
                "Plan includes {group_creates} group creations and {user_creates} user creations. Users are created before groups."
            ));
        }
        if total == 0 {
            warnings.push("No sync operations planned. All resources may already be up to date.".into());
        } else if self.count(SyncAction::Skip) == total {
            warnings.push("All planned operations are skips. No changes will be made.".into());
        }
        warnings
    }
}

/// Live objects of one kind in one organization, indexed for matching.
struct LiveIndex<'r> {
    by_id: HashMap<&'r str, &'r Resource>,
    by_identifier: HashMap<String, &'r Resource>,
}

impl<'r> LiveIndex<'r> {
    fn new(resources: &'r [Resource], identifier: impl Fn(&Resource) -> Option<String>) -> Self {
        let mut index = Self {
            by_id: HashMap::new(),
            by_identifier: HashMap::new(),
        };
        for resource in resources {
            if let Some(id) = resource.id() {
                index.by_id.insert(id, resource);
            }
            if let Some(key) = identifier(resource) {
                index.by_identifier.entry(key).or_insert(resource);
            }
        }
        index
    }
}

fn user_identifier(resource: &Resource) -> Option<String> {
    resource.str_field("email").map(|email| email.trim().to_lowercase())
}

fn normalized(value: &Value) -> Value {
    match value {
        Value::Array(items) if items.iter().all(Value::is_string) => {
            let mut sorted = items.clone();
            sorted.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
            Value::Array(sorted)
        }
        other => other.clone(),
    }
}

/// Fields of `desired` that the live object lacks or holds differently.
fn field_diff(desired: &Map<String, Value>, live: &Resource) -> Map<String, Value> {
    desired
        .iter()
        .filter(|(key, value)| {
            live.get(key).map(normalized).as_ref() != Some(&normalized(value))
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

struct Candidate<'c> {
    kind: ManagedKind,
    directory_id: &'c str,
    identifier: String,
    organization: &'c str,
    desired: Map<String, Value>,
    members: Vec<String>,
    /// Forces an update of an existing object, e.g. members still being created.
    pending_changes: Vec<&'static str>,
}

struct Rules {
    create_missing: bool,
    update_existing: bool,
}

impl Candidate<'_> {
    fn item(&self, action: SyncAction, reason: impl Into<String>, existing_id: Option<&str>) -> PlanItem {
        PlanItem {
            directory_id: self.directory_id.to_string(),
            kind: self.kind,
            organization: self.organization.to_string(),
            identifier: self.identifier.clone(),
            action,
            reason: reason.into(),
            existing_id: existing_id.map(str::to_string),
            proposed_changes: Map::new(),
            dependencies: Vec::new(),
            members: self.members.clone(),
        }
    }

    fn update_or_skip(&self, live: &Resource, rules: &Rules, up_to_date: &str) -> PlanItem {
        let mut changes = field_diff(&self.desired, live);
        for key in &self.pending_changes {
            if let Some(value) = self.desired.get(*key) {
                changes.entry(key.to_string()).or_insert_with(|| value.clone());
            }
        }
        if changes.is_empty() {
            return self.item(SyncAction::Skip, up_to_date, live.id());
        }
        if !rules.update_existing {
            return self.item(SyncAction::Skip, "Updates disabled in sync rules", live.id());
        }
        let fields: Vec<&str> = changes.keys().map(String::as_str).collect();
        let mut item = self.item(
            SyncAction::Update,
            format!("Updates needed: {}", fields.join(", ")),
            live.id(),
        );
        item.proposed_changes = changes;
        item
    }

    fn create(&self, reason: &str) -> PlanItem {
        let mut item = self.item(SyncAction::Create, reason, None);
        item.proposed_changes = self.desired.clone();
        item
    }

    fn decide(&self, mapped: Option<&str>, live: &LiveIndex<'_>, rules: &Rules) -> PlanItem {
        match mapped {
            Some(dest_id) => match live.by_id.get(dest_id) {
                Some(resource) => self.update_or_skip(resource, rules, "Resource is up to date"),
                None => self.create("Mapped resource missing in the organization"),
            },
            None => match live.by_identifier.get(&self.identifier) {
                Some(resource) => self.update_or_skip(resource, rules, "Untracked resource is up to date"),
                None if rules.create_missing => self.create("New resource from the identity provider"),
                None => self.item(SyncAction::Skip, "Creation disabled in sync rules", None),
            },
        }
    }
}

/// Computes what a sync would change, without changing anything.
pub struct SyncPlanner<'a> {
    config: &'a SyncConfig,
    identity: &'a dyn IdentityProvider,
    state: Option<&'a SyncState>,
}

impl<'a> SyncPlanner<'a> {
    pub fn new(config: &'a SyncConfig, identity: &'a dyn IdentityProvider, state: Option<&'a SyncState>) -> Self {
        Self {
            config,
            identity,
            state,
        }
    }

    fn mapped(&self, directory_id: &str, organization: &str, kind: ManagedKind) -> Option<&'a str> {
        self.state
            .and_then(|state| state.mapping(directory_id, organization, kind))
    }

    pub async fn plan(&self, targets: &OrgClients<'_>) -> Result<SyncPlan, SyncError> {
        let users = if self.config.users.enabled {
            self.identity.users().await?
        } else {
            Vec::new()
        };
        let groups = if self.config.groups.enabled {
            self.identity.groups().await?
        } else {
            Vec::new()
        };

        let mut plan = SyncPlan {
            plan_id: format!("plan_{}", &Uuid::new_v4().simple().to_string()[..8]),
            config_hash: short_hash(&self.config.rules_snapshot()),
            target_organizations: targets.keys().cloned().collect(),
            created_at: Utc::now(),
            user_items: Vec::new(),
            group_items: Vec::new(),
            estimated_duration_minutes: 0.0,
            warnings: Vec::new(),
        };

        for (organization, client) in targets {
            let user_items = if self.config.users.enabled {
                self.plan_users(&users, organization, *client).await?
            } else {
                Vec::new()
            };
            if self.config.groups.enabled {
                let group_items = self
                    .plan_groups(&groups, &users, &user_items, organization, *client)
                    .await?;
                plan.group_items.extend(group_items);
            }
            plan.user_items.extend(user_items);
        }

        plan.estimated_duration_minutes = plan.estimate_duration();
        plan.warnings = plan.generate_warnings();
        info!(
            target: "orgmigrate",
            event = "sync_plan_generated",
            plan_id = %plan.plan_id,
            total_items = plan.total_items(),
            estimated_minutes = plan.estimated_duration_minutes,
            warnings = plan.warnings.len()
        );
        Ok(plan)
    }

    async fn plan_users(
        &self,
        users: &[DirectoryUser],
        organization: &str,
        client: &dyn PlatformClient,
    ) -> Result<Vec<PlanItem>, SyncError> {
        let rules = &self.config.users;
        let live = collect_all(client, ObjectKind::User, &ListFilters::default()).await?;
        let index = LiveIndex::new(&live, user_identifier);
        let decision_rules = Rules {
            create_missing: rules.create_missing,
            update_existing: rules.update_existing,
        };

        let mut items = Vec::new();
        for user in users {
            if rules.only_active && !user.is_active() {
                debug!(target: "orgmigrate", event = "user_filtered", user_id = %user.id, status = %user.status);
                continue;
            }
            let Some(email) = user.identifier() else {
                items.push(PlanItem {
                    directory_id: user.id.clone(),
                    kind: ManagedKind::User,
                    organization: organization.to_string(),
                    identifier: user.id.clone(),
                    action: SyncAction::Error,
                    reason: "Directory user has no email address".into(),
                    existing_id: None,
                    proposed_changes: Map::new(),
                    dependencies: Vec::new(),
                    members: Vec::new(),
                });
                continue;
            };
            if !rules.accepts_email(&email) {
                debug!(target: "orgmigrate", event = "user_filtered", user_id = %user.id, email = %email);
                continue;
            }

            let mut desired = Map::new();
            desired.insert("email".into(), json!(email));
            desired.insert("given_name".into(), json!(user.given_name));
            desired.insert("family_name".into(), json!(user.family_name));
            let candidate = Candidate {
                kind: ManagedKind::User,
                directory_id: &user.id,
                identifier: email,
                organization,
                desired,
                members: Vec::new(),
                pending_changes: Vec::new(),
            };
            let mapped = self.mapped(&user.id, organization, ManagedKind::User);
            items.push(candidate.decide(mapped, &index, &decision_rules));
        }
        Ok(items)
    }

    async fn plan_groups(
        &self,
        groups: &[DirectoryGroup],
        users: &[DirectoryUser],
        user_items: &[PlanItem],
        organization: &str,
        client: &dyn PlatformClient,
    ) -> Result<Vec<PlanItem>, SyncError> {
        let rules = &self.config.groups;
        let include = rules.include_regexes()?;
        let live = collect_all(client, ObjectKind::Group, &ListFilters::default()).await?;
        let index = LiveIndex::new(&live, |group| group.name().map(str::to_string));
        let live_users = if rules.sync_memberships {
            collect_all(client, ObjectKind::User, &ListFilters::default()).await?
        } else {
            Vec::new()
        };
        let user_index = LiveIndex::new(&live_users, user_identifier);
        let decision_rules = Rules {
            create_missing: rules.create_missing,
            update_existing: rules.update_existing,
        };
        let user_creates: Vec<&str> = user_items
            .iter()
            .filter(|item| item.action == SyncAction::Create)
            .map(|item| item.directory_id.as_str())
            .collect();

        let mut items = Vec::new();
        for group in groups {
            if !include.is_empty() && !include.iter().any(|regex| regex.is_match(&group.name)) {
                debug!(target: "orgmigrate", event = "group_filtered", group_id = %group.id, group_name = %group.name);
                continue;
            }
            let name = rules.platform_name(&group.name);
            let mut desired = Map::new();
            desired.insert("name".into(), json!(name));
            if let Some(description) = &group.description {
                desired.insert("description".into(), json!(description));
            }

            let mut pending_changes = Vec::new();
            if rules.sync_memberships {
                let mut member_ids: Vec<String> = group
                    .members
                    .iter()
                    .filter_map(|member| {
                        self.mapped(member, organization, ManagedKind::User)
                            .map(str::to_string)
                            .or_else(|| {
                                users
                                    .iter()
                                    .find(|user| &user.id == member)
                                    .and_then(DirectoryUser::identifier)
                                    .and_then(|email| user_index.by_identifier.get(&email).copied())
                                    .and_then(|live| live.id().map(str::to_string))
                            })
                    })
                    .collect();
                member_ids.sort();
                member_ids.dedup();
                desired.insert("member_users".into(), json!(member_ids));
                if group.members.iter().any(|member| user_creates.contains(&member.as_str())) {
                    pending_changes.push("member_users");
                }
            }

            let candidate = Candidate {
                kind: ManagedKind::Group,
                directory_id: &group.id,
                identifier: name,
                organization,
                desired,
                members: group.members.clone(),
                pending_changes,
            };
            let mapped = self.mapped(&group.id, organization, ManagedKind::Group);
            let mut item = candidate.decide(mapped, &index, &decision_rules);
            if matches!(item.action, SyncAction::Create | SyncAction::Update) {
                item.dependencies = user_creates.iter().map(|id| id.to_string()).collect();
            }
            items.push(item);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryClient;
    use crate::config::OrgConfig;
    use crate::sync::identity::JsonDirectory;

    fn config() -> SyncConfig {
        let mut orgs = BTreeMap::new();
        orgs.insert("acme".to_string(), OrgConfig::new("key"));
        let mut config = SyncConfig::new(orgs);
        config.groups.name_prefix = "dir-".into();
        config
    }

    fn user(id: &str, email: &str, status: &str) -> DirectoryUser {
        DirectoryUser {
            id: id.into(),
            email: Some(email.into()),
            given_name: "Ada".into(),
            family_name: "L".into(),
            status: status.into(),
        }
    }

    fn directory() -> JsonDirectory {
        JsonDirectory::new(
            vec![
                user("u1", "ada@acme.com", "ACTIVE"),
                user("u2", "bob@acme.com", "ACTIVE"),
                user("u3", "old@acme.com", "DEPROVISIONED"),
                user("u4", "cy@acme.com", "ACTIVE"),
            ],
            vec![DirectoryGroup {
                id: "g1".into(),
                name: "eng".into(),
                description: None,
                members: vec!["u1".into(), "u2".into()],
            }],
        )
    }

    fn by_id<'p>(items: &'p [PlanItem], id: &str) -> &'p PlanItem {
        items.iter().find(|item| item.directory_id == id).unwrap()
    }

    #[tokio::test]
    async fn plans_creates_updates_and_skips() {
        let client = InMemoryClient::new("acme");
        client.insert(ObjectKind::User, json!({ "id": "bt-1", "email": "ada@acme.com", "given_name": "Ada", "family_name": "L" }));
        client.insert(ObjectKind::User, json!({ "id": "bt-4", "email": "cy@acme.com", "given_name": "Cyrus", "family_name": "L" }));
        let mut state = SyncState::new("sync_1", json!({}));
        state.set_mapping("u4", "bt-4", "acme", ManagedKind::User);

        let config = config();
        let directory = directory();
        let planner = SyncPlanner::new(&config, &directory, Some(&state));
        let targets: OrgClients<'_> = [("acme".to_string(), &client as &dyn PlatformClient)].into();
        let plan = planner.plan(&targets).await.unwrap();

        assert_eq!(plan.user_items.len(), 3);
        assert_eq!(by_id(&plan.user_items, "u1").action, SyncAction::Skip);
        assert_eq!(by_id(&plan.user_items, "u1").reason, "Untracked resource is up to date");
        assert_eq!(by_id(&plan.user_items, "u2").action, SyncAction::Create);
        let update = by_id(&plan.user_items, "u4");
        assert_eq!(update.action, SyncAction::Update);
        assert_eq!(update.reason, "Updates needed: given_name");
        assert_eq!(update.existing_id.as_deref(), Some("bt-4"));

        let group = by_id(&plan.group_items, "g1");
        assert_eq!(group.action, SyncAction::Create);
        assert_eq!(group.identifier, "dir-eng");
        assert_eq!(group.dependencies, ["u2"]);
        assert_eq!(group.proposed_changes["member_users"], json!(["bt-1"]));

        assert_eq!(plan.config_hash.len(), 16);
        assert_eq!(plan.items_by_action()["create"], 2);
        assert!(plan.warnings.iter().any(|w| w.contains("1 group creations and 1 user creations")));
        // (0.5 * 2 + 0.3 + 0.1) * 1.2 + 0.5
        assert!((plan.estimated_duration_minutes - 2.18).abs() < 1e-9);
    }

    #[tokio::test]
    async fn mapped_but_missing_resources_are_recreated() {
        let client = InMemoryClient::new("acme");
        let mut state = SyncState::new("sync_1", json!({}));
        state.set_mapping("u1", "bt-gone", "acme", ManagedKind::User);
        let mut config = config();
        config.groups.enabled = false;
        config.users.create_missing = false;

        let directory = directory();
        let planner = SyncPlanner::new(&config, &directory, Some(&state));
        let targets: OrgClients<'_> = [("acme".to_string(), &client as &dyn PlatformClient)].into();
        let plan = planner.plan(&targets).await.unwrap();

        assert_eq!(by_id(&plan.user_items, "u1").action, SyncAction::Create);
        assert_eq!(by_id(&plan.user_items, "u1").reason, "Mapped resource missing in the organization");
        assert_eq!(by_id(&plan.user_items, "u2").reason, "Creation disabled in sync rules");
        assert!(plan.group_items.is_empty());
    }

    #[tokio::test]
    async fn users_without_email_become_error_items() {
        let client = InMemoryClient::new("acme");
        let mut config = config();
        config.groups.enabled = false;
        let directory = JsonDirectory::new(
            vec![DirectoryUser {
                id: "u9".into(),
                email: None,
                given_name: String::new(),
                family_name: String::new(),
                status: "ACTIVE".into(),
            }],
            Vec::new(),
        );
        let planner = SyncPlanner::new(&config, &directory, None);
        let targets: OrgClients<'_> = [("acme".to_string(), &client as &dyn PlatformClient)].into();
        let plan = planner.plan(&targets).await.unwrap();
        assert_eq!(plan.user_items[0].action, SyncAction::Error);
    }

    #[tokio::test]
    async fn empty_and_all_skip_plans_warn() {
        let client = InMemoryClient::new("acme");
        let config = config();
        let empty = JsonDirectory::default();
        let targets: OrgClients<'_> = [("acme".to_string(), &client as &dyn PlatformClient)].into();
        let plan = SyncPlanner::new(&config, &empty, None).plan(&targets).await.unwrap();
        assert!(plan.warnings.iter().any(|w| w.starts_with("No sync operations planned")));

        client.insert(ObjectKind::User, json!({ "id": "bt-1", "email": "ada@acme.com", "given_name": "Ada", "family_name": "L" }));
        let one = JsonDirectory::new(vec![user("u1", "ada@acme.com", "ACTIVE")], Vec::new());
        let plan = SyncPlanner::new(&config, &one, None).plan(&targets).await.unwrap();
        assert!(plan.warnings.iter().any(|w| w.starts_with("All planned operations are skips")));
    }
}
