#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use serde_json::json;
use tempfile::TempDir;

use orgmigrate_lib::client::memory::InMemoryClient;
use orgmigrate_lib::client::{ObjectKind, PlatformClient};
use orgmigrate_lib::sync::config::{GroupAssignment, RoleDefinition, RolePermission, RoleProjectConfig, SyncConfig};
use orgmigrate_lib::sync::drift;
use orgmigrate_lib::sync::executor::{ExecutionOptions, ExecutionReport, SyncExecutor};
use orgmigrate_lib::sync::identity::JsonDirectory;
use orgmigrate_lib::sync::planner::{OrgClients, SyncAction, SyncPlanner};
use orgmigrate_lib::sync::projects::ProjectMatchRule;
use orgmigrate_lib::sync::state::{DriftType, ManagedKind, StateManager, SyncStatus};
use util::{directory, sync_config};

fn role_project() -> RoleProjectConfig {
    RoleProjectConfig {
        standard_roles: vec![RoleDefinition {
            name: "Engineer".into(),
            description: "Project engineers".into(),
            member_permissions: vec![
                RolePermission {
                    permission: "read".into(),
                    restrict_object_type: None,
                },
                RolePermission {
                    permission: "update".into(),
                    restrict_object_type: None,
                },
            ],
        }],
        group_assignments: vec![GroupAssignment {
            group_name: "engineering".into(),
            role_name: "Engineer".into(),
            project_match: ProjectMatchRule {
                name_pattern: Some("ml-.*".into()),
                ..ProjectMatchRule::default()
            },
            enabled: true,
            priority: 0,
        }],
        auto_create_roles: true,
        update_existing_roles: false,
        remove_unmanaged_acls: false,
    }
}

fn acme() -> InMemoryClient {
    let client = InMemoryClient::new("acme");
    client.insert(ObjectKind::Project, json!({ "id": "p1", "name": "ml-core" }));
    client.insert(ObjectKind::Project, json!({ "id": "p2", "name": "ml-eval" }));
    client.insert(ObjectKind::Project, json!({ "id": "p3", "name": "web" }));
    client
}

async fn apply(
    config: &SyncConfig,
    directory: &JsonDirectory,
    states: &StateManager,
    targets: &OrgClients<'_>,
) -> ExecutionReport {
    let previous = states.latest().unwrap();
    let plan = SyncPlanner::new(config, directory, previous.as_ref())
        .plan(targets)
        .await
        .unwrap();
    let mut state = states.create(config.rules_snapshot());
    if let Some(previous) = previous {
        state.inherit(previous);
    }
    SyncExecutor::new(config, targets, states, ExecutionOptions::default())
        .execute(&plan, &mut state)
        .await
        .unwrap()
}

#[tokio::test]
async fn sync_mirrors_the_directory_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut config = sync_config(&["acme", "beta"], dir.path());
    config.role_project = Some(role_project());
    let directory = directory();
    let states = StateManager::new(dir.path());
    let (acme, beta) = (acme(), InMemoryClient::new("beta"));
    let targets: OrgClients<'_> = [
        ("acme".to_string(), &acme as &dyn PlatformClient),
        ("beta".to_string(), &beta as &dyn PlatformClient),
    ]
    .into();

    let first = apply(&config, &directory, &states, &targets).await;
    assert!(first.success(), "{:?}", first.progress.errors);
    // Two active users and two groups per organization; u3 is suspended.
    assert_eq!(first.progress.by_org["acme"].completed, 4);
    assert_eq!(first.progress.by_org["beta"].completed, 4);
    assert_eq!(acme.created(ObjectKind::User).len(), 2);
    assert_eq!(first.assignments["acme"].acls_created, 2);
    assert_eq!(first.assignments["beta"].roles_created, 1);
    assert_eq!(first.assignments["beta"].projects_matched, 0);
    assert!(first.drift_warnings.is_empty());
    let audit = &first.audit.as_ref().unwrap().summary;
    // Four items plus the role assignment pass in each organization.
    assert_eq!(audit.organizations["acme"], 5);
    assert_eq!(audit.operations["assign"], 2);
    assert_eq!(audit.error_events, 0);

    let saved = states.latest().unwrap().unwrap();
    assert_eq!(saved.status, SyncStatus::Completed);
    let u2 = saved.mapping("u2", "acme", ManagedKind::User).unwrap();
    let research = acme
        .created(ObjectKind::Group)
        .into_iter()
        .find(|group| group.name() == Some("research"))
        .unwrap();
    assert_eq!(research.get("member_users"), Some(&json!([u2])));
    assert_ne!(
        saved.mapping("u2", "acme", ManagedKind::User),
        saved.mapping("u2", "beta", ManagedKind::User)
    );

    let (acme_creates, beta_creates) = (acme.create_count(), beta.create_count());
    let second = apply(&config, &directory, &states, &targets).await;
    assert!(second.success());
    assert_eq!(second.progress.completed_items, 0);
    assert_eq!(second.progress.skipped_items, second.progress.total_items);
    assert_eq!(second.assignments["acme"].acls_existing, 2);
    assert_eq!((acme.create_count(), beta.create_count()), (acme_creates, beta_creates));
    assert!(acme.updated().is_empty());
    assert_eq!(states.list().unwrap().len(), 2);
}

#[tokio::test]
async fn directory_changes_become_updates() {
    let dir = TempDir::new().unwrap();
    let config = sync_config(&["acme"], dir.path());
    let states = StateManager::new(dir.path());
    let acme = acme();
    let targets: OrgClients<'_> = [("acme".to_string(), &acme as &dyn PlatformClient)].into();
    apply(&config, &directory(), &states, &targets).await;

    let mut changed = directory();
    changed.users[0].family_name = "Lovelace".into();
    let previous = states.latest().unwrap();
    let plan = SyncPlanner::new(&config, &changed, previous.as_ref())
        .plan(&targets)
        .await
        .unwrap();
    let update = plan
        .user_items
        .iter()
        .find(|item| item.action == SyncAction::Update)
        .unwrap();
    assert_eq!(update.directory_id, "u1");
    assert_eq!(update.reason, "Updates needed: family_name");
    assert_eq!(plan.count(SyncAction::Update), 1);
}

#[tokio::test]
async fn drift_is_reported_after_external_changes() {
    let dir = TempDir::new().unwrap();
    let mut config = sync_config(&["acme"], dir.path());
    config.role_project = Some(role_project());
    let states = StateManager::new(dir.path());
    let acme = acme();
    let targets: OrgClients<'_> = [("acme".to_string(), &acme as &dyn PlatformClient)].into();
    apply(&config, &directory(), &states, &targets).await;

    let mut state = states.latest().unwrap().unwrap();
    let role = acme.created(ObjectKind::Role)[0].clone();
    let role_id = role.id().unwrap().to_string();
    acme.replace(
        ObjectKind::Role,
        &role_id,
        json!({ "id": role_id, "name": "Engineer", "member_permissions": [{ "permission": "delete" }] }),
    );
    let removed = acme.created(ObjectKind::Acl)[0].id().unwrap().to_string();
    acme.remove(ObjectKind::Acl, &removed);

    let warnings = drift::check_organization(&mut state, "acme", &acme).await.unwrap();
    assert_eq!(warnings.len(), 2);
    assert!(warnings
        .iter()
        .any(|w| w.resource_id == role_id && w.drift_type == DriftType::Modified));
    assert!(warnings
        .iter()
        .any(|w| w.resource_id == removed && w.drift_type == DriftType::Deleted));
    assert_eq!(state.drift_warnings.len(), 2);
}

#[test]
fn directory_export_is_read_from_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("directory.json");
    std::fs::write(
        &path,
        r#"{
            "users": [{ "id": "u1", "email": "Ada@Acme.com", "given_name": "Ada", "family_name": "L" }],
            "groups": [{ "id": "g1", "name": "engineering", "members": ["u1"] }]
        }"#,
    )
    .unwrap();
    let directory = JsonDirectory::from_file(&path).unwrap();
    let user = directory.user("u1").unwrap();
    assert!(user.is_active());
    assert_eq!(user.identifier().as_deref(), Some("ada@acme.com"));
    assert_eq!(directory.groups[0].members, ["u1"]);
}
