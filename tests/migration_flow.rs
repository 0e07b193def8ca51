#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use serde_json::json;
use tempfile::TempDir;

use orgmigrate_lib::checkpoint::{state_file_path, MigrationState, SkipReason};
use orgmigrate_lib::client::memory::{InMemoryClient, ResponseShape};
use orgmigrate_lib::client::{EventObject, ObjectKind};
use util::{assert_totals_add_up, migrate, migration_config, seeded_source};

#[tokio::test]
async fn second_full_run_creates_nothing() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let dest = InMemoryClient::new("dest").with_shape(ResponseShape::Paginated(1));

    let first = migrate(&source, &dest, &migration_config(&dir.path().join("first"))).await;
    assert!(first.success(), "{:?}", first.report.migration_summary.errors);
    assert_totals_add_up(&first.report);
    // Role, group, two datasets, tag and two log rows.
    assert_eq!(first.report.migration_summary.migrated_resources, 7);
    assert_eq!(first.report.migration_summary.total_projects, 1);
    let creates = dest.create_count();
    // 5 resources plus the destination project; logs are inserted, not created.
    assert_eq!(creates, 6);
    let dest_project = dest.created(ObjectKind::Project)[0].id().unwrap().to_string();
    let dest_logs = EventObject::new(ObjectKind::ProjectLogs, dest_project);
    assert_eq!(dest.events(&dest_logs).len(), 2);

    // A fresh state directory has no checkpoints, so every skip comes from
    // what the destination already holds.
    let second = migrate(&source, &dest, &migration_config(&dir.path().join("second"))).await;
    assert!(second.success());
    assert_totals_add_up(&second.report);
    assert_eq!(second.report.migration_summary.migrated_resources, 0);
    assert_eq!(second.report.migration_summary.skipped_resources, 7);
    assert_eq!(second.report.projects["alpha"].resources["logs"].skipped, 2);
    assert_eq!(dest.create_count(), creates);
    assert_eq!(dest.events(&dest_logs).len(), 2);
}

#[tokio::test]
async fn renamed_resource_is_migrated_again() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let dest = InMemoryClient::new("dest");
    let mut config = migration_config(dir.path());
    config.resources = vec!["datasets".into()];

    migrate(&source, &dest, &config).await;
    source.replace(
        ObjectKind::Dataset,
        "d1",
        json!({ "id": "d1", "name": "golden v2", "project_id": "p1" }),
    );
    let outcome = migrate(&source, &dest, &config).await;

    let datasets = &outcome.report.projects["alpha"].resources["datasets"];
    assert_eq!((datasets.migrated, datasets.skipped), (1, 1));
    assert_eq!(dest.created(ObjectKind::Dataset).len(), 3);
}

#[tokio::test]
async fn one_bad_resource_does_not_stop_the_rest() {
    let dir = TempDir::new().unwrap();
    let source = InMemoryClient::new("source");
    source.insert(ObjectKind::Project, json!({ "id": "p1", "name": "alpha" }));
    for i in 0..5 {
        source.insert(
            ObjectKind::Dataset,
            json!({ "id": format!("d{i}"), "name": format!("set {i}"), "project_id": "p1" }),
        );
    }
    let dest = InMemoryClient::new("dest");
    dest.reject_create(ObjectKind::Dataset, "set 2");
    let mut config = migration_config(dir.path());
    config.resources = vec!["datasets".into()];

    let outcome = migrate(&source, &dest, &config).await;
    assert!(!outcome.success());
    assert_totals_add_up(&outcome.report);
    let datasets = &outcome.report.projects["alpha"].resources["datasets"];
    assert_eq!((datasets.migrated, datasets.failed), (4, 1));

    let failed = &outcome.report.detailed_breakdown.failed;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].source_id, "d2");
    assert!(failed[0].error.as_deref().unwrap().contains("d2"));
    let mut names: Vec<_> = dest
        .created(ObjectKind::Dataset)
        .iter()
        .filter_map(|dataset| dataset.name().map(str::to_string))
        .collect();
    names.sort();
    assert_eq!(names, ["set 0", "set 1", "set 3", "set 4"]);
}

#[tokio::test]
async fn acl_with_unresolved_group_is_never_created() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    source.insert(
        ObjectKind::Acl,
        json!({ "id": "a1", "object_type": "project", "object_id": "p1", "group_id": "g1", "permission": "read" }),
    );
    let dest = InMemoryClient::new("dest");
    let mut config = migration_config(dir.path());
    config.resources = vec!["acls".into()];

    let outcome = migrate(&source, &dest, &config).await;
    let acls = &outcome.report.projects["alpha"].resources["acls"];
    assert_eq!((acls.total, acls.failed), (1, 1));
    assert!(dest.created(ObjectKind::Acl).is_empty());
    let error = outcome.report.detailed_breakdown.failed[0].error.clone().unwrap();
    assert!(error.contains("group_id"), "{error}");
}

#[tokio::test]
async fn acls_follow_migrated_groups_when_selected() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    source.insert(
        ObjectKind::Acl,
        json!({ "id": "a1", "object_type": "project", "object_id": "p1", "group_id": "g1", "role_id": "r1" }),
    );
    let dest = InMemoryClient::new("dest");
    let mut config = migration_config(dir.path());
    config.resources = vec!["roles".into(), "groups".into(), "acls".into()];

    let outcome = migrate(&source, &dest, &config).await;
    assert!(outcome.success(), "{:?}", outcome.report.detailed_breakdown.failed);
    let acl = &dest.created(ObjectKind::Acl)[0];
    let group = &dest.created(ObjectKind::Group)[0];
    let role = &dest.created(ObjectKind::Role)[0];
    assert_eq!(acl.str_field("group_id"), group.id());
    assert_eq!(acl.str_field("role_id"), role.id());
    assert!(group.get("member_users").is_none());
}

#[tokio::test]
async fn prompts_referencing_functions_wait_for_the_final_pass() {
    let dir = TempDir::new().unwrap();
    let source = InMemoryClient::new("source");
    source.insert(ObjectKind::Project, json!({ "id": "p1", "name": "alpha" }));
    source.insert(
        ObjectKind::Prompt,
        json!({ "id": "pa", "name": "A", "slug": "a", "project_id": "p1", "prompt_data": { "prompt": { "type": "chat" } } }),
    );
    source.insert(
        ObjectKind::Function,
        json!({ "id": "f1", "name": "tool", "slug": "tool", "project_id": "p1",
            "origin": { "object_type": "prompt", "object_id": "pa" } }),
    );
    source.insert(
        ObjectKind::Prompt,
        json!({ "id": "pb", "name": "B", "slug": "b", "project_id": "p1",
            "prompt_data": { "tool_functions": [{ "type": "function", "id": "f1" }] } }),
    );
    let dest = InMemoryClient::new("dest");
    let mut config = migration_config(dir.path());
    config.resources = vec!["prompts".into(), "functions".into()];

    let outcome = migrate(&source, &dest, &config).await;
    assert!(outcome.success());
    let project = &outcome.report.projects["alpha"];
    assert_eq!(project.resources["prompts"].migrated, 1);
    assert_eq!(project.resources["functions"].migrated, 1);
    assert_eq!(project.resources["prompts_final"].migrated, 1);

    let prompts = dest.created(ObjectKind::Prompt);
    let function = &dest.created(ObjectKind::Function)[0];
    assert_eq!(prompts[0].name(), Some("A"));
    assert_eq!(prompts[1].name(), Some("B"));
    assert_eq!(function.get("origin").unwrap()["object_id"].as_str(), prompts[0].id());
    assert_eq!(
        prompts[1].get("prompt_data").unwrap()["tool_functions"][0]["id"].as_str(),
        function.id()
    );
}

#[tokio::test]
async fn existing_destination_dataset_is_mapped_and_the_other_created() {
    let dir = TempDir::new().unwrap();
    let source = InMemoryClient::new("source");
    source.insert(ObjectKind::Project, json!({ "id": "p1", "name": "alpha" }));
    source.insert(ObjectKind::Dataset, json!({ "id": "D1", "name": "golden", "project_id": "p1" }));
    source.insert(ObjectKind::Dataset, json!({ "id": "D2", "name": "fresh", "project_id": "p1" }));
    let dest = InMemoryClient::new("dest");
    dest.insert(ObjectKind::Project, json!({ "id": "xp", "name": "alpha" }));
    dest.insert(ObjectKind::Dataset, json!({ "id": "X1", "name": "golden", "project_id": "xp" }));
    let mut config = migration_config(dir.path());
    config.resources = vec!["datasets".into()];

    let outcome = migrate(&source, &dest, &config).await;
    let skipped = &outcome.report.detailed_breakdown.skipped;
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].source_id, "D1");
    assert_eq!(skipped[0].skip_reason, Some(SkipReason::AlreadyExists));
    assert_eq!(outcome.report.detailed_breakdown.migrated[0].source_id, "D2");

    let state = MigrationState::load(&state_file_path(&outcome.run_dir.join("alpha"), "datasets"));
    assert_eq!(state.id_mapping.get("D1").map(String::as_str), Some("X1"));
    assert!(state.id_mapping.contains_key("D2"));
    assert_eq!(dest.created(ObjectKind::Project).len(), 0);
}

#[tokio::test]
async fn unreachable_destination_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let source = seeded_source();
    let dest = InMemoryClient::new("dest");
    dest.fail_health_check();
    let config = migration_config(dir.path());
    let schema = orgmigrate_lib::schema::OpenApiSchema::empty();

    let result = orgmigrate_lib::orchestrator::MigrationOrchestrator::new(&source, &dest, &schema, &config)
        .run()
        .await;
    assert!(result.is_err());
    assert_eq!(dest.create_count(), 0);
}
