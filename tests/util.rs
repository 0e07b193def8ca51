#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::json;

use orgmigrate_lib::client::memory::InMemoryClient;
use orgmigrate_lib::client::{EventObject, ObjectKind};
use orgmigrate_lib::config::{Config, OrgConfig};
use orgmigrate_lib::orchestrator::{MigrationOrchestrator, MigrationOutcome};
use orgmigrate_lib::report::{MigrationReport, ResourceCounts};
use orgmigrate_lib::schema::OpenApiSchema;
use orgmigrate_lib::sync::config::SyncConfig;
use orgmigrate_lib::sync::identity::{DirectoryGroup, DirectoryUser, JsonDirectory};

pub fn migration_config(state_dir: &Path) -> Config {
    let mut config = Config::new(OrgConfig::new("source-key"), OrgConfig::new("dest-key"));
    config.state_dir = state_dir.to_path_buf();
    config.openapi_spec_url = None;
    config
}

pub async fn migrate(source: &InMemoryClient, dest: &InMemoryClient, config: &Config) -> MigrationOutcome {
    let schema = OpenApiSchema::empty();
    MigrationOrchestrator::new(source, dest, &schema, config)
        .run()
        .await
        .expect("migration run")
}

/// An organization with one project holding a little of everything.
pub fn seeded_source() -> InMemoryClient {
    let source = InMemoryClient::new("source");
    source.insert(ObjectKind::Role, json!({ "id": "r1", "name": "reviewer", "member_permissions": [{ "permission": "read" }] }));
    source.insert(ObjectKind::Group, json!({ "id": "g1", "name": "eng", "member_users": ["u1"] }));
    source.insert(ObjectKind::Project, json!({ "id": "p1", "name": "alpha" }));
    source.insert(ObjectKind::Dataset, json!({ "id": "d1", "name": "golden", "project_id": "p1" }));
    source.insert(ObjectKind::Dataset, json!({ "id": "d2", "name": "holdout", "project_id": "p1" }));
    source.insert(ObjectKind::ProjectTag, json!({ "id": "t1", "name": "hot", "color": "red", "project_id": "p1" }));
    source.seed_events(
        EventObject::new(ObjectKind::ProjectLogs, "p1"),
        vec![
            json!({ "id": "l1", "input": "hello", "output": "hi", "project_id": "p1" }),
            json!({ "id": "l2", "input": "bye", "output": "ciao", "project_id": "p1" }),
        ],
    );
    source
}

fn check(counts: &ResourceCounts, at: &str) {
    assert_eq!(
        counts.total,
        counts.migrated + counts.skipped + counts.failed,
        "counts at {at} do not add up"
    );
}

pub fn assert_totals_add_up(report: &MigrationReport) {
    let summary = &report.migration_summary;
    assert_eq!(
        summary.total_resources,
        summary.migrated_resources + summary.skipped_resources + summary.failed_resources
    );
    check(&report.organization_resources.totals, "organization");
    for (key, counts) in &report.organization_resources.resources {
        check(counts, key);
    }
    for (name, project) in &report.projects {
        check(&project.totals, name);
        for (key, counts) in &project.resources {
            check(counts, &format!("{name}/{key}"));
        }
    }
}

pub fn sync_config(organizations: &[&str], state_dir: &Path) -> SyncConfig {
    let orgs: BTreeMap<String, OrgConfig> = organizations
        .iter()
        .map(|name| (name.to_string(), OrgConfig::new(format!("{name}-key"))))
        .collect();
    let mut config = SyncConfig::new(orgs);
    config.state_dir = state_dir.to_path_buf();
    config.retry.attempts = 0;
    config
}

pub fn user(id: &str, email: &str) -> DirectoryUser {
    DirectoryUser {
        id: id.into(),
        email: Some(email.into()),
        given_name: id.to_uppercase(),
        family_name: "Doe".into(),
        status: "ACTIVE".into(),
    }
}

pub fn directory() -> JsonDirectory {
    JsonDirectory::new(
        vec![
            user("u1", "ada@acme.com"),
            user("u2", "grace@acme.com"),
            DirectoryUser {
                status: "SUSPENDED".into(),
                ..user("u3", "gone@acme.com")
            },
        ],
        vec![
            DirectoryGroup {
                id: "g1".into(),
                name: "engineering".into(),
                description: Some("Builders".into()),
                members: vec!["u1".into(), "u2".into()],
            },
            DirectoryGroup {
                id: "g2".into(),
                name: "research".into(),
                description: None,
                members: vec!["u2".into(), "u3".into()],
            },
        ],
    )
}
