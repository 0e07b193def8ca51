use async_trait::async_trait;
use serde_json::json;
use tracing::error;

use super::events::copy_events;
use crate::client::ObjectKind;
use crate::migrator::{MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

/// Datasets and their records.
pub struct DatasetMigrator;

#[async_trait]
impl Migrator for DatasetMigrator {
    fn resource_name(&self) -> &'static str {
        "datasets"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Dataset
    }

    fn schema_type(&self) -> &'static str {
        "Dataset"
    }

    async fn migrate_resource(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<String, MigrationError> {
        let mut fields = ctx.serialize_for_insert(resource, self.schema_type())?;
        if let Some(project_id) = &ctx.dest_project_id {
            fields.insert("project_id".into(), json!(project_id));
        }
        let dest_id = ctx.create_in_dest(ObjectKind::Dataset, fields).await?;

        let source_id = resource.id().unwrap_or_default();
        if let Err(err) =
            copy_events(ctx, ObjectKind::Dataset, source_id, &dest_id, "DatasetEvent").await
        {
            error!(
                target: "orgmigrate",
                event = "dataset_records_failed",
                source_id,
                dest_id = %dest_id,
                error = %err
            );
            return Err(err);
        }
        Ok(dest_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryClient;
    use crate::client::EventObject;
    use crate::config::MigrationSettings;
    use crate::migrator::ResourceMigrator;
    use crate::schema::OpenApiSchema;
    use tempfile::TempDir;

    #[tokio::test]
    async fn records_follow_the_dataset_in_bounded_batches() {
        let dir = TempDir::new().unwrap();
        let (source, dest) = (InMemoryClient::new("source"), InMemoryClient::new("dest"));
        source.insert(
            ObjectKind::Dataset,
            json!({ "id": "ds1", "name": "golden", "project_id": "p1" }),
        );
        let records = (0..250)
            .map(|i| json!({ "id": format!("r{i}"), "input": i, "_xact_id": "x", "dataset_id": "ds1" }))
            .collect();
        source.seed_events(EventObject::new(ObjectKind::Dataset, "ds1"), records);

        let schema = OpenApiSchema::empty();
        let mut migrator = ResourceMigrator::new(
            Box::new(DatasetMigrator),
            &source,
            &dest,
            &schema,
            dir.path(),
            &MigrationSettings::default(),
        )
        .with_projects(Some("p1".into()), Some("p2".into()));
        let summary = migrator.migrate_all().await.unwrap();
        assert_eq!(summary.migrated, 1);

        let dest_id = migrator.id_mapping()["ds1"].clone();
        let copied = dest.events(&EventObject::new(ObjectKind::Dataset, dest_id));
        assert_eq!(copied.len(), 250);
        assert!(copied.iter().all(|event| event.get("_xact_id").is_none()));
        assert_eq!(dest.created(ObjectKind::Dataset)[0].str_field("project_id"), Some("p2"));
    }

    #[tokio::test]
    async fn record_copy_failure_fails_the_dataset() {
        let dir = TempDir::new().unwrap();
        let (source, dest) = (InMemoryClient::new("source"), InMemoryClient::new("dest"));
        source.insert(ObjectKind::Dataset, json!({ "id": "ds1", "name": "golden", "project_id": "p1" }));
        source.seed_events(
            EventObject::new(ObjectKind::Dataset, "ds1"),
            vec![json!({ "id": "r1", "input": 1 })],
        );
        dest.fail_inserts(ObjectKind::Dataset);
        let schema = OpenApiSchema::empty();
        let summary = ResourceMigrator::new(
            Box::new(DatasetMigrator),
            &source,
            &dest,
            &schema,
            dir.path(),
            &MigrationSettings::default(),
        )
        .with_projects(Some("p1".into()), Some("p2".into()))
        .migrate_all()
        .await
        .unwrap();
        assert_eq!(summary.failed, 1);
    }
}
