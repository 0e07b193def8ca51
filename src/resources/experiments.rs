use async_trait::async_trait;
use serde_json::{json, Map};
use tracing::{error, warn};

use super::copy_present;
use super::events::copy_events;
use crate::client::ObjectKind;
use crate::migrator::{MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

/// Experiments and their events. Experiments compared against a base are
/// created after every independent experiment so the base is mapped first.
pub struct ExperimentMigrator;

fn order_independent_first(resources: Vec<Resource>) -> Vec<Resource> {
    let (mut ordered, dependent): (Vec<_>, Vec<_>) = resources
        .into_iter()
        .partition(|experiment| experiment.str_field("base_exp_id").is_none());
    ordered.extend(dependent);
    ordered
}

#[async_trait]
impl Migrator for ExperimentMigrator {
    fn resource_name(&self) -> &'static str {
        "experiments"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Experiment
    }

    fn schema_type(&self) -> &'static str {
        "Experiment"
    }

    async fn list_source_resources(
        &self,
        ctx: &MigrationContext<'_>,
    ) -> Result<Vec<Resource>, MigrationError> {
        let experiments = ctx.list_source(ObjectKind::Experiment).await?;
        Ok(order_independent_first(experiments))
    }

    fn dependencies(&self, resource: &Resource) -> Vec<String> {
        ["dataset_id", "base_exp_id"]
            .iter()
            .filter_map(|field| resource.str_field(field))
            .map(str::to_string)
            .collect()
    }

    fn dependency_types(&self) -> &'static [ObjectKind] {
        &[ObjectKind::Dataset, ObjectKind::Experiment]
    }

    async fn migrate_resource(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<String, MigrationError> {
        let name = resource.name().unwrap_or_default();
        let mut fields = Map::new();
        if let Some(project_id) = &ctx.dest_project_id {
            fields.insert("project_id".into(), json!(project_id));
        }
        fields.insert("name".into(), json!(name));
        copy_present(resource, &mut fields, &["description", "repo_info", "metadata"]);
        if let Some(public) = resource.get("public").filter(|public| public.is_boolean()) {
            fields.insert("public".into(), public.clone());
        }

        if let Some(base) = resource.str_field("base_exp_id") {
            match ctx.mapped(base) {
                Some(dest_base) => {
                    fields.insert("base_exp_id".into(), json!(dest_base));
                }
                None => warn!(
                    target: "orgmigrate",
                    event = "base_experiment_unresolved",
                    experiment = name,
                    base_exp_id = base
                ),
            }
        }
        if let Some(dataset) = resource.str_field("dataset_id") {
            match ctx.mapped(dataset) {
                Some(dest_dataset) => {
                    fields.insert("dataset_id".into(), json!(dest_dataset));
                    copy_present(resource, &mut fields, &["dataset_version"]);
                }
                None => warn!(
                    target: "orgmigrate",
                    event = "experiment_dataset_unresolved",
                    experiment = name,
                    dataset_id = dataset
                ),
            }
        }

        let dest_id = ctx.create_in_dest(ObjectKind::Experiment, fields).await?;
        let source_id = resource.id().unwrap_or_default();
        if let Err(err) = copy_events(
            ctx,
            ObjectKind::Experiment,
            source_id,
            &dest_id,
            "ExperimentEvent",
        )
        .await
        {
            error!(
                target: "orgmigrate",
                event = "experiment_events_failed",
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
    async fn base_experiments_are_created_first_and_referenced() {
        let dir = TempDir::new().unwrap();
        let (source, dest) = (InMemoryClient::new("source"), InMemoryClient::new("dest"));
        source.insert(ObjectKind::Experiment, json!({ "id": "e2", "name": "tuned",
            "project_id": "p1", "base_exp_id": "e1", "public": false }));
        source.insert(ObjectKind::Experiment, json!({ "id": "e1", "name": "baseline",
            "project_id": "p1", "dataset_id": "ds1", "dataset_version": "7" }));
        source.seed_events(
            EventObject::new(ObjectKind::Experiment, "e1"),
            (0..3).map(|i| json!({ "id": format!("ev{i}"), "output": i })).collect(),
        );

        let schema = OpenApiSchema::empty();
        let mut migrator = ResourceMigrator::new(
            Box::new(ExperimentMigrator),
            &source,
            &dest,
            &schema,
            dir.path(),
            &MigrationSettings::default(),
        )
        .with_projects(Some("p1".into()), Some("p2".into()));
        migrator.update_id_mappings(&[("ds1".to_string(), "ds1-dest".to_string())].into());
        let summary = migrator.migrate_all().await.unwrap();
        assert_eq!(summary.migrated, 2);

        let created = dest.created(ObjectKind::Experiment);
        assert_eq!(created[0].name(), Some("baseline"));
        assert_eq!(created[0].str_field("dataset_id"), Some("ds1-dest"));
        assert_eq!(created[0].str_field("dataset_version"), Some("7"));
        assert_eq!(created[1].str_field("base_exp_id"), created[0].id());
        assert_eq!(created[1].get("public"), Some(&json!(false)));

        let base_dest = created[0].id().unwrap().to_string();
        assert_eq!(dest.events(&EventObject::new(ObjectKind::Experiment, base_dest)).len(), 3);
    }

    #[test]
    fn dependencies_cover_dataset_and_base() {
        let resource = Resource::from_value(json!({ "id": "e", "dataset_id": "x", "base_exp_id": "b" })).unwrap();
        assert_eq!(ExperimentMigrator.dependencies(&resource), vec!["x", "b"]);
    }
}
