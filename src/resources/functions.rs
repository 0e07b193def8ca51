use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::client::ObjectKind;
use crate::migrator::{MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

/// Origin object types whose IDs must be remapped.
const ORIGIN_TYPES: &[&str] = &["prompt", "dataset", "experiment", "project"];

pub struct FunctionMigrator;

fn origin_reference(resource: &Resource) -> Option<(&str, &str)> {
    let object_type = resource.pointer_str("origin.object_type")?;
    let object_id = resource.pointer_str("origin.object_id")?;
    ORIGIN_TYPES
        .contains(&object_type)
        .then_some((object_type, object_id))
}

fn origin_kind(object_type: &str) -> Option<ObjectKind> {
    match object_type {
        "prompt" => Some(ObjectKind::Prompt),
        "dataset" => Some(ObjectKind::Dataset),
        "experiment" => Some(ObjectKind::Experiment),
        _ => None,
    }
}

#[async_trait]
impl Migrator for FunctionMigrator {
    fn resource_name(&self) -> &'static str {
        "functions"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Function
    }

    fn schema_type(&self) -> &'static str {
        "Function"
    }

    fn dependencies(&self, resource: &Resource) -> Vec<String> {
        origin_reference(resource)
            .map(|(_, object_id)| vec![object_id.to_string()])
            .unwrap_or_default()
    }

    fn dependency_types(&self) -> &'static [ObjectKind] {
        &[ObjectKind::Prompt, ObjectKind::Dataset, ObjectKind::Experiment]
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

        if let Some((object_type, object_id)) = origin_reference(resource) {
            let dest_object = match origin_kind(object_type) {
                None => ctx.dest_project_id.clone(),
                Some(kind) => ctx.ensure_dependency_mapping(object_id, kind).await,
            };
            match dest_object {
                Some(dest_id) => {
                    if let Some(origin) = fields.get_mut("origin").and_then(Value::as_object_mut) {
                        origin.insert("object_id".into(), json!(dest_id));
                    }
                }
                None => {
                    warn!(
                        target: "orgmigrate",
                        event = "function_origin_unresolved",
                        function = resource.name().unwrap_or_default(),
                        origin_type = object_type,
                        origin_id = object_id
                    );
                    fields.remove("origin");
                }
            }
        }

        ctx.create_in_dest(ObjectKind::Function, fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryClient;
    use crate::config::MigrationSettings;
    use crate::migrator::ResourceMigrator;
    use crate::schema::OpenApiSchema;
    use tempfile::TempDir;

    async fn run(source: &InMemoryClient, dest: &InMemoryClient) -> Vec<Resource> {
        let dir = TempDir::new().unwrap();
        let schema = OpenApiSchema::empty();
        ResourceMigrator::new(
            Box::new(FunctionMigrator),
            source,
            dest,
            &schema,
            dir.path(),
            &MigrationSettings::default(),
        )
        .with_projects(Some("p1".into()), Some("p2".into()))
        .migrate_all()
        .await
        .unwrap();
        dest.created(ObjectKind::Function)
    }

    #[tokio::test]
    async fn project_origin_points_at_destination_project() {
        let (source, dest) = (InMemoryClient::new("source"), InMemoryClient::new("dest"));
        source.insert(ObjectKind::Function, json!({ "id": "f1", "name": "scorer", "slug": "scorer",
            "project_id": "p1", "origin": { "object_type": "project", "object_id": "p1" } }));
        let created = run(&source, &dest).await;
        assert_eq!(created[0].pointer_str("origin.object_id"), Some("p2"));
    }

    #[tokio::test]
    async fn prompt_origin_is_discovered_by_name_or_dropped() {
        let (source, dest) = (InMemoryClient::new("source"), InMemoryClient::new("dest"));
        source.insert(ObjectKind::Prompt, json!({ "id": "sp", "name": "judge", "project_id": "p1" }));
        dest.insert(ObjectKind::Prompt, json!({ "id": "dp", "name": "judge", "project_id": "p2" }));
        source.insert(ObjectKind::Function, json!({ "id": "f1", "name": "a", "slug": "a",
            "project_id": "p1", "origin": { "object_type": "prompt", "object_id": "sp" } }));
        source.insert(ObjectKind::Function, json!({ "id": "f2", "name": "b", "slug": "b",
            "project_id": "p1", "origin": { "object_type": "dataset", "object_id": "nowhere" } }));
        let created = run(&source, &dest).await;
        let by_name = |name| created.iter().find(|f| f.name() == Some(name)).unwrap();
        assert_eq!(by_name("a").pointer_str("origin.object_id"), Some("dp"));
        assert!(by_name("b").get("origin").is_none());
    }
}
