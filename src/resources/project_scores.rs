use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::client::ObjectKind;
use crate::migrator::{list_project_filtered, MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

/// Score definitions. Online scoring config references functions by ID.
pub struct ProjectScoreMigrator;

fn scorer_function_ids(resource: &Resource) -> Vec<String> {
    resource
        .get("config")
        .and_then(|config| config.pointer("/online/scorers"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|scorer| scorer.get("type").and_then(Value::as_str) == Some("function"))
        .filter_map(|scorer| scorer.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn resolve_config(ctx: &MigrationContext<'_>, score: &str, config: &Value) -> Value {
    let mut resolved = config.clone();
    let Some(scorers) = config.pointer("/online/scorers").and_then(Value::as_array) else {
        return resolved;
    };
    let mut kept = Vec::with_capacity(scorers.len());
    for scorer in scorers {
        let is_function = scorer.get("type").and_then(Value::as_str) == Some("function");
        match scorer.get("id").and_then(Value::as_str) {
            Some(source_id) if is_function => match ctx.mapped(source_id) {
                Some(dest_id) => {
                    let mut scorer = scorer.clone();
                    scorer["id"] = json!(dest_id);
                    kept.push(scorer);
                }
                None => warn!(
                    target: "orgmigrate",
                    event = "scorer_unresolved",
                    score,
                    function_id = source_id
                ),
            },
            _ => kept.push(scorer.clone()),
        }
    }
    if let Some(online) = resolved.get_mut("online") {
        online["scorers"] = Value::Array(kept);
    }
    resolved
}

#[async_trait]
impl Migrator for ProjectScoreMigrator {
    fn resource_name(&self) -> &'static str {
        "project_scores"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::ProjectScore
    }

    fn schema_type(&self) -> &'static str {
        "ProjectScore"
    }

    async fn list_source_resources(
        &self,
        ctx: &MigrationContext<'_>,
    ) -> Result<Vec<Resource>, MigrationError> {
        list_project_filtered(ctx, ObjectKind::ProjectScore).await
    }

    fn dependencies(&self, resource: &Resource) -> Vec<String> {
        scorer_function_ids(resource)
    }

    async fn migrate_resource(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<String, MigrationError> {
        let dest_project = resource
            .str_field("project_id")
            .and_then(|source_project| ctx.mapped(source_project))
            .map(str::to_string)
            .or_else(|| ctx.dest_project_id.clone())
            .ok_or_else(|| MigrationError::MissingRequiredDependency {
                resource_type: "project_scores",
                field: "project_id",
                source_id: resource.str_field("project_id").unwrap_or_default().to_string(),
            })?;

        let mut fields = ctx.serialize_for_insert(resource, self.schema_type())?;
        fields.insert("project_id".into(), json!(dest_project));
        if let Some(config) = resource.get("config").filter(|config| !config.is_null()) {
            let score = resource.name().unwrap_or_default();
            fields.insert("config".into(), resolve_config(ctx, score, config));
        }
        ctx.create_in_dest(ObjectKind::ProjectScore, fields).await
    }
}
