use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::copy_present;
use crate::client::{collect_all, ListFilters, ObjectKind};
use crate::migrator::{MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

/// Options the destination rejects on create.
const UNSUPPORTED_OPTIONS: &[&str] = &["column_order"];

/// Saved table views. The list endpoint needs an object, so views are
/// discovered per project, dataset and experiment.
pub struct ViewMigrator;

fn object_filters(object_type: &str, object_id: &str) -> ListFilters {
    ListFilters::default()
        .with_extra("object_type", object_type)
        .with_extra("object_id", object_id)
}

fn object_kind(object_type: &str) -> Option<ObjectKind> {
    match object_type {
        "dataset" => Some(ObjectKind::Dataset),
        "experiment" => Some(ObjectKind::Experiment),
        _ => None,
    }
}

/// Destination object for a view, when already known.
fn mapped_object(ctx: &MigrationContext<'_>, resource: &Resource) -> Option<String> {
    let object_id = resource.str_field("object_id")?;
    match resource.str_field("object_type") {
        Some("project") => ctx
            .dest_project_id
            .clone()
            .or_else(|| ctx.mapped(object_id).map(str::to_string)),
        _ => ctx.mapped(object_id).map(str::to_string),
    }
}

fn filtered_options(options: &Value) -> Option<Value> {
    let options = options.as_object()?;
    let kept: Map<String, Value> = options
        .iter()
        .filter(|(key, _)| !UNSUPPORTED_OPTIONS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    (!kept.is_empty()).then_some(Value::Object(kept))
}

#[async_trait]
impl Migrator for ViewMigrator {
    fn resource_name(&self) -> &'static str {
        "views"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::View
    }

    fn schema_type(&self) -> &'static str {
        "View"
    }

    async fn list_source_resources(
        &self,
        ctx: &MigrationContext<'_>,
    ) -> Result<Vec<Resource>, MigrationError> {
        let Some(project_id) = ctx.source_project_id.as_deref() else {
            return Ok(Vec::new());
        };

        let mut objects = vec![("project", project_id.to_string())];
        for (object_type, kind) in [("dataset", ObjectKind::Dataset), ("experiment", ObjectKind::Experiment)] {
            match ctx.list_source(kind).await {
                Ok(items) => objects.extend(
                    items
                        .iter()
                        .filter_map(|item| item.id())
                        .map(|id| (object_type, id.to_string())),
                ),
                Err(err) => warn!(
                    target: "orgmigrate",
                    event = "view_discovery_failed",
                    object_type,
                    error = %err
                ),
            }
        }

        let mut seen = HashSet::new();
        let mut views = Vec::new();
        for (object_type, object_id) in &objects {
            let filters = object_filters(object_type, object_id);
            match collect_all(ctx.source, ObjectKind::View, &filters).await {
                Ok(found) => views.extend(found.into_iter().filter(|view| {
                    view.id().is_some_and(|id| seen.insert(id.to_string()))
                })),
                Err(err) => debug!(
                    target: "orgmigrate",
                    event = "views_unavailable",
                    object_type,
                    object_id = %object_id,
                    error = %err
                ),
            }
        }
        info!(target: "orgmigrate", event = "views_discovered", count = views.len(), objects = objects.len());
        Ok(views)
    }

    async fn resource_exists_in_dest(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<Option<String>, MigrationError> {
        let ctx: &MigrationContext<'_> = ctx;
        let (Some(object_type), Some(dest_object), Some(name)) = (
            resource.str_field("object_type"),
            mapped_object(ctx, resource),
            resource.name(),
        ) else {
            return Ok(None);
        };
        let filters = object_filters(object_type, &dest_object);
        match collect_all(ctx.dest, ObjectKind::View, &filters).await {
            Ok(views) => Ok(views
                .iter()
                .find(|view| view.name() == Some(name))
                .and_then(|view| view.id().map(str::to_string))),
            Err(err) => {
                warn!(target: "orgmigrate", event = "existence_check_failed", resource_type = "views", name, error = %err);
                Ok(None)
            }
        }
    }

    fn dependencies(&self, resource: &Resource) -> Vec<String> {
        match (resource.str_field("object_type"), resource.str_field("object_id")) {
            (Some(object_type), Some(object_id)) if object_type != "project" => {
                vec![object_id.to_string()]
            }
            _ => Vec::new(),
        }
    }

    async fn migrate_resource(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<String, MigrationError> {
        let object_type = resource.str_field("object_type").unwrap_or("project");
        let source_object = resource.str_field("object_id").unwrap_or_default().to_string();
        let dest_object = match mapped_object(ctx, resource) {
            Some(dest_object) => Some(dest_object),
            None => match object_kind(object_type) {
                Some(kind) => ctx.ensure_dependency_mapping(&source_object, kind).await,
                None => None,
            },
        };
        let dest_object = dest_object.ok_or(MigrationError::MissingRequiredDependency {
            resource_type: "views",
            field: "object_id",
            source_id: source_object,
        })?;

        let mut fields = Map::new();
        fields.insert("object_type".into(), json!(object_type));
        fields.insert("object_id".into(), json!(dest_object));
        fields.insert("name".into(), json!(resource.name()));
        copy_present(resource, &mut fields, &["view_type", "view_data"]);
        if let Some(options) = resource.get("options").and_then(filtered_options) {
            fields.insert("options".into(), options);
        }
        ctx.create_in_dest(ObjectKind::View, fields).await
    }
}
