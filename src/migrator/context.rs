use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::error::MigrationError;
use crate::checkpoint::{state_file_path, IdMapping, MigrationState};
use crate::client::{collect_all, ClientError, EventObject, ListFilters, ObjectKind, PlatformClient};
use crate::config::SchemaPolicy;
use crate::dependency_cache::{CacheKey, DependencyCache, Side};
use crate::resource::Resource;
use crate::schema::OpenApiSchema;

/// Server-generated fields never sent back on create.
pub const EXCLUDED_FIELDS: &[&str] = &[
    "id",
    "created",
    "_xact_id",
    "xact_id",
    "_object_delete",
    "_pagination_key",
    "comparison_key",
    "project_id",
    "org_id",
];

/// Everything a per-type migrator may touch while processing one resource.
pub struct MigrationContext<'a> {
    pub source: &'a dyn PlatformClient,
    pub dest: &'a dyn PlatformClient,
    pub schema: &'a OpenApiSchema,
    pub schema_policy: SchemaPolicy,
    pub state: MigrationState,
    pub source_project_id: Option<String>,
    pub dest_project_id: Option<String>,
    pub batch_size: usize,
    resource_type: &'static str,
    checkpoint_path: PathBuf,
    local_cache: DependencyCache,
    schema_warned: Mutex<HashSet<String>>,
}

impl<'a> MigrationContext<'a> {
    pub fn new(
        resource_type: &'static str,
        source: &'a dyn PlatformClient,
        dest: &'a dyn PlatformClient,
        schema: &'a OpenApiSchema,
        checkpoint_dir: &Path,
    ) -> Self {
        let checkpoint_path = state_file_path(checkpoint_dir, resource_type);
        let state = MigrationState::load(&checkpoint_path);
        Self {
            source,
            dest,
            schema,
            schema_policy: SchemaPolicy::default(),
            state,
            source_project_id: None,
            dest_project_id: None,
            batch_size: 100,
            resource_type,
            checkpoint_path,
            local_cache: DependencyCache::new(),
            schema_warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn resource_type(&self) -> &'static str {
        self.resource_type
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    pub fn id_mapping(&self) -> &IdMapping {
        &self.state.id_mapping
    }

    pub fn mapped(&self, source_id: &str) -> Option<&str> {
        self.state.dest_id(source_id)
    }

    pub fn save_checkpoint(&self) -> Result<(), MigrationError> {
        self.state.save(&self.checkpoint_path)?;
        Ok(())
    }

    fn scope_for(&self, kind: ObjectKind, side: Side) -> Option<&str> {
        if !kind.is_project_scoped() {
            return None;
        }
        match side {
            Side::Source => self.source_project_id.as_deref(),
            Side::Destination => self.dest_project_id.as_deref(),
        }
    }

    /// Lists source objects of `kind` in this migrator's scope.
    pub async fn list_source(&self, kind: ObjectKind) -> Result<Vec<Resource>, MigrationError> {
        let filters = ListFilters::scoped(self.scope_for(kind, Side::Source));
        Ok(collect_all(self.source, kind, &filters).await?)
    }

    pub async fn list_dest(
        &self,
        kind: ObjectKind,
        filters: ListFilters,
    ) -> Result<Vec<Resource>, MigrationError> {
        let mut filters = filters;
        if filters.project_id.is_none() {
            filters.project_id = self.scope_for(kind, Side::Destination).map(str::to_string);
        }
        Ok(collect_all(self.dest, kind, &filters).await?)
    }

    /// Events already in the destination object, read once per migrator.
    pub async fn dest_events(
        &mut self,
        object: &EventObject,
        page_size: usize,
    ) -> Result<&[Resource], ClientError> {
        let key = CacheKey::new(object.kind, Side::Destination, Some(&object.id));
        self.local_cache
            .get_or_fetch_events(self.dest, &key, object, page_size)
            .await
    }

    /// Finds a destination object with the same name (and equal `extra_fields`).
    ///
    /// Lookup failures are logged and treated as "not found".
    pub async fn find_in_dest_by_name(
        &self,
        kind: ObjectKind,
        resource: &Resource,
        extra_fields: &[&str],
    ) -> Option<String> {
        let name = resource.name()?;
        let dest_project = self.scope_for(kind, Side::Destination);
        let filters = ListFilters::scoped(dest_project).with_name(name);
        let candidates = match collect_all(self.dest, kind, &filters).await {
            Ok(items) => items,
            Err(err) => {
                warn!(
                    target: "orgmigrate",
                    event = "existence_check_failed",
                    resource_type = self.resource_type,
                    name,
                    error = %err
                );
                return None;
            }
        };
        candidates
            .into_iter()
            .find(|candidate| {
                candidate.name() == Some(name)
                    && extra_fields
                        .iter()
                        .all(|field| candidate.get(field) == resource.get(field))
                    && dest_project
                        .map_or(true, |pid| candidate.str_field("project_id") == Some(pid))
            })
            .and_then(|candidate| candidate.id().map(str::to_string))
    }

    /// Returns the destination ID for `dep_id`, discovering it by name when it
    /// is not mapped yet. Exactly one mapping is added on discovery.
    pub async fn ensure_dependency_mapping(
        &mut self,
        dep_id: &str,
        kind: ObjectKind,
    ) -> Option<String> {
        if let Some(dest_id) = self.state.dest_id(dep_id) {
            return Some(dest_id.to_string());
        }

        let source_key = CacheKey::new(kind, Side::Source, self.scope_for(kind, Side::Source));
        let dest_key = CacheKey::new(
            kind,
            Side::Destination,
            self.scope_for(kind, Side::Destination),
        );

        let name = match self.local_cache.get_or_fetch(self.source, &source_key).await {
            Ok(items) => items
                .iter()
                .find(|item| item.id() == Some(dep_id))
                .and_then(|item| item.name().map(str::to_string)),
            Err(err) => {
                warn!(
                    target: "orgmigrate",
                    event = "dependency_lookup_failed",
                    dependency_type = %kind,
                    dep_id,
                    error = %err
                );
                return None;
            }
        };
        let Some(name) = name else {
            debug!(target: "orgmigrate", event = "dependency_not_in_source", dependency_type = %kind, dep_id);
            return None;
        };

        let dest_id = match self.local_cache.get_or_fetch(self.dest, &dest_key).await {
            Ok(items) => items
                .iter()
                .find(|item| item.name() == Some(name.as_str()))
                .and_then(|item| item.id().map(str::to_string)),
            Err(err) => {
                warn!(
                    target: "orgmigrate",
                    event = "dependency_lookup_failed",
                    dependency_type = %kind,
                    dep_id,
                    error = %err
                );
                return None;
            }
        }?;

        self.state.add_mapping(dep_id, dest_id.clone());
        if let Err(err) = self.save_checkpoint() {
            warn!(target: "orgmigrate", event = "checkpoint_save_failed", error = %err);
        }
        info!(
            target: "orgmigrate",
            event = "dependency_mapped",
            dependency_type = %kind,
            source_id = dep_id,
            dest_id = %dest_id,
            name = %name
        );
        Some(dest_id)
    }

    /// Resolves source IDs to destination IDs.
    ///
    /// Non-strict resolution only warns about unmapped IDs; strict resolution
    /// fails on the first one.
    pub fn resolve_dependencies(
        &self,
        dependencies: &[String],
        strict: bool,
    ) -> Result<IdMapping, MigrationError> {
        let mut resolved = IdMapping::new();
        for dep in dependencies {
            match self.state.dest_id(dep) {
                Some(dest_id) => {
                    resolved.insert(dep.clone(), dest_id.to_string());
                }
                None if strict => {
                    return Err(MigrationError::MissingRequiredDependency {
                        resource_type: self.resource_type,
                        field: "dependency",
                        source_id: dep.clone(),
                    });
                }
                None => {
                    self.warn_unresolved(std::slice::from_ref(dep));
                }
            }
        }
        Ok(resolved)
    }

    /// Logs every dependency without a destination mapping and returns how
    /// many there were.
    pub fn warn_unresolved(&self, dependencies: &[String]) -> usize {
        let mut unresolved = 0;
        for dep in dependencies.iter().filter(|dep| self.state.dest_id(dep).is_none()) {
            warn!(
                target: "orgmigrate",
                event = "dependency_unresolved",
                resource_type = self.resource_type,
                dependency = %dep
            );
            unresolved += 1;
        }
        unresolved
    }

    /// Strips server fields and nulls, then filters to the create schema of `type_name`.
    pub fn serialize_for_insert(
        &self,
        resource: &Resource,
        type_name: &str,
    ) -> Result<Map<String, Value>, MigrationError> {
        let source_id = resource.id().unwrap_or_default().to_string();
        let mut fields: Map<String, Value> = resource
            .fields()
            .iter()
            .filter(|(key, value)| !EXCLUDED_FIELDS.contains(&key.as_str()) && !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        match self.schema.create_fields(type_name) {
            Some(allowed) => fields.retain(|key, _| allowed.contains(key)),
            None => match self.schema_policy {
                SchemaPolicy::PassThrough => self.warn_missing_schema(type_name),
                SchemaPolicy::FailClosed => {
                    return Err(MigrationError::SerializationFailed {
                        resource_type: self.resource_type,
                        source_id,
                        reason: format!("no create schema known for {type_name}"),
                    });
                }
            },
        }

        if fields.is_empty() {
            return Err(MigrationError::SerializationFailed {
                resource_type: self.resource_type,
                source_id,
                reason: "no insertable fields remain".to_string(),
            });
        }
        Ok(fields)
    }

    fn warn_missing_schema(&self, type_name: &str) {
        let mut warned = self
            .schema_warned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if warned.insert(type_name.to_string()) {
            warn!(
                target: "orgmigrate",
                event = "schema_missing",
                resource_type = self.resource_type,
                schema = type_name,
                "passing all serialized fields through"
            );
        }
    }

    /// Creates `fields` in the destination and returns the new ID.
    pub async fn create_in_dest(
        &self,
        kind: ObjectKind,
        fields: Map<String, Value>,
    ) -> Result<String, MigrationError> {
        let created = self
            .dest
            .create(kind, fields)
            .await
            .map_err(|err| MigrationError::from_create(self.resource_type, err))?;
        created
            .id()
            .map(str::to_string)
            .ok_or_else(|| MigrationError::CreateRejected {
                resource_type: self.resource_type,
                message: "create response carried no id".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryClient;
    use serde_json::json;
    use tempfile::TempDir;

    fn resource(value: Value) -> Resource {
        Resource::from_value(value).unwrap()
    }

    #[test]
    fn serialization_strips_server_fields_and_nulls() {
        let dir = TempDir::new().unwrap();
        let (source, dest) = (InMemoryClient::new("s"), InMemoryClient::new("d"));
        let schema = OpenApiSchema::empty();
        let ctx = MigrationContext::new("datasets", &source, &dest, &schema, dir.path());
        let fields = ctx
            .serialize_for_insert(
                &resource(json!({
                    "id": "d1", "created": "now", "_xact_id": "1", "project_id": "p",
                    "org_id": "o", "name": "n", "description": null
                })),
                "Dataset",
            )
            .unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["name"], "n");
    }

    #[test]
    fn serialization_honors_schema_and_policy() {
        let dir = TempDir::new().unwrap();
        let (source, dest) = (InMemoryClient::new("s"), InMemoryClient::new("d"));
        let schema = OpenApiSchema::from_document(&json!({
            "components": { "schemas": { "CreateDataset": { "properties": { "name": {} } } } }
        }));
        let mut ctx = MigrationContext::new("datasets", &source, &dest, &schema, dir.path());
        let item = resource(json!({ "id": "d1", "name": "n", "extra": 1 }));
        let fields = ctx.serialize_for_insert(&item, "Dataset").unwrap();
        assert!(!fields.contains_key("extra"));

        assert!(ctx.serialize_for_insert(&item, "View").is_ok());
        ctx.schema_policy = SchemaPolicy::FailClosed;
        let err = ctx.serialize_for_insert(&item, "View").unwrap_err();
        assert!(matches!(err, MigrationError::SerializationFailed { .. }));

        let bare = resource(json!({ "id": "d2", "project_id": "p" }));
        assert!(ctx.serialize_for_insert(&bare, "Dataset").is_err());
    }

    #[test]
    fn strict_resolution_fails_on_unmapped_ids() {
        let dir = TempDir::new().unwrap();
        let (source, dest) = (InMemoryClient::new("s"), InMemoryClient::new("d"));
        let schema = OpenApiSchema::empty();
        let mut ctx = MigrationContext::new("roles", &source, &dest, &schema, dir.path());
        ctx.state.add_mapping("r1", "r1-dest");
        let deps = vec!["r1".to_string(), "r2".to_string()];
        let lenient = ctx.resolve_dependencies(&deps, false).unwrap();
        assert_eq!(lenient.len(), 1);
        assert!(ctx.resolve_dependencies(&deps, true).is_err());
        assert_eq!(ctx.warn_unresolved(&deps), 1);
        assert_eq!(ctx.warn_unresolved(&deps[..1]), 0);
    }

    #[tokio::test]
    async fn ensure_mapping_discovers_single_dependency_by_name() {
        let dir = TempDir::new().unwrap();
        let source = InMemoryClient::new("s");
        let dest = InMemoryClient::new("d");
        source.insert(ObjectKind::Dataset, json!({ "id": "ds1", "name": "golden", "project_id": "p1" }));
        source.insert(ObjectKind::Dataset, json!({ "id": "ds2", "name": "other", "project_id": "p1" }));
        dest.insert(ObjectKind::Dataset, json!({ "id": "dd1", "name": "golden", "project_id": "p2" }));
        dest.insert(ObjectKind::Dataset, json!({ "id": "dd2", "name": "other", "project_id": "p2" }));
        let schema = OpenApiSchema::empty();
        let mut ctx = MigrationContext::new("functions", &source, &dest, &schema, dir.path());
        ctx.source_project_id = Some("p1".into());
        ctx.dest_project_id = Some("p2".into());

        let found = ctx.ensure_dependency_mapping("ds1", ObjectKind::Dataset).await;
        assert_eq!(found.as_deref(), Some("dd1"));
        assert_eq!(ctx.id_mapping().len(), 1);
        assert!(ctx.checkpoint_path().exists());
        assert_eq!(ctx.ensure_dependency_mapping("missing", ObjectKind::Dataset).await, None);
    }

    #[tokio::test]
    async fn name_lookup_requires_matching_extra_fields() {
        let dir = TempDir::new().unwrap();
        let (source, dest) = (InMemoryClient::new("s"), InMemoryClient::new("d"));
        dest.insert(
            ObjectKind::Prompt,
            json!({ "id": "x", "name": "greet", "slug": "greet-v1", "project_id": "p2" }),
        );
        let schema = OpenApiSchema::empty();
        let mut ctx = MigrationContext::new("prompts", &source, &dest, &schema, dir.path());
        ctx.dest_project_id = Some("p2".into());
        let same = resource(json!({ "id": "a", "name": "greet", "slug": "greet-v1" }));
        let other = resource(json!({ "id": "b", "name": "greet", "slug": "greet-v2" }));
        assert_eq!(
            ctx.find_in_dest_by_name(ObjectKind::Prompt, &same, &["slug"]).await.as_deref(),
            Some("x")
        );
        assert_eq!(ctx.find_in_dest_by_name(ObjectKind::Prompt, &other, &["slug"]).await, None);
    }
}
