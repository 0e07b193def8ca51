//! The generic, resumable migration engine.
//!
//! A [`Migrator`] describes one resource type; [`ResourceMigrator`] drives it
//! through batches, consulting and updating the checkpoint as it goes.

mod context;
mod error;
mod summary;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{content_checksum, IdMapping, MigrationState, SkipReason};
use crate::client::{collect_all, ListFilters, ObjectKind, PlatformClient};
use crate::config::MigrationSettings;
use crate::dependency_cache::{CacheKey, DependencyCache, Side};
use crate::resource::Resource;
use crate::schema::OpenApiSchema;

pub use context::{MigrationContext, EXCLUDED_FIELDS};
pub use error::MigrationError;
pub use summary::{ErrorDetail, MigratedDetail, MigrationResult, MigrationSummary, SkippedDetail};

/// Per-resource-type behavior plugged into [`ResourceMigrator`].
#[async_trait]
pub trait Migrator: Send + Sync {
    /// Plural type name; also names the checkpoint file.
    fn resource_name(&self) -> &'static str;

    /// Object kind used for listing and existence checks.
    fn kind(&self) -> ObjectKind;

    /// Schema type name for create filtering (`"Dataset"`).
    fn schema_type(&self) -> &'static str;

    async fn list_source_resources(
        &self,
        ctx: &MigrationContext<'_>,
    ) -> Result<Vec<Resource>, MigrationError> {
        ctx.list_source(self.kind()).await
    }

    /// Fields that must match in addition to `name` for a destination object
    /// to count as the same resource.
    fn existence_match_fields(&self) -> &'static [&'static str] {
        &[]
    }

    async fn resource_exists_in_dest(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<Option<String>, MigrationError> {
        Ok(ctx
            .find_in_dest_by_name(self.kind(), resource, self.existence_match_fields())
            .await)
    }

    async fn migrate_resource(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<String, MigrationError>;

    /// Source IDs this resource references.
    fn dependencies(&self, _resource: &Resource) -> Vec<String> {
        Vec::new()
    }

    /// Kinds whose mappings are pre-populated by name before the run.
    fn dependency_types(&self) -> &'static [ObjectKind] {
        &[]
    }

    fn should_migrate(&self, _resource: &Resource) -> bool {
        true
    }

    /// Types that insert many objects per call return `true` and override
    /// [`Migrator::migrate_bulk`].
    fn supports_bulk(&self) -> bool {
        false
    }

    /// One outcome per input resource, in input order.
    async fn migrate_bulk(
        &self,
        ctx: &mut MigrationContext<'_>,
        resources: &[Resource],
    ) -> Vec<Result<String, MigrationError>> {
        let mut outcomes = Vec::with_capacity(resources.len());
        for resource in resources {
            outcomes.push(self.migrate_resource(ctx, resource).await);
        }
        outcomes
    }
}

/// Drives one [`Migrator`] against one checkpoint directory.
pub struct ResourceMigrator<'a> {
    migrator: Box<dyn Migrator + 'a>,
    ctx: MigrationContext<'a>,
    checkpoint_interval: usize,
    unsaved: usize,
}

impl<'a> ResourceMigrator<'a> {
    pub fn new(
        migrator: Box<dyn Migrator + 'a>,
        source: &'a dyn PlatformClient,
        dest: &'a dyn PlatformClient,
        schema: &'a OpenApiSchema,
        checkpoint_dir: &Path,
        settings: &MigrationSettings,
    ) -> Self {
        let mut ctx = MigrationContext::new(
            migrator.resource_name(),
            source,
            dest,
            schema,
            checkpoint_dir,
        );
        ctx.batch_size = settings.batch_size.max(1);
        ctx.schema_policy = settings.schema_policy;
        Self {
            migrator,
            ctx,
            checkpoint_interval: settings.checkpoint_interval.max(1),
            unsaved: 0,
        }
    }

    pub fn with_projects(
        mut self,
        source_project_id: Option<String>,
        dest_project_id: Option<String>,
    ) -> Self {
        self.ctx.source_project_id = source_project_id;
        self.ctx.dest_project_id = dest_project_id;
        self
    }

    pub fn resource_name(&self) -> &'static str {
        self.migrator.resource_name()
    }

    pub fn state(&self) -> &MigrationState {
        &self.ctx.state
    }

    pub fn id_mapping(&self) -> &IdMapping {
        &self.ctx.state.id_mapping
    }

    pub fn context(&self) -> &MigrationContext<'a> {
        &self.ctx
    }

    pub fn update_id_mappings(&mut self, mappings: &IdMapping) {
        self.ctx.state.merge_mappings(mappings);
    }

    pub async fn ensure_dependency_mapping(
        &mut self,
        dep_id: &str,
        kind: ObjectKind,
    ) -> Option<String> {
        self.ctx.ensure_dependency_mapping(dep_id, kind).await
    }

    /// Name-matches every dependency type between source and destination.
    ///
    /// A failure for one type is logged and the next type is still processed.
    pub async fn populate_dependency_mappings(
        &mut self,
        source_project_id: Option<&str>,
        cache: &mut DependencyCache,
    ) -> Result<(), MigrationError> {
        let types = self.migrator.dependency_types();
        if types.is_empty() {
            return Ok(());
        }

        for &kind in types {
            let (source_scope, dest_scope) = if kind.is_project_scoped() {
                (source_project_id, self.ctx.dest_project_id.as_deref())
            } else {
                (None, None)
            };
            let source_key = CacheKey::new(kind, Side::Source, source_scope);
            let dest_key = CacheKey::new(kind, Side::Destination, dest_scope);

            let source_items = match cache.get_or_fetch(self.ctx.source, &source_key).await {
                Ok(items) => items.to_vec(),
                Err(err) => {
                    warn!(
                        target: "orgmigrate",
                        event = "dependency_population_failed",
                        resource_type = self.resource_name(),
                        dependency_type = %kind,
                        error = %err
                    );
                    continue;
                }
            };
            let dest_by_name: HashMap<String, String> =
                match cache.get_or_fetch(self.ctx.dest, &dest_key).await {
                    Ok(items) => {
                        let mut by_name = HashMap::new();
                        for item in items {
                            if let (Some(name), Some(id)) = (item.name(), item.id()) {
                                by_name
                                    .entry(name.to_string())
                                    .or_insert_with(|| id.to_string());
                            }
                        }
                        by_name
                    }
                    Err(err) => {
                        warn!(
                            target: "orgmigrate",
                            event = "dependency_population_failed",
                            resource_type = self.resource_name(),
                            dependency_type = %kind,
                            error = %err
                        );
                        continue;
                    }
                };

            let mut added = 0usize;
            let mut unmatched = 0usize;
            for item in &source_items {
                let (Some(source_id), Some(name)) = (item.id(), item.name()) else {
                    continue;
                };
                match dest_by_name.get(name) {
                    Some(dest_id) => {
                        if self.ctx.state.dest_id(source_id).is_none() {
                            self.ctx.state.add_mapping(source_id, dest_id.clone());
                            added += 1;
                        }
                    }
                    None => unmatched += 1,
                }
            }
            info!(
                target: "orgmigrate",
                event = "dependency_mappings_populated",
                resource_type = self.resource_name(),
                dependency_type = %kind,
                added,
                unmatched
            );
        }

        self.ctx.save_checkpoint()
    }

    pub fn resolve_dependencies(
        &self,
        dependencies: &[String],
        strict: bool,
    ) -> Result<IdMapping, MigrationError> {
        self.ctx.resolve_dependencies(dependencies, strict)
    }

    /// Processes `batch` in order. Failures are recorded and never abort the batch.
    pub async fn migrate_batch(&mut self, batch: &[Resource]) -> Vec<MigrationResult> {
        if self.migrator.supports_bulk() {
            return self.migrate_batch_bulk(batch).await;
        }
        let mut results = Vec::with_capacity(batch.len());
        for resource in batch {
            let pending = match self.gate(resource).await {
                Gate::Done(result) => {
                    results.push(result);
                    continue;
                }
                Gate::Pending(pending) => pending,
            };
            let outcome = self.migrator.migrate_resource(&mut self.ctx, resource).await;
            results.push(self.finish(pending, outcome));
            self.checkpoint_if_due();
        }
        results
    }

    /// Saves the checkpoint once `checkpoint_interval` resources have been
    /// processed since the last save. Batch ends always save.
    fn checkpoint_if_due(&mut self) {
        self.unsaved += 1;
        if self.unsaved < self.checkpoint_interval {
            return;
        }
        match self.ctx.save_checkpoint() {
            Ok(()) => self.unsaved = 0,
            Err(err) => warn!(
                target: "orgmigrate",
                event = "checkpoint_save_failed",
                resource_type = self.resource_name(),
                error = %err
            ),
        }
    }

    async fn migrate_batch_bulk(&mut self, batch: &[Resource]) -> Vec<MigrationResult> {
        let mut results = Vec::with_capacity(batch.len());
        let mut pending = Vec::new();
        let mut to_insert = Vec::new();
        for resource in batch {
            match self.gate(resource).await {
                Gate::Done(result) => results.push(result),
                Gate::Pending(item) => {
                    pending.push(item);
                    to_insert.push(resource.clone());
                }
            }
        }
        if to_insert.is_empty() {
            return results;
        }
        let outcomes = self.migrator.migrate_bulk(&mut self.ctx, &to_insert).await;
        for (item, outcome) in pending.into_iter().zip(outcomes) {
            results.push(self.finish(item, outcome));
        }
        results
    }

    /// Runs the skip checks for one resource; `Pending` means it must be created.
    async fn gate(&mut self, resource: &Resource) -> Gate {
        let resource_type = self.resource_name();
        let name = resource.name().map(str::to_string);
        let Some(source_id) = resource.id().map(str::to_string) else {
            let message = "Failed to migrate resource: source object has no id".to_string();
            error!(target: "orgmigrate", event = "resource_failed", resource_type, error = %message);
            return Gate::Done(MigrationResult::failed("unknown", message, name));
        };

        if !self.migrator.should_migrate(resource) {
            debug!(target: "orgmigrate", event = "resource_skipped", resource_type, source_id = %source_id, reason = "wrong_pass");
            let dest_id = self.ctx.state.dest_id(&source_id).map(str::to_string);
            self.ctx.state.record_skip(&source_id, SkipReason::WrongPass);
            return Gate::Done(MigrationResult::skipped(
                source_id,
                dest_id,
                SkipReason::WrongPass,
                name,
            ));
        }

        let checksum = content_checksum(&resource.to_value());
        if self.ctx.state.should_skip(&source_id, &checksum) {
            info!(target: "orgmigrate", event = "resource_skipped", resource_type, source_id = %source_id, reason = "unchanged");
            let dest_id = self.ctx.state.dest_id(&source_id).map(str::to_string);
            return Gate::Done(MigrationResult::skipped(
                source_id,
                dest_id,
                SkipReason::Unchanged,
                name,
            ));
        }

        let pending = Pending {
            source_id,
            checksum,
            name,
        };
        match self.migrator.resource_exists_in_dest(&mut self.ctx, resource).await {
            Ok(Some(dest_id)) => {
                info!(
                    target: "orgmigrate",
                    event = "resource_skipped",
                    resource_type,
                    source_id = %pending.source_id,
                    dest_id = %dest_id,
                    reason = "already_exists"
                );
                self.ctx.state.record_success(
                    &pending.source_id,
                    &dest_id,
                    &pending.checksum,
                    name_metadata(&pending.name),
                );
                Gate::Done(
                    MigrationResult::skipped(
                        pending.source_id,
                        Some(dest_id),
                        SkipReason::AlreadyExists,
                        pending.name,
                    )
                    .with_checksum(pending.checksum),
                )
            }
            Ok(None) => {
                let dependencies = self.migrator.dependencies(resource);
                // Unresolved references only warn here; the per-type
                // migrator decides whether they are mandatory.
                self.ctx.warn_unresolved(&dependencies);
                Gate::Pending(pending)
            }
            Err(err) => Gate::Done(self.finish(pending, Err(err))),
        }
    }

    fn finish(&mut self, pending: Pending, outcome: Result<String, MigrationError>) -> MigrationResult {
        let resource_type = self.resource_name();
        let Pending {
            source_id,
            checksum,
            name,
        } = pending;
        match outcome {
            Ok(dest_id) => {
                info!(
                    target: "orgmigrate",
                    event = "resource_migrated",
                    resource_type,
                    source_id = %source_id,
                    dest_id = %dest_id
                );
                self.ctx
                    .state
                    .record_success(&source_id, &dest_id, &checksum, name_metadata(&name));
                MigrationResult::migrated(source_id, dest_id, checksum, name)
            }
            Err(err) => {
                let message = format!("Failed to migrate resource {source_id}: {err}");
                error!(
                    target: "orgmigrate",
                    event = "resource_failed",
                    resource_type,
                    source_id = %source_id,
                    kind = err.kind(),
                    error = %err
                );
                self.ctx.state.record_failure(&source_id, &message);
                MigrationResult::failed(source_id, message, name)
            }
        }
    }

    /// Lists and migrates every source resource, saving after each batch and
    /// every `checkpoint_interval` resources inside one.
    pub async fn migrate_all(&mut self) -> Result<MigrationSummary, MigrationError> {
        let resource_type = self.resource_name();
        let resources = self.migrator.list_source_resources(&self.ctx).await?;
        let total = resources.len();
        info!(target: "orgmigrate", event = "migration_started", resource_type, total);

        let mut summary = MigrationSummary::empty(resource_type);
        if resources.is_empty() {
            return Ok(summary);
        }

        let batch_size = self.ctx.batch_size.max(1);
        let batches = total.div_ceil(batch_size);
        for (index, batch) in resources.chunks(batch_size).enumerate() {
            let results = self.migrate_batch(batch).await;
            summary.absorb(&results);
            self.ctx.save_checkpoint()?;
            self.unsaved = 0;
            info!(
                target: "orgmigrate",
                event = "batch_processed",
                resource_type,
                batch = index + 1,
                batches,
                size = batch.len()
            );
        }

        info!(
            target: "orgmigrate",
            event = "migration_completed",
            resource_type,
            total = summary.total,
            migrated = summary.migrated,
            skipped = summary.skipped,
            failed = summary.failed
        );
        Ok(summary)
    }
}

struct Pending {
    source_id: String,
    checksum: String,
    name: Option<String>,
}

enum Gate {
    Done(MigrationResult),
    Pending(Pending),
}

fn name_metadata(name: &Option<String>) -> Option<serde_json::Value> {
    name.as_ref().map(|name| json!({ "name": name }))
}

/// Lists source objects of `kind` in a project and keeps those with a matching
/// `project_id`, for endpoints that ignore the scope filter.
pub(crate) async fn list_project_filtered(
    ctx: &MigrationContext<'_>,
    kind: ObjectKind,
) -> Result<Vec<Resource>, MigrationError> {
    let items = collect_all(
        ctx.source,
        kind,
        &ListFilters::scoped(ctx.source_project_id.as_deref()),
    )
    .await?;
    Ok(match ctx.source_project_id.as_deref() {
        Some(project_id) => items
            .into_iter()
            .filter(|item| item.str_field("project_id") == Some(project_id))
            .collect(),
        None => items,
    })
}
