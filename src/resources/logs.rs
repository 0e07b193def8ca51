use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::events::{insert_batch_size, prepare_events};
use crate::client::{fetch_all_events, EventObject, ObjectKind};
use crate::migrator::{MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

const LOG_PAGE_SIZE: usize = 1000;

/// Project log events. Each event is one resource; inserts are batched.
pub struct LogsMigrator;

fn fallback_row_id(source_id: &str) -> String {
    format!("migrated_{source_id}")
}

#[async_trait]
impl Migrator for LogsMigrator {
    fn resource_name(&self) -> &'static str {
        "logs"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::ProjectLogs
    }

    fn schema_type(&self) -> &'static str {
        "Log"
    }

    async fn list_source_resources(
        &self,
        ctx: &MigrationContext<'_>,
    ) -> Result<Vec<Resource>, MigrationError> {
        let Some(project_id) = ctx.source_project_id.as_deref() else {
            return Ok(Vec::new());
        };
        let object = EventObject::new(ObjectKind::ProjectLogs, project_id);
        let events = fetch_all_events(ctx.source, &object, LOG_PAGE_SIZE).await?;
        Ok(events.into_iter().filter_map(Resource::from_value).collect())
    }

    /// Inserted rows keep their source `id`, so a row already present in the
    /// destination project is found by that id. Lookup failures count as "not found".
    async fn resource_exists_in_dest(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<Option<String>, MigrationError> {
        let (Some(dest_project), Some(source_id)) = (ctx.dest_project_id.clone(), resource.id()) else {
            return Ok(None);
        };
        let object = EventObject::new(ObjectKind::ProjectLogs, dest_project);
        match ctx.dest_events(&object, LOG_PAGE_SIZE).await {
            Ok(rows) => Ok(rows
                .iter()
                .find(|row| row.id() == Some(source_id))
                .and_then(|row| row.id().map(str::to_string))),
            Err(err) => {
                warn!(target: "orgmigrate", event = "existence_check_failed", resource_type = "logs", error = %err);
                Ok(None)
            }
        }
    }

    async fn migrate_resource(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<String, MigrationError> {
        self.migrate_bulk(ctx, std::slice::from_ref(resource))
            .await
            .pop()
            .unwrap_or_else(|| {
                Err(MigrationError::SerializationFailed {
                    resource_type: "logs",
                    source_id: resource.id().unwrap_or_default().to_string(),
                    reason: "event produced no outcome".to_string(),
                })
            })
    }

    fn supports_bulk(&self) -> bool {
        true
    }

    async fn migrate_bulk(
        &self,
        ctx: &mut MigrationContext<'_>,
        resources: &[Resource],
    ) -> Vec<Result<String, MigrationError>> {
        let Some(dest_project) = ctx.dest_project_id.clone() else {
            return resources
                .iter()
                .map(|_| {
                    Err(MigrationError::MissingRequiredDependency {
                        resource_type: "logs",
                        field: "project_id",
                        source_id: ctx.source_project_id.clone().unwrap_or_default(),
                    })
                })
                .collect();
        };

        // Serialize each event on its own so one bad row fails alone.
        let mut outcomes: Vec<Option<Result<String, MigrationError>>> =
            Vec::with_capacity(resources.len());
        let mut queued: Vec<(usize, Value)> = Vec::new();
        for (index, resource) in resources.iter().enumerate() {
            let prepared = prepare_events(ctx, vec![resource.to_value()], self.schema_type());
            match prepared.into_iter().next() {
                Some(event) => {
                    outcomes.push(None);
                    queued.push((index, event));
                }
                None => outcomes.push(Some(Err(MigrationError::SerializationFailed {
                    resource_type: "logs",
                    source_id: resource.id().unwrap_or_default().to_string(),
                    reason: "no insertable fields remain".to_string(),
                }))),
            }
        }

        let dest_object = EventObject::new(ObjectKind::ProjectLogs, dest_project);
        for chunk in queued.chunks(insert_batch_size(ctx)) {
            let events: Vec<Value> = chunk.iter().map(|(_, event)| event.clone()).collect();
            match ctx.dest.insert_events(&dest_object, events).await {
                Ok(row_ids) => {
                    if row_ids.len() != chunk.len() {
                        warn!(
                            target: "orgmigrate",
                            event = "log_row_ids_incomplete",
                            expected = chunk.len(),
                            received = row_ids.len()
                        );
                    }
                    for (position, (index, _)) in chunk.iter().enumerate() {
                        let source_id = resources[*index].id().unwrap_or_default();
                        let dest_id = row_ids
                            .get(position)
                            .cloned()
                            .unwrap_or_else(|| fallback_row_id(source_id));
                        outcomes[*index] = Some(Ok(dest_id));
                    }
                    info!(target: "orgmigrate", event = "logs_inserted", count = chunk.len());
                }
                Err(err) => {
                    warn!(
                        target: "orgmigrate",
                        event = "log_insert_failed",
                        count = chunk.len(),
                        error = %err
                    );
                    let message = err.to_string();
                    for (index, _) in chunk {
                        outcomes[*index] = Some(Err(MigrationError::CreateRejected {
                            resource_type: "logs",
                            message: message.clone(),
                        }));
                    }
                }
            }
        }

        outcomes
            .into_iter()
            .zip(resources)
            .map(|(outcome, resource)| {
                outcome.unwrap_or_else(|| {
                    Err(MigrationError::SerializationFailed {
                        resource_type: "logs",
                        source_id: resource.id().unwrap_or_default().to_string(),
                        reason: "event was not inserted".to_string(),
                    })
                })
            })
            .collect()
    }
}
