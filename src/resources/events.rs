use serde_json::Value;
use tracing::info;

use crate::client::{fetch_all_events, EventObject, ObjectKind};
use crate::migrator::{MigrationContext, MigrationError};

const EVENT_PAGE_SIZE: usize = 1000;
/// Upper bound on events per insert call.
pub(crate) const MAX_INSERT_BATCH: usize = 100;

/// Row bookkeeping the destination assigns itself.
const EVENT_SYSTEM_FIELDS: &[&str] = &[
    "_xact_id",
    "xact_id",
    "_pagination_key",
    "_object_delete",
    "created",
    "org_id",
    "project_id",
    "dataset_id",
    "experiment_id",
    "log_id",
    "comparison_key",
];

/// Drops system fields and nulls, then applies the insert schema when known.
pub(crate) fn prepare_events(
    ctx: &MigrationContext<'_>,
    events: Vec<Value>,
    schema_type: &str,
) -> Vec<Value> {
    let allowed = ctx.schema.create_fields(schema_type);
    events
        .into_iter()
        .filter_map(|event| match event {
            Value::Object(mut fields) => {
                fields.retain(|key, value| {
                    !value.is_null()
                        && !EVENT_SYSTEM_FIELDS.contains(&key.as_str())
                        && allowed.map_or(true, |allowed| allowed.contains(key))
                });
                (!fields.is_empty()).then_some(Value::Object(fields))
            }
            _ => None,
        })
        .collect()
}

pub(crate) fn insert_batch_size(ctx: &MigrationContext<'_>) -> usize {
    ctx.batch_size.clamp(1, MAX_INSERT_BATCH)
}

/// Copies every event of a source object into its destination counterpart.
pub(crate) async fn copy_events(
    ctx: &MigrationContext<'_>,
    kind: ObjectKind,
    source_id: &str,
    dest_id: &str,
    schema_type: &str,
) -> Result<usize, MigrationError> {
    let source_object = EventObject::new(kind, source_id);
    let raw = fetch_all_events(ctx.source, &source_object, EVENT_PAGE_SIZE).await?;
    let events = prepare_events(ctx, raw, schema_type);
    if events.is_empty() {
        return Ok(0);
    }

    let dest_object = EventObject::new(kind, dest_id);
    let total = events.len();
    for chunk in events.chunks(insert_batch_size(ctx)) {
        ctx.dest.insert_events(&dest_object, chunk.to_vec()).await?;
    }
    info!(
        target: "orgmigrate",
        event = "events_copied",
        object = %kind,
        source_id,
        dest_id,
        count = total
    );
    Ok(total)
}
