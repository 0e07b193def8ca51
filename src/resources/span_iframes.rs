use async_trait::async_trait;
use serde_json::json;

use crate::client::ObjectKind;
use crate::migrator::{list_project_filtered, MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

/// Custom span renderers. The list endpoint does not honor the project
/// filter, so results are narrowed client-side.
pub struct SpanIframeMigrator;

#[async_trait]
impl Migrator for SpanIframeMigrator {
    fn resource_name(&self) -> &'static str {
        "span_iframes"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::SpanIframe
    }

    fn schema_type(&self) -> &'static str {
        "SpanIFrame"
    }

    async fn list_source_resources(
        &self,
        ctx: &MigrationContext<'_>,
    ) -> Result<Vec<Resource>, MigrationError> {
        list_project_filtered(ctx, ObjectKind::SpanIframe).await
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
        ctx.create_in_dest(ObjectKind::SpanIframe, fields).await
    }
}
