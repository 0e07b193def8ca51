use async_trait::async_trait;
use serde_json::{json, Map};
use tracing::warn;

use super::copy_present;
use crate::client::ObjectKind;
use crate::migrator::{MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

/// AI-provider credentials. Only the configuration travels; secret values
/// are never readable and must be re-entered in the destination.
pub struct AiSecretMigrator;

#[async_trait]
impl Migrator for AiSecretMigrator {
    fn resource_name(&self) -> &'static str {
        "ai_secrets"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::AiSecret
    }

    fn schema_type(&self) -> &'static str {
        "AISecret"
    }

    async fn migrate_resource(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<String, MigrationError> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(resource.name().unwrap_or_default()));
        copy_present(resource, &mut fields, &["type", "metadata"]);
        warn!(
            target: "orgmigrate",
            event = "ai_secret_value_not_copied",
            name = resource.name().unwrap_or_default(),
            "secret value must be configured manually in the destination"
        );
        ctx.create_in_dest(ObjectKind::AiSecret, fields).await
    }
}
