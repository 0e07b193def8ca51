use async_trait::async_trait;
use tracing::info;

use crate::client::ObjectKind;
use crate::migrator::{MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

/// Placeholder: the platform exposes no agent endpoints, so nothing is listed.
pub struct AgentMigrator;

#[async_trait]
impl Migrator for AgentMigrator {
    fn resource_name(&self) -> &'static str {
        "agents"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Function
    }

    fn schema_type(&self) -> &'static str {
        "Agent"
    }

    async fn list_source_resources(
        &self,
        _ctx: &MigrationContext<'_>,
    ) -> Result<Vec<Resource>, MigrationError> {
        info!(target: "orgmigrate", event = "agents_unsupported", "no agent endpoints; nothing to migrate");
        Ok(Vec::new())
    }

    async fn resource_exists_in_dest(
        &self,
        _ctx: &mut MigrationContext<'_>,
        _resource: &Resource,
    ) -> Result<Option<String>, MigrationError> {
        Ok(None)
    }

    async fn migrate_resource(
        &self,
        _ctx: &mut MigrationContext<'_>,
        _resource: &Resource,
    ) -> Result<String, MigrationError> {
        Err(MigrationError::UnsupportedReference {
            resource_type: "agents",
            field: "agent",
            reason: "agents have no API endpoints".to_string(),
        })
    }
}
