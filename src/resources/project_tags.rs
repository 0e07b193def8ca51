use async_trait::async_trait;
use serde_json::{json, Map};

use super::copy_present;
use crate::client::ObjectKind;
use crate::migrator::{MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

pub struct ProjectTagMigrator;

#[async_trait]
impl Migrator for ProjectTagMigrator {
    fn resource_name(&self) -> &'static str {
        "project_tags"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::ProjectTag
    }

    fn schema_type(&self) -> &'static str {
        "ProjectTag"
    }

    async fn migrate_resource(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<String, MigrationError> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(resource.name().unwrap_or_default()));
        if let Some(project_id) = &ctx.dest_project_id {
            fields.insert("project_id".into(), json!(project_id));
        }
        copy_present(resource, &mut fields, &["description", "color"]);
        ctx.create_in_dest(ObjectKind::ProjectTag, fields).await
    }
}
