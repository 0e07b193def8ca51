use async_trait::async_trait;
use serde_json::{json, Map};
use tracing::warn;

use super::{copy_present, string_list};
use crate::client::ObjectKind;
use crate::migrator::{MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

pub struct RoleMigrator;

#[async_trait]
impl Migrator for RoleMigrator {
    fn resource_name(&self) -> &'static str {
        "roles"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Role
    }

    fn schema_type(&self) -> &'static str {
        "Role"
    }

    /// Inherited roles.
    fn dependencies(&self, resource: &Resource) -> Vec<String> {
        string_list(resource, "member_roles")
    }

    async fn migrate_resource(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<String, MigrationError> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(resource.name().unwrap_or_default()));
        copy_present(resource, &mut fields, &["description", "member_permissions"]);

        let mut member_roles = Vec::new();
        for parent in string_list(resource, "member_roles") {
            match ctx.mapped(&parent) {
                Some(dest_id) => member_roles.push(json!(dest_id)),
                None => warn!(
                    target: "orgmigrate",
                    event = "role_parent_unresolved",
                    role = resource.name().unwrap_or_default(),
                    parent = %parent
                ),
            }
        }
        if !member_roles.is_empty() {
            fields.insert("member_roles".into(), json!(member_roles));
        }

        ctx.create_in_dest(ObjectKind::Role, fields).await
    }
}
