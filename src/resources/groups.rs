use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::string_list;
use crate::client::ObjectKind;
use crate::migrator::{MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

/// Organization groups. Member users are organization-specific and dropped.
pub struct GroupMigrator;

#[async_trait]
impl Migrator for GroupMigrator {
    fn resource_name(&self) -> &'static str {
        "groups"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Group
    }

    fn schema_type(&self) -> &'static str {
        "Group"
    }

    fn dependencies(&self, resource: &Resource) -> Vec<String> {
        string_list(resource, "member_groups")
    }

    async fn migrate_resource(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<String, MigrationError> {
        let mut fields = ctx.serialize_for_insert(resource, self.schema_type())?;

        fields.remove("member_groups");
        let member_groups: Vec<String> = string_list(resource, "member_groups")
            .into_iter()
            .filter_map(|group_id| {
                let mapped = ctx.mapped(&group_id).map(str::to_string);
                if mapped.is_none() {
                    warn!(
                        target: "orgmigrate",
                        event = "group_member_unresolved",
                        group = resource.name().unwrap_or_default(),
                        member_group = %group_id
                    );
                }
                mapped
            })
            .collect();
        if !member_groups.is_empty() {
            fields.insert("member_groups".into(), json!(member_groups));
        }

        if fields.remove("member_users").is_some() {
            info!(
                target: "orgmigrate",
                event = "group_member_users_dropped",
                group = resource.name().unwrap_or_default(),
                count = string_list(resource, "member_users").len()
            );
        }

        ctx.create_in_dest(ObjectKind::Group, fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryClient;
    use crate::config::MigrationSettings;
    use crate::migrator::ResourceMigrator;
    use crate::schema::OpenApiSchema;
    use tempfile::TempDir;

    #[tokio::test]
    async fn member_users_are_dropped_and_groups_remapped() {
        let dir = TempDir::new().unwrap();
        let (source, dest) = (InMemoryClient::new("source"), InMemoryClient::new("dest"));
        source.insert(ObjectKind::Group, json!({ "id": "g1", "name": "eng", "member_users": ["u1"] }));
        source.insert(ObjectKind::Group, json!({ "id": "g2", "name": "all",
            "description": "everyone", "member_groups": ["g1"], "member_users": ["u2", "u3"] }));
        let schema = OpenApiSchema::empty();
        let mut migrator = ResourceMigrator::new(
            Box::new(GroupMigrator),
            &source,
            &dest,
            &schema,
            dir.path(),
            &MigrationSettings::default(),
        );
        migrator.migrate_all().await.unwrap();

        let created = dest.created(ObjectKind::Group);
        assert!(created.iter().all(|group| group.get("member_users").is_none()));
        let all = created.iter().find(|group| group.name() == Some("all")).unwrap();
        assert_eq!(
            all.get("member_groups"),
            Some(&json!([migrator.id_mapping()["g1"]]))
        );
    }
}
