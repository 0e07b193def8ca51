use async_trait::async_trait;
use serde_json::{json, Map};
use tracing::warn;

use crate::client::{collect_all, ListFilters, ObjectKind};
use crate::migrator::{MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

/// Project ACLs. Only group principals can be carried over: users belong
/// to one organization.
pub struct AclMigrator;

fn acl_filters(object_type: &str, object_id: &str) -> ListFilters {
    ListFilters::default()
        .with_extra("object_type", object_type)
        .with_extra("object_id", object_id)
}

fn mapped_object(ctx: &MigrationContext<'_>, acl: &Resource) -> Option<String> {
    let object_id = acl.str_field("object_id")?;
    ctx.mapped(object_id).map(str::to_string).or_else(|| {
        (acl.str_field("object_type") == Some("project")
            && ctx.source_project_id.as_deref() == Some(object_id))
        .then(|| ctx.dest_project_id.clone())
        .flatten()
    })
}

/// Same object, principal, grant and restriction once source IDs are mapped.
fn equivalent(ctx: &MigrationContext<'_>, source: &Resource, dest: &Resource) -> bool {
    let object_match = source.str_field("object_type") == dest.str_field("object_type")
        && mapped_object(ctx, source).as_deref() == dest.str_field("object_id");
    if !object_match {
        return false;
    }

    let principal_match = match (source.str_field("user_id"), source.str_field("group_id")) {
        (Some(_), _) => false,
        (None, Some(group)) => ctx.mapped(group).is_some() && ctx.mapped(group) == dest.str_field("group_id"),
        (None, None) => false,
    };
    if !principal_match {
        return false;
    }

    let grant_match = match (source.str_field("permission"), source.str_field("role_id")) {
        (Some(permission), _) => dest.str_field("permission") == Some(permission),
        (None, Some(role)) => ctx.mapped(role).is_some() && ctx.mapped(role) == dest.str_field("role_id"),
        (None, None) => true,
    };
    grant_match && source.str_field("restrict_object_type") == dest.str_field("restrict_object_type")
}

fn required<'r>(
    value: Option<&'r str>,
    field: &'static str,
    source_id: &str,
) -> Result<&'r str, MigrationError> {
    value.ok_or_else(|| MigrationError::MissingRequiredDependency {
        resource_type: "acls",
        field,
        source_id: source_id.to_string(),
    })
}

#[async_trait]
impl Migrator for AclMigrator {
    fn resource_name(&self) -> &'static str {
        "acls"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Acl
    }

    fn schema_type(&self) -> &'static str {
        "Acl"
    }

    async fn list_source_resources(
        &self,
        ctx: &MigrationContext<'_>,
    ) -> Result<Vec<Resource>, MigrationError> {
        let Some(project_id) = ctx.source_project_id.as_deref() else {
            return Ok(Vec::new());
        };
        Ok(collect_all(ctx.source, ObjectKind::Acl, &acl_filters("project", project_id)).await?)
    }

    async fn resource_exists_in_dest(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<Option<String>, MigrationError> {
        let ctx: &MigrationContext<'_> = ctx;
        let (Some(object_type), Some(dest_object)) =
            (resource.str_field("object_type"), mapped_object(ctx, resource))
        else {
            return Ok(None);
        };
        let candidates =
            match collect_all(ctx.dest, ObjectKind::Acl, &acl_filters(object_type, &dest_object)).await {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(
                        target: "orgmigrate",
                        event = "existence_check_failed",
                        resource_type = "acls",
                        acl_id = resource.id().unwrap_or_default(),
                        error = %err
                    );
                    return Ok(None);
                }
            };
        Ok(candidates
            .iter()
            .find(|candidate| equivalent(ctx, resource, candidate))
            .and_then(|candidate| candidate.id().map(str::to_string)))
    }

    fn dependencies(&self, resource: &Resource) -> Vec<String> {
        ["object_id", "role_id", "group_id"]
            .iter()
            .filter_map(|field| resource.str_field(field))
            .map(str::to_string)
            .collect()
    }

    fn dependency_types(&self) -> &'static [ObjectKind] {
        &[ObjectKind::Role, ObjectKind::Group]
    }

    async fn migrate_resource(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<String, MigrationError> {
        let acl_id = resource.id().unwrap_or_default();
        if let Some(user_id) = resource.str_field("user_id") {
            warn!(target: "orgmigrate", event = "acl_user_principal", acl_id, user_id);
            return Err(MigrationError::UnsupportedReference {
                resource_type: "acls",
                field: "user_id",
                reason: format!("ACL {acl_id} grants to a user; users are organization-specific"),
            });
        }

        let object_type = required(resource.str_field("object_type"), "object_type", acl_id)?;
        let dest_object = mapped_object(ctx, resource);
        let dest_object = required(dest_object.as_deref(), "object_id", acl_id)?;

        let mut fields = Map::new();
        fields.insert("object_type".into(), json!(object_type));
        fields.insert("object_id".into(), json!(dest_object));

        let group = required(resource.str_field("group_id"), "group_id", acl_id)?;
        let dest_group = required(ctx.mapped(group), "group_id", acl_id)?;
        fields.insert("group_id".into(), json!(dest_group));

        match (resource.str_field("permission"), resource.str_field("role_id")) {
            (Some(permission), _) => {
                fields.insert("permission".into(), json!(permission));
            }
            (None, Some(role)) => {
                let dest_role = required(ctx.mapped(role), "role_id", acl_id)?;
                fields.insert("role_id".into(), json!(dest_role));
            }
            (None, None) => {}
        }
        if let Some(restrict) = resource.str_field("restrict_object_type") {
            fields.insert("restrict_object_type".into(), json!(restrict));
        }
        ctx.create_in_dest(ObjectKind::Acl, fields).await
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

    fn acl(id: &str, extra: serde_json::Value) -> serde_json::Value {
        let mut value = json!({ "id": id, "object_type": "project", "object_id": "p1" });
        if let (Some(target), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            target.extend(extra.clone());
        }
        value
    }

    #[tokio::test]
    async fn group_acls_migrate_and_equivalents_are_reused() {
        let dir = TempDir::new().unwrap();
        let (source, dest) = (InMemoryClient::new("source"), InMemoryClient::new("dest"));
        source.insert(ObjectKind::Acl, acl("a1", json!({ "group_id": "g1", "permission": "read" })));
        source.insert(ObjectKind::Acl, acl("a2", json!({ "group_id": "g1", "role_id": "r1" })));
        source.insert(ObjectKind::Acl, acl("a3", json!({ "user_id": "u1", "permission": "read" })));
        source.insert(ObjectKind::Acl, acl("a4", json!({ "group_id": "g-gone", "permission": "update" })));
        dest.insert(ObjectKind::Acl, json!({ "id": "x1", "object_type": "project", "object_id": "p2",
            "group_id": "g1-dest", "permission": "read" }));

        let schema = OpenApiSchema::empty();
        let mut migrator = ResourceMigrator::new(
            Box::new(AclMigrator),
            &source,
            &dest,
            &schema,
            dir.path(),
            &MigrationSettings::default(),
        )
        .with_projects(Some("p1".into()), Some("p2".into()));
        migrator.update_id_mappings(
            &[
                ("p1".to_string(), "p2".to_string()),
                ("g1".to_string(), "g1-dest".to_string()),
                ("r1".to_string(), "r1-dest".to_string()),
            ]
            .into(),
        );
        let summary = migrator.migrate_all().await.unwrap();
        assert_eq!((summary.total, summary.migrated, summary.skipped, summary.failed), (4, 1, 1, 2));
        assert_eq!(migrator.id_mapping()["a1"], "x1");

        let created = dest.created(ObjectKind::Acl);
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].str_field("role_id"), Some("r1-dest"));
        assert!(summary.errors.iter().any(|e| e.source_id == "a3"));
        assert!(summary.errors.iter().any(|e| e.source_id == "a4" && e.error.contains("group_id")));
    }

    #[tokio::test]
    async fn failed_destination_lookup_counts_as_not_found() {
        let dir = TempDir::new().unwrap();
        let (source, dest) = (InMemoryClient::new("source"), InMemoryClient::new("dest"));
        source.insert(ObjectKind::Acl, acl("a1", json!({ "group_id": "g1", "permission": "read" })));
        dest.fail_list(ObjectKind::Acl);

        let schema = OpenApiSchema::empty();
        let mut migrator = ResourceMigrator::new(
            Box::new(AclMigrator),
            &source,
            &dest,
            &schema,
            dir.path(),
            &MigrationSettings::default(),
        )
        .with_projects(Some("p1".into()), Some("p2".into()));
        migrator.update_id_mappings(
            &[
                ("p1".to_string(), "p2".to_string()),
                ("g1".to_string(), "g1-dest".to_string()),
            ]
            .into(),
        );
        let summary = migrator.migrate_all().await.unwrap();
        assert_eq!((summary.migrated, summary.failed), (1, 0));
        assert_eq!(dest.created(ObjectKind::Acl).len(), 1);
    }
}
