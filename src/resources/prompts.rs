use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use super::copy_present;
use crate::client::ObjectKind;
use crate::migrator::{MigrationContext, MigrationError, Migrator};
use crate::resource::Resource;

/// Prompts run in two passes. The first pass takes prompts without
/// references; the final pass, after functions, takes the rest.
pub struct PromptMigrator {
    final_pass: bool,
}

impl PromptMigrator {
    pub fn first_pass() -> Self {
        Self { final_pass: false }
    }

    pub fn final_pass() -> Self {
        Self { final_pass: true }
    }

    pub fn is_final_pass(&self) -> bool {
        self.final_pass
    }
}

fn tool_function_ids(prompt_data: &Value) -> impl Iterator<Item = &str> {
    prompt_data
        .get("tool_functions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|tool| tool.get("type").and_then(Value::as_str) == Some("function"))
        .filter_map(|tool| tool.get("id").and_then(Value::as_str))
}

/// Rewrites tool and origin references to destination IDs.
///
/// Unresolved tools are dropped; an unresolved origin is removed.
fn resolve_prompt_data(
    ctx: &MigrationContext<'_>,
    prompt_name: &str,
    prompt_data: &Value,
) -> Value {
    let mut resolved = prompt_data.clone();

    if let Some(tools) = prompt_data.get("tool_functions").and_then(Value::as_array) {
        let mut kept = Vec::with_capacity(tools.len());
        for tool in tools {
            let function_id = (tool.get("type").and_then(Value::as_str) == Some("function"))
                .then(|| tool.get("id").and_then(Value::as_str))
                .flatten();
            match function_id {
                Some(source_id) => match ctx.mapped(source_id) {
                    Some(dest_id) => {
                        let mut tool = tool.clone();
                        tool["id"] = json!(dest_id);
                        kept.push(tool);
                    }
                    None => warn!(
                        target: "orgmigrate",
                        event = "prompt_tool_unresolved",
                        prompt = prompt_name,
                        function_id = source_id
                    ),
                },
                None => kept.push(tool.clone()),
            }
        }
        resolved["tool_functions"] = Value::Array(kept);
    }

    let origin_prompt = prompt_data
        .pointer("/origin/prompt_id")
        .and_then(Value::as_str);
    if let (Some(source_id), Some(fields)) = (origin_prompt, resolved.as_object_mut()) {
        match ctx.mapped(source_id) {
            Some(dest_id) => {
                if let Some(origin) = fields.get_mut("origin").and_then(Value::as_object_mut) {
                    origin.insert("prompt_id".into(), json!(dest_id));
                    if origin.contains_key("project_id") {
                        origin.insert("project_id".into(), json!(ctx.dest_project_id));
                    }
                }
            }
            None => {
                warn!(
                    target: "orgmigrate",
                    event = "prompt_origin_unresolved",
                    prompt = prompt_name,
                    origin_prompt_id = source_id
                );
                fields.remove("origin");
            }
        }
    }
    resolved
}

#[async_trait]
impl Migrator for PromptMigrator {
    fn resource_name(&self) -> &'static str {
        "prompts"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Prompt
    }

    fn schema_type(&self) -> &'static str {
        "Prompt"
    }

    fn existence_match_fields(&self) -> &'static [&'static str] {
        &["slug"]
    }

    fn dependencies(&self, resource: &Resource) -> Vec<String> {
        let Some(prompt_data) = resource.get("prompt_data") else {
            return Vec::new();
        };
        let mut dependencies: Vec<String> = tool_function_ids(prompt_data)
            .map(str::to_string)
            .collect();
        if let Some(origin) = prompt_data
            .pointer("/origin/prompt_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
        {
            dependencies.push(origin.to_string());
        }
        dependencies
    }

    fn dependency_types(&self) -> &'static [ObjectKind] {
        &[ObjectKind::Function, ObjectKind::Prompt]
    }

    fn should_migrate(&self, resource: &Resource) -> bool {
        let has_dependencies = !self.dependencies(resource).is_empty();
        has_dependencies == self.final_pass
    }

    async fn migrate_resource(
        &self,
        ctx: &mut MigrationContext<'_>,
        resource: &Resource,
    ) -> Result<String, MigrationError> {
        let name = resource.name().unwrap_or_default();
        let mut fields = Map::new();
        fields.insert("name".into(), json!(name));
        fields.insert("slug".into(), json!(resource.str_field("slug")));
        if let Some(project_id) = &ctx.dest_project_id {
            fields.insert("project_id".into(), json!(project_id));
        }
        copy_present(resource, &mut fields, &["description", "tags", "function_type"]);
        if let Some(prompt_data) = resource.get("prompt_data").filter(|data| !data.is_null()) {
            fields.insert(
                "prompt_data".into(),
                resolve_prompt_data(ctx, name, prompt_data),
            );
        }
        ctx.create_in_dest(ObjectKind::Prompt, fields).await
    }
}
