//! Per-type migrators and the fixed order they run in.

pub mod acls;
pub mod agents;
pub mod ai_secrets;
pub mod datasets;
mod events;
pub mod experiments;
pub mod functions;
pub mod groups;
pub mod logs;
pub mod project_scores;
pub mod project_tags;
pub mod prompts;
pub mod roles;
pub mod span_iframes;
pub mod views;

use serde_json::{Map, Value};

use crate::migrator::Migrator;
use crate::resource::Resource;

/// One step of the migration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AiSecrets,
    Roles,
    Groups,
    Datasets,
    ProjectTags,
    SpanIframes,
    Prompts,
    Functions,
    ProjectScores,
    PromptsFinal,
    Agents,
    Experiments,
    Logs,
    Views,
    Acls,
}

/// Organization-scoped steps, run once before any project.
pub const ORGANIZATION_STEPS: &[Step] = &[Step::AiSecrets, Step::Roles, Step::Groups];

/// Steps run for every project, in order. Prompts run twice around
/// functions: prompts referencing functions only exist after them.
pub const PROJECT_STEPS: &[Step] = &[
    Step::Datasets,
    Step::ProjectTags,
    Step::SpanIframes,
    Step::Prompts,
    Step::Functions,
    Step::ProjectScores,
    Step::PromptsFinal,
    Step::Agents,
    Step::Experiments,
    Step::Logs,
    Step::Views,
    Step::Acls,
];

impl Step {
    /// Type name used for filtering and checkpoint files.
    pub fn resource_type(&self) -> &'static str {
        match self {
            Step::AiSecrets => "ai_secrets",
            Step::Roles => "roles",
            Step::Groups => "groups",
            Step::Datasets => "datasets",
            Step::ProjectTags => "project_tags",
            Step::SpanIframes => "span_iframes",
            Step::Prompts | Step::PromptsFinal => "prompts",
            Step::Functions => "functions",
            Step::ProjectScores => "project_scores",
            Step::Agents => "agents",
            Step::Experiments => "experiments",
            Step::Logs => "logs",
            Step::Views => "views",
            Step::Acls => "acls",
        }
    }

    /// Key under which the step's summary is reported.
    pub fn report_key(&self) -> &'static str {
        match self {
            Step::PromptsFinal => "prompts_final",
            other => other.resource_type(),
        }
    }

    /// Steps that only run when named explicitly, never through "all".
    pub fn is_opt_in(&self) -> bool {
        matches!(self, Step::Acls)
    }

    pub fn migrator(&self) -> Box<dyn Migrator> {
        match self {
            Step::AiSecrets => Box::new(ai_secrets::AiSecretMigrator),
            Step::Roles => Box::new(roles::RoleMigrator),
            Step::Groups => Box::new(groups::GroupMigrator),
            Step::Datasets => Box::new(datasets::DatasetMigrator),
            Step::ProjectTags => Box::new(project_tags::ProjectTagMigrator),
            Step::SpanIframes => Box::new(span_iframes::SpanIframeMigrator),
            Step::Prompts => Box::new(prompts::PromptMigrator::first_pass()),
            Step::Functions => Box::new(functions::FunctionMigrator),
            Step::ProjectScores => Box::new(project_scores::ProjectScoreMigrator),
            Step::PromptsFinal => Box::new(prompts::PromptMigrator::final_pass()),
            Step::Agents => Box::new(agents::AgentMigrator),
            Step::Experiments => Box::new(experiments::ExperimentMigrator),
            Step::Logs => Box::new(logs::LogsMigrator),
            Step::Views => Box::new(views::ViewMigrator),
            Step::Acls => Box::new(acls::AclMigrator),
        }
    }
}

/// Every type name accepted by the resource filter.
pub fn known_resource_types() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Vec::new();
    for step in ORGANIZATION_STEPS.iter().chain(PROJECT_STEPS) {
        if !names.contains(&step.resource_type()) {
            names.push(step.resource_type());
        }
    }
    names
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Copies each of `keys` that holds a non-empty value.
pub(crate) fn copy_present(resource: &Resource, fields: &mut Map<String, Value>, keys: &[&str]) {
    for key in keys {
        if let Some(value) = resource.get(key).filter(|value| !is_blank(value)) {
            fields.insert((*key).to_string(), value.clone());
        }
    }
}

/// Collects the string items of an array field.
pub(crate) fn string_list(resource: &Resource, key: &str) -> Vec<String> {
    resource
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
