use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::resource::Resource;

#[derive(Debug, thiserror::Error)]
pub enum ProjectMatchError {
    #[error(
        "project match rule selects nothing: set project_names, project_ids, a name pattern or all_projects"
    )]
    NoSelector,
    #[error("invalid project pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Which projects a group assignment applies to.
///
/// Explicit lists come first, then every project accepted by any of the
/// pattern selectors. Exclusions are applied last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectMatchRule {
    pub project_names: Vec<String>,
    pub project_ids: Vec<String>,
    /// Regex matched from the start of the project name.
    pub name_pattern: Option<String>,
    pub name_contains: Vec<String>,
    pub name_starts_with: Option<String>,
    pub name_ends_with: Option<String>,
    pub all_projects: bool,
    pub exclude_patterns: Vec<String>,
}

fn anchored(pattern: &str) -> Result<Regex, ProjectMatchError> {
    Regex::new(&format!("^(?:{pattern})")).map_err(|source| ProjectMatchError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

impl ProjectMatchRule {
    fn has_pattern(&self) -> bool {
        self.name_pattern.is_some()
            || !self.name_contains.is_empty()
            || self.name_starts_with.is_some()
            || self.name_ends_with.is_some()
    }

    pub fn validate(&self) -> Result<(), ProjectMatchError> {
        let explicit = !self.project_names.is_empty() || !self.project_ids.is_empty();
        if !(explicit || self.has_pattern() || self.all_projects) {
            return Err(ProjectMatchError::NoSelector);
        }
        if let Some(pattern) = &self.name_pattern {
            anchored(pattern)?;
        }
        for pattern in &self.exclude_patterns {
            anchored(pattern)?;
        }
        Ok(())
    }

    /// The selectors that can match by name, recorded against discovered projects.
    pub fn describe_patterns(&self) -> Vec<String> {
        let mut patterns = Vec::new();
        if let Some(pattern) = &self.name_pattern {
            patterns.push(pattern.clone());
        }
        patterns.extend(self.name_contains.iter().map(|needle| format!("contains:{needle}")));
        if let Some(prefix) = &self.name_starts_with {
            patterns.push(format!("starts_with:{prefix}"));
        }
        if let Some(suffix) = &self.name_ends_with {
            patterns.push(format!("ends_with:{suffix}"));
        }
        if self.all_projects {
            patterns.push("all_projects".into());
        }
        patterns
    }

    fn matches_patterns(&self, name: &str, name_regex: Option<&Regex>) -> bool {
        if self.all_projects {
            return true;
        }
        if name_regex.is_some_and(|regex| regex.is_match(name)) {
            return true;
        }
        let lowered = name.to_lowercase();
        if self
            .name_contains
            .iter()
            .any(|needle| lowered.contains(&needle.to_lowercase()))
        {
            return true;
        }
        if self
            .name_starts_with
            .as_ref()
            .is_some_and(|prefix| lowered.starts_with(&prefix.to_lowercase()))
        {
            return true;
        }
        self.name_ends_with
            .as_ref()
            .is_some_and(|suffix| lowered.ends_with(&suffix.to_lowercase()))
    }

    /// Selects projects from `projects`, de-duplicated by ID in first-seen order.
    pub fn select<'p>(&self, projects: &'p [Resource]) -> Result<Vec<&'p Resource>, ProjectMatchError> {
        self.validate()?;
        let mut matched: Vec<&Resource> = Vec::new();

        for name in &self.project_names {
            match projects.iter().find(|project| project.name() == Some(name.as_str())) {
                Some(project) => matched.push(project),
                None => warn!(target: "orgmigrate", event = "project_name_not_found", project_name = %name),
            }
        }
        for id in &self.project_ids {
            match projects.iter().find(|project| project.id() == Some(id.as_str())) {
                Some(project) => matched.push(project),
                None => warn!(target: "orgmigrate", event = "project_id_not_found", project_id = %id),
            }
        }

        if self.has_pattern() || self.all_projects {
            let name_regex = self.name_pattern.as_deref().map(anchored).transpose()?;
            matched.extend(
                projects
                    .iter()
                    .filter(|project| self.matches_patterns(project.name().unwrap_or_default(), name_regex.as_ref())),
            );
        }

        let excludes = self
            .exclude_patterns
            .iter()
            .map(|pattern| anchored(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        let mut seen = HashSet::new();
        let selected: Vec<&Resource> = matched
            .into_iter()
            .filter(|project| {
                let name = project.name().unwrap_or_default();
                let excluded = excludes.iter().any(|regex| regex.is_match(name));
                if excluded {
                    debug!(target: "orgmigrate", event = "project_excluded", project_name = name);
                }
                !excluded
            })
            .filter(|project| seen.insert(project.id().unwrap_or_default().to_string()))
            .collect();
        Ok(selected)
    }
}
