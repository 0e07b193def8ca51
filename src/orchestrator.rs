//! Runs every selected migrator in the fixed order and writes the run report.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Map};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::checkpoint::IdMapping;
use crate::client::{close_pair, collect_all, connect_pair, ClientError, ListFilters, ObjectKind, PlatformClient};
use crate::config::Config;
use crate::dependency_cache::DependencyCache;
use crate::migrator::{MigrationError, MigrationSummary, ResourceMigrator};
use crate::report::{self, MigrationReport, MigrationRun, ProjectRun, ScopeRun, TypeError};
use crate::resource::Resource;
use crate::resources::{Step, ORGANIZATION_STEPS, PROJECT_STEPS};
use crate::schema::OpenApiSchema;

pub const ORGANIZATION_DIR: &str = "organization";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("connection failed: {source}")]
    Connection {
        #[source]
        source: ClientError,
        run_dir: PathBuf,
    },
    #[error("failed to prepare {path}: {source}")]
    RunDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write the migration report: {0:#}")]
    Report(anyhow::Error),
}

/// Files and totals of a finished run.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub run_dir: PathBuf,
    pub report_path: PathBuf,
    pub summary_path: PathBuf,
    pub report: MigrationReport,
}

impl MigrationOutcome {
    pub fn success(&self) -> bool {
        self.report.migration_summary.success
    }
}

/// A source project and its destination counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPair {
    pub name: String,
    pub source_id: String,
    pub dest_id: String,
}

pub struct MigrationOrchestrator<'a> {
    source: &'a dyn PlatformClient,
    dest: &'a dyn PlatformClient,
    schema: &'a OpenApiSchema,
    config: &'a Config,
}

/// Keeps the report key attached to a step's failure.
fn type_error(step: Step, err: &MigrationError, project: Option<&str>) -> TypeError {
    TypeError {
        resource_type: step.report_key().to_string(),
        error: format!("Failed to migrate {}: {err}", step.resource_type()),
        project: project.map(str::to_string),
    }
}

/// Project names are used as directory names.
fn project_dir_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ') { c } else { '_' })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "project".to_string(),
        trimmed => trimmed.to_string(),
    }
}

fn create_dir(path: &Path) -> Result<(), OrchestratorError> {
    fs::create_dir_all(path).map_err(|source| OrchestratorError::RunDirectory {
        path: path.display().to_string(),
        source,
    })
}

impl<'a> MigrationOrchestrator<'a> {
    pub fn new(
        source: &'a dyn PlatformClient,
        dest: &'a dyn PlatformClient,
        schema: &'a OpenApiSchema,
        config: &'a Config,
    ) -> Self {
        Self {
            source,
            dest,
            schema,
            config,
        }
    }

    /// Opt-in steps run only when named; the rest follow the resource filter.
    pub fn is_selected(&self, step: Step) -> bool {
        if step.is_opt_in() {
            self.config
                .resources
                .iter()
                .any(|selected| selected == step.resource_type())
        } else {
            self.config.includes_resource(step.resource_type())
        }
    }

    pub async fn run(&self) -> Result<MigrationOutcome, OrchestratorError> {
        let started_at = Utc::now();
        let run_dir = self
            .config
            .state_dir
            .join(started_at.format("%Y%m%d_%H%M%S").to_string());
        create_dir(&run_dir)?;
        info!(
            target: "orgmigrate",
            event = "run_started",
            run_dir = %run_dir.display(),
            resources = ?self.config.resources
        );

        let mut run = MigrationRun::new(started_at);
        if let Err(err) = connect_pair(self.source, self.dest).await {
            error!(target: "orgmigrate", event = "connection_failed", error = %err);
            run.orchestrator_error = Some(err.to_string());
            run.completed_at = Utc::now();
            self.write_outputs(&run_dir, &run)?;
            return Err(OrchestratorError::Connection {
                source: err,
                run_dir,
            });
        }

        let mut mapping = IdMapping::new();
        let organization_dir = run_dir.join(ORGANIZATION_DIR);
        create_dir(&organization_dir)?;
        let mut organization_cache = DependencyCache::new();
        for &step in ORGANIZATION_STEPS {
            if !self.is_selected(step) {
                continue;
            }
            match self
                .run_step(step, &organization_dir, None, &mut mapping, &mut organization_cache)
                .await
            {
                Ok(summary) => run.organization.push(step.report_key(), summary),
                Err(err) => {
                    error!(target: "orgmigrate", event = "resource_type_failed", resource_type = step.resource_type(), error = %err);
                    run.errors.push(type_error(step, &err, None));
                }
            }
        }

        let has_project_steps = PROJECT_STEPS.iter().any(|&step| self.is_selected(step));
        let projects = if has_project_steps {
            match self.discover_projects(&mut mapping, &mut run.errors).await {
                Ok(projects) => projects,
                Err(err) => {
                    error!(target: "orgmigrate", event = "project_discovery_failed", error = %err);
                    run.errors.push(TypeError {
                        resource_type: "projects".to_string(),
                        error: format!("Failed to migrate projects: {err}"),
                        project: None,
                    });
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        for project in projects {
            let project_dir = run_dir.join(project_dir_name(&project.name));
            create_dir(&project_dir)?;
            info!(
                target: "orgmigrate",
                event = "project_started",
                project = %project.name,
                source_project_id = %project.source_id,
                dest_project_id = %project.dest_id
            );
            let mut cache = DependencyCache::new();
            let mut scope = ScopeRun::default();
            for &step in PROJECT_STEPS {
                if !self.is_selected(step) {
                    continue;
                }
                match self
                    .run_step(step, &project_dir, Some(&project), &mut mapping, &mut cache)
                    .await
                {
                    Ok(summary) => scope.push(step.report_key(), summary),
                    Err(err) => {
                        error!(
                            target: "orgmigrate",
                            event = "resource_type_failed",
                            project = %project.name,
                            resource_type = step.resource_type(),
                            error = %err
                        );
                        run.errors.push(type_error(step, &err, Some(&project.name)));
                    }
                }
            }
            let (entries, hits) = cache.stats();
            info!(target: "orgmigrate", event = "project_completed", project = %project.name, cache_entries = entries, cache_hits = hits);
            run.projects.push(ProjectRun {
                name: project.name,
                source_id: project.source_id,
                dest_id: project.dest_id,
                scope,
            });
        }

        if let Err(err) = close_pair(self.source, self.dest).await {
            warn!(target: "orgmigrate", event = "close_failed", error = %err);
        }
        run.completed_at = Utc::now();
        let outcome = self.write_outputs(&run_dir, &run)?;
        let summary = &outcome.report.migration_summary;
        info!(
            target: "orgmigrate",
            event = "run_completed",
            success = summary.success,
            projects = summary.total_projects,
            total = summary.total_resources,
            migrated = summary.migrated_resources,
            skipped = summary.skipped_resources,
            failed = summary.failed_resources,
            errors = summary.errors.len()
        );
        Ok(outcome)
    }

    fn write_outputs(&self, run_dir: &Path, run: &MigrationRun) -> Result<MigrationOutcome, OrchestratorError> {
        let report = MigrationReport::from_run(run);
        let report_path = report::write_report(run_dir, &report).map_err(OrchestratorError::Report)?;
        let summary_path = report::write_summary(run_dir, &report).map_err(OrchestratorError::Report)?;
        info!(
            target: "orgmigrate",
            event = "report_written",
            report = %report_path.display(),
            summary = %summary_path.display()
        );
        Ok(MigrationOutcome {
            run_dir: run_dir.to_path_buf(),
            report_path,
            summary_path,
            report,
        })
    }

    async fn run_step(
        &self,
        step: Step,
        checkpoint_dir: &Path,
        project: Option<&ProjectPair>,
        mapping: &mut IdMapping,
        cache: &mut DependencyCache,
    ) -> Result<MigrationSummary, MigrationError> {
        let mut migrator = ResourceMigrator::new(
            step.migrator(),
            self.source,
            self.dest,
            self.schema,
            checkpoint_dir,
            &self.config.migration,
        );
        if let Some(project) = project {
            migrator = migrator.with_projects(Some(project.source_id.clone()), Some(project.dest_id.clone()));
        }
        migrator.update_id_mappings(mapping);
        migrator
            .populate_dependency_mappings(project.map(|project| project.source_id.as_str()), cache)
            .await?;
        let summary = migrator.migrate_all().await?;
        mapping.extend(
            migrator
                .id_mapping()
                .iter()
                .map(|(source_id, dest_id)| (source_id.clone(), dest_id.clone())),
        );
        Ok(summary)
    }

    /// Lists source projects under the allow-list and pairs each with a
    /// destination project, creating it when missing.
    pub async fn discover_projects(
        &self,
        mapping: &mut IdMapping,
        errors: &mut Vec<TypeError>,
    ) -> Result<Vec<ProjectPair>, MigrationError> {
        let mut source_projects = collect_all(self.source, ObjectKind::Project, &ListFilters::default()).await?;
        if let Some(allowed) = &self.config.project_names {
            source_projects.retain(|project| project.name().is_some_and(|name| allowed.iter().any(|a| a == name)));
            for name in allowed {
                if !source_projects.iter().any(|project| project.name() == Some(name.as_str())) {
                    warn!(target: "orgmigrate", event = "project_not_found", project = %name);
                }
            }
        }
        let dest_projects = collect_all(self.dest, ObjectKind::Project, &ListFilters::default()).await?;

        let mut pairs = Vec::with_capacity(source_projects.len());
        for project in &source_projects {
            let (Some(source_id), Some(name)) = (project.id(), project.name()) else {
                continue;
            };
            let existing = dest_projects
                .iter()
                .find(|candidate| candidate.name() == Some(name))
                .and_then(Resource::id)
                .map(str::to_string);
            let dest_id = match existing {
                Some(dest_id) => {
                    info!(target: "orgmigrate", event = "project_reused", project = name, dest_project_id = %dest_id);
                    dest_id
                }
                None => match self.create_project(project, name).await {
                    Ok(dest_id) => dest_id,
                    Err(err) => {
                        error!(target: "orgmigrate", event = "project_create_failed", project = name, error = %err);
                        errors.push(TypeError {
                            resource_type: "projects".to_string(),
                            error: format!("Failed to migrate project {name}: {err}"),
                            project: Some(name.to_string()),
                        });
                        continue;
                    }
                },
            };
            mapping.insert(source_id.to_string(), dest_id.clone());
            pairs.push(ProjectPair {
                name: name.to_string(),
                source_id: source_id.to_string(),
                dest_id,
            });
        }
        info!(target: "orgmigrate", event = "projects_discovered", count = pairs.len());
        Ok(pairs)
    }

    async fn create_project(&self, project: &Resource, name: &str) -> Result<String, MigrationError> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(name));
        if let Some(description) = project.str_field("description").filter(|d| !d.is_empty()) {
            fields.insert("description".into(), json!(description));
        }
        let created = self
            .dest
            .create(ObjectKind::Project, fields)
            .await
            .map_err(|err| MigrationError::from_create("projects", err))?;
        let dest_id = created
            .id()
            .map(str::to_string)
            .ok_or_else(|| MigrationError::CreateRejected {
                resource_type: "projects",
                message: "create response carried no id".to_string(),
            })?;
        info!(target: "orgmigrate", event = "project_created", project = name, dest_project_id = %dest_id);
        Ok(dest_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryClient;
    use crate::config::OrgConfig;
    use tempfile::TempDir;

    fn config(dir: &Path) -> Config {
        let mut config = Config::new(OrgConfig::new("a"), OrgConfig::new("b"));
        config.state_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn acls_need_an_explicit_selection() {
        let (source, dest) = (InMemoryClient::new("s"), InMemoryClient::new("d"));
        let schema = OpenApiSchema::empty();
        let mut config = config(Path::new("unused"));
        let orchestrator = MigrationOrchestrator::new(&source, &dest, &schema, &config);
        assert!(orchestrator.is_selected(Step::Datasets));
        assert!(!orchestrator.is_selected(Step::Acls));

        config.resources = vec!["acls".into(), "prompts".into()];
        let orchestrator = MigrationOrchestrator::new(&source, &dest, &schema, &config);
        assert!(orchestrator.is_selected(Step::Acls));
        assert!(orchestrator.is_selected(Step::PromptsFinal));
        assert!(!orchestrator.is_selected(Step::Roles));
    }

    #[tokio::test]
    async fn projects_are_reused_or_created_and_seeded() {
        let dir = TempDir::new().unwrap();
        let (source, dest) = (InMemoryClient::new("source"), InMemoryClient::new("dest"));
        source.insert(ObjectKind::Project, json!({ "id": "p1", "name": "alpha" }));
        source.insert(ObjectKind::Project, json!({ "id": "p2", "name": "beta", "description": "b" }));
        source.insert(ObjectKind::Project, json!({ "id": "p3", "name": "gamma" }));
        dest.insert(ObjectKind::Project, json!({ "id": "x1", "name": "alpha" }));
        let schema = OpenApiSchema::empty();
        let mut config = config(dir.path());
        config.project_names = Some(vec!["alpha".into(), "beta".into(), "missing".into()]);

        let orchestrator = MigrationOrchestrator::new(&source, &dest, &schema, &config);
        let mut mapping = IdMapping::new();
        let mut errors = Vec::new();
        let pairs = orchestrator.discover_projects(&mut mapping, &mut errors).await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(mapping["p1"], "x1");
        assert_eq!(dest.created(ObjectKind::Project)[0].str_field("description"), Some("b"));
        assert!(!mapping.contains_key("p3"));
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn failed_health_check_still_writes_a_report() {
        let dir = TempDir::new().unwrap();
        let (source, dest) = (InMemoryClient::new("source"), InMemoryClient::new("dest"));
        dest.fail_health_check();
        let schema = OpenApiSchema::empty();
        let config = config(dir.path());
        let err = MigrationOrchestrator::new(&source, &dest, &schema, &config)
            .run()
            .await
            .unwrap_err();
        let OrchestratorError::Connection { run_dir, .. } = err else {
            panic!("expected a connection error");
        };
        let report: MigrationReport =
            serde_json::from_str(&fs::read_to_string(run_dir.join(report::REPORT_FILE)).unwrap()).unwrap();
        assert!(!report.migration_summary.success);
        assert!(report.migration_summary.orchestrator_error.is_some());
    }

    #[tokio::test]
    async fn a_failing_type_is_recorded_and_the_run_continues() {
        let dir = TempDir::new().unwrap();
        let (source, dest) = (InMemoryClient::new("source"), InMemoryClient::new("dest"));
        source.insert(ObjectKind::Project, json!({ "id": "p1", "name": "alpha" }));
        source.insert(ObjectKind::ProjectTag, json!({ "id": "t1", "name": "hot", "project_id": "p1" }));
        source.fail_list(ObjectKind::Dataset);
        let schema = OpenApiSchema::empty();
        let mut config = config(dir.path());
        config.resources = vec!["datasets".into(), "project_tags".into()];

        let outcome = MigrationOrchestrator::new(&source, &dest, &schema, &config)
            .run()
            .await
            .unwrap();
        let summary = &outcome.report.migration_summary;
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].error.starts_with("Failed to migrate datasets:"));
        assert_eq!(summary.migrated_resources, 1);
        assert!(!outcome.success());
        assert!(outcome.run_dir.join("alpha").join("project_tags_state.json").exists());
        assert!(outcome.summary_path.exists());
    }
}
