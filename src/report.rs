//! The per-run migration report and its human-readable summary.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::SkipReason;
use crate::migrator::MigrationSummary;

pub const REPORT_FILE: &str = "migration_report.json";
pub const SUMMARY_FILE: &str = "migration_summary.txt";
/// Items listed per skip reason before the rest are elided.
const SKIPPED_PREVIEW: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCounts {
    pub total: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ResourceCounts {
    fn add(&mut self, other: ResourceCounts) {
        self.total += other.total;
        self.migrated += other.migrated;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

impl From<&MigrationSummary> for ResourceCounts {
    fn from(summary: &MigrationSummary) -> Self {
        Self {
            total: summary.total,
            migrated: summary.migrated,
            skipped: summary.skipped,
            failed: summary.failed,
        }
    }
}

/// A resource type that could not be processed at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeError {
    pub resource_type: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

/// Summaries of one scope, keyed by report key, in run order.
#[derive(Debug, Clone, Default)]
pub struct ScopeRun {
    pub summaries: Vec<(String, MigrationSummary)>,
}

impl ScopeRun {
    pub fn push(&mut self, key: impl Into<String>, summary: MigrationSummary) {
        self.summaries.push((key.into(), summary));
    }

    pub fn totals(&self) -> ResourceCounts {
        let mut totals = ResourceCounts::default();
        for (_, summary) in &self.summaries {
            totals.add(ResourceCounts::from(summary));
        }
        totals
    }
}

#[derive(Debug, Clone)]
pub struct ProjectRun {
    pub name: String,
    pub source_id: String,
    pub dest_id: String,
    pub scope: ScopeRun,
}

/// Everything one orchestrator run produced, before it is rendered.
#[derive(Debug, Clone)]
pub struct MigrationRun {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub organization: ScopeRun,
    pub projects: Vec<ProjectRun>,
    pub errors: Vec<TypeError>,
    pub orchestrator_error: Option<String>,
}

impl MigrationRun {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            completed_at: started_at,
            organization: ScopeRun::default(),
            projects: Vec::new(),
            errors: Vec::new(),
            orchestrator_error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub success: bool,
    pub total_projects: usize,
    pub total_resources: usize,
    pub migrated_resources: usize,
    pub skipped_resources: usize,
    pub failed_resources: usize,
    pub errors: Vec<TypeError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrator_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeReport {
    pub totals: ResourceCounts,
    pub resources: BTreeMap<String, ResourceCounts>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectReport {
    pub project_name: String,
    pub project_id: String,
    pub source_project_id: String,
    pub totals: ResourceCounts,
    pub resources: BTreeMap<String, ResourceCounts>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakdownEntry {
    pub resource_type: String,
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_id: Option<String>,
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailedBreakdown {
    pub migrated: Vec<BreakdownEntry>,
    pub skipped: Vec<BreakdownEntry>,
    pub failed: Vec<BreakdownEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub migration_summary: RunSummary,
    pub organization_resources: ScopeReport,
    pub projects: BTreeMap<String, ProjectReport>,
    pub detailed_breakdown: DetailedBreakdown,
}

/// Where an entry came from: `(scope, project)`.
type Origin = (Option<String>, Option<String>);

fn collect_breakdown(scope: &ScopeRun, origin: &Origin, breakdown: &mut DetailedBreakdown) {
    let (scope_name, project) = origin;
    let entry = |resource_type: &str, source_id: &str, name: &Option<String>| BreakdownEntry {
        resource_type: resource_type.to_string(),
        source_id: source_id.to_string(),
        dest_id: None,
        name: name.clone(),
        skip_reason: None,
        error: None,
        scope: scope_name.clone(),
        project: project.clone(),
    };
    for (key, summary) in &scope.summaries {
        for detail in &summary.migrated_details {
            breakdown.migrated.push(BreakdownEntry {
                dest_id: Some(detail.dest_id.clone()),
                ..entry(key, &detail.source_id, &detail.name)
            });
        }
        for detail in &summary.skipped_details {
            breakdown.skipped.push(BreakdownEntry {
                dest_id: detail.dest_id.clone(),
                skip_reason: Some(detail.skip_reason),
                ..entry(key, &detail.source_id, &detail.name)
            });
        }
        for detail in &summary.errors {
            breakdown.failed.push(BreakdownEntry {
                error: Some(detail.error.clone()),
                ..entry(key, &detail.source_id, &detail.name)
            });
        }
    }
}

fn resource_counts(scope: &ScopeRun) -> BTreeMap<String, ResourceCounts> {
    let mut counts: BTreeMap<String, ResourceCounts> = BTreeMap::new();
    for (key, summary) in &scope.summaries {
        counts
            .entry(key.clone())
            .or_default()
            .add(ResourceCounts::from(summary));
    }
    counts
}

impl MigrationReport {
    pub fn from_run(run: &MigrationRun) -> Self {
        let mut breakdown = DetailedBreakdown::default();
        collect_breakdown(
            &run.organization,
            &(Some("organization".to_string()), None),
            &mut breakdown,
        );

        let mut totals = run.organization.totals();
        let mut projects = BTreeMap::new();
        for project in &run.projects {
            let project_totals = project.scope.totals();
            totals.add(project_totals);
            collect_breakdown(&project.scope, &(None, Some(project.name.clone())), &mut breakdown);
            projects.insert(
                project.name.clone(),
                ProjectReport {
                    project_name: project.name.clone(),
                    project_id: project.dest_id.clone(),
                    source_project_id: project.source_id.clone(),
                    totals: project_totals,
                    resources: resource_counts(&project.scope),
                },
            );
        }

        let mut errors = run.errors.clone();
        if let Some(message) = &run.orchestrator_error {
            errors.push(TypeError {
                resource_type: "orchestrator_error".to_string(),
                error: message.clone(),
                project: None,
            });
        }
        let duration = (run.completed_at - run.started_at)
            .to_std()
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0);

        Self {
            migration_summary: RunSummary {
                start_time: run.started_at,
                end_time: run.completed_at,
                duration_seconds: duration,
                success: totals.failed == 0 && errors.is_empty(),
                total_projects: run.projects.len(),
                total_resources: totals.total,
                migrated_resources: totals.migrated,
                skipped_resources: totals.skipped,
                failed_resources: totals.failed,
                errors,
                orchestrator_error: run.orchestrator_error.clone(),
            },
            organization_resources: ScopeReport {
                totals: run.organization.totals(),
                resources: resource_counts(&run.organization),
            },
            projects,
            detailed_breakdown: breakdown,
        }
    }
}

pub fn write_report(run_dir: &Path, report: &MigrationReport) -> Result<PathBuf> {
    fs::create_dir_all(run_dir)
        .with_context(|| format!("create run directory {}", run_dir.display()))?;
    let path = run_dir.join(REPORT_FILE);
    let json = serde_json::to_string_pretty(report).context("serialize migration report")?;
    fs::write(&path, json).with_context(|| format!("write migration report {}", path.display()))?;
    Ok(path)
}

pub fn write_summary(run_dir: &Path, report: &MigrationReport) -> Result<PathBuf> {
    fs::create_dir_all(run_dir)
        .with_context(|| format!("create run directory {}", run_dir.display()))?;
    let path = run_dir.join(SUMMARY_FILE);
    fs::write(&path, render_summary(report))
        .with_context(|| format!("write migration summary {}", path.display()))?;
    Ok(path)
}

fn counts_line(counts: &ResourceCounts) -> String {
    format!(
        "Resources: {} total, {} migrated, {} skipped, {} failed",
        counts.total, counts.migrated, counts.skipped, counts.failed
    )
}

fn write_type_lines(out: &mut String, resources: &BTreeMap<String, ResourceCounts>) -> std::fmt::Result {
    for (resource_type, counts) in resources.iter().filter(|(_, counts)| counts.total > 0) {
        writeln!(
            out,
            "  - {resource_type}: {} total ({} migrated, {} skipped, {} failed)",
            counts.total, counts.migrated, counts.skipped, counts.failed
        )?;
    }
    Ok(())
}

fn name_suffix(name: &Option<String>) -> String {
    name.as_deref()
        .filter(|name| !name.is_empty())
        .map(|name| format!(" '{name}'"))
        .unwrap_or_default()
}

fn render(report: &MigrationReport, out: &mut String) -> std::fmt::Result {
    let summary = &report.migration_summary;
    writeln!(out, "# Braintrust Migration Summary")?;
    writeln!(out, "{}", "=".repeat(50))?;
    writeln!(out)?;
    let status = if summary.success { "SUCCESS" } else { "FAILED" };
    writeln!(out, "Migration Status: {status}")?;
    writeln!(out, "Start Time: {}", summary.start_time.to_rfc3339())?;
    writeln!(out, "End Time: {}", summary.end_time.to_rfc3339())?;
    writeln!(out, "Duration: {:.2} seconds", summary.duration_seconds)?;
    writeln!(out)?;

    writeln!(out, "## Overall Results")?;
    writeln!(out, "Projects: {}", summary.total_projects)?;
    writeln!(out, "Total Resources: {}", summary.total_resources)?;
    writeln!(out, "Migrated: {}", summary.migrated_resources)?;
    writeln!(out, "Skipped: {}", summary.skipped_resources)?;
    writeln!(out, "Failed: {}", summary.failed_resources)?;
    for error in &summary.errors {
        match &error.project {
            Some(project) => writeln!(out, "Error ({project}): {}", error.error)?,
            None => writeln!(out, "Error: {}", error.error)?,
        }
    }
    writeln!(out)?;

    let organization = &report.organization_resources;
    if organization.totals.total > 0 {
        writeln!(out, "## Organization Resources")?;
        writeln!(out, "{}", counts_line(&organization.totals))?;
        write_type_lines(out, &organization.resources)?;
        writeln!(out)?;
    }

    writeln!(out, "## Project Breakdown")?;
    for (name, project) in &report.projects {
        writeln!(out)?;
        writeln!(out, "### {name}")?;
        writeln!(out, "Project ID: {}", project.project_id)?;
        writeln!(out, "{}", counts_line(&project.totals))?;
        write_type_lines(out, &project.resources)?;
    }

    let skipped = &report.detailed_breakdown.skipped;
    if !skipped.is_empty() {
        writeln!(out)?;
        writeln!(out, "## Skipped Resources ({} total)", skipped.len())?;
        let mut groups: Vec<(SkipReason, Vec<&BreakdownEntry>)> = Vec::new();
        for item in skipped {
            let reason = item.skip_reason.unwrap_or(SkipReason::Unchanged);
            match groups.iter_mut().find(|(existing, _)| *existing == reason) {
                Some((_, items)) => items.push(item),
                None => groups.push((reason, vec![item])),
            }
        }
        for (reason, items) in &groups {
            writeln!(out)?;
            writeln!(out, "### {} ({} items)", reason.title(), items.len())?;
            for item in items.iter().take(SKIPPED_PREVIEW) {
                writeln!(out, "  - {}: {}{}", item.resource_type, item.source_id, name_suffix(&item.name))?;
            }
            if items.len() > SKIPPED_PREVIEW {
                writeln!(out, "  ... and {} more", items.len() - SKIPPED_PREVIEW)?;
            }
        }
    }

    let failed = &report.detailed_breakdown.failed;
    if !failed.is_empty() {
        writeln!(out)?;
        writeln!(out, "## Failed Resources ({} total)", failed.len())?;
        for item in failed {
            writeln!(out, "- {}: {}{}", item.resource_type, item.source_id, name_suffix(&item.name))?;
            writeln!(out, "  Error: {}", item.error.as_deref().unwrap_or_default())?;
            writeln!(out)?;
        }
    }

    writeln!(out)?;
    writeln!(out, "## Files Generated")?;
    writeln!(out, "- Detailed JSON report: {REPORT_FILE}")?;
    writeln!(out, "- Human-readable summary: {SUMMARY_FILE}")?;
    writeln!(out, "- Checkpoint files: *_state.json")
}

pub fn render_summary(report: &MigrationReport) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = render(report, &mut out);
    out
}
