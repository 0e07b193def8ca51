use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use super::assignments::{AssignmentOutcome, RoleProjectAssigner};
use super::audit::{AuditEvent, AuditLogger, AuditReport};
use super::config::SyncConfig;
use super::drift;
use super::planner::{OrgClients, PlanItem, SyncAction, SyncPlan};
use super::state::{DriftWarning, ManagedKind, StateManager, SyncState, SyncStatus};
use super::SyncError;
use crate::client::{ObjectKind, PlatformClient, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    Users,
    Groups,
    Finalizing,
    DriftDetection,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Log what would change and write nothing.
    pub dry_run: bool,
    pub continue_on_error: bool,
    pub detect_drift: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            continue_on_error: true,
            detect_drift: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrgProgress {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionProgress {
    pub plan_id: String,
    pub phase: Phase,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub skipped_items: usize,
    pub by_org: BTreeMap<String, OrgProgress>,
    pub phase_started_at: BTreeMap<Phase, DateTime<Utc>>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ExecutionProgress {
    fn new(plan: &SyncPlan) -> Self {
        Self {
            plan_id: plan.plan_id.clone(),
            phase: Phase::Initializing,
            total_items: plan.total_items(),
            completed_items: 0,
            failed_items: 0,
            skipped_items: 0,
            by_org: BTreeMap::new(),
            phase_started_at: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn start(&mut self, phase: Phase) {
        self.phase = phase;
        self.phase_started_at.insert(phase, Utc::now());
        info!(target: "orgmigrate", event = "sync_phase_started", plan_id = %self.plan_id, phase = ?phase);
    }

    fn record(&mut self, organization: &str, outcome: &ItemOutcome) {
        let org = self.by_org.entry(organization.to_string()).or_default();
        match outcome {
            ItemOutcome::Skipped => {
                self.skipped_items += 1;
                org.skipped += 1;
            }
            ItemOutcome::Applied => {
                self.completed_items += 1;
                org.completed += 1;
            }
            ItemOutcome::Failed => {
                self.failed_items += 1;
                org.failed += 1;
            }
        }
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total_items == 0 {
            return 100.0;
        }
        let done = self.completed_items + self.failed_items + self.skipped_items;
        done as f64 * 100.0 / self.total_items as f64
    }
}

enum ItemOutcome {
    Applied,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub directory_id: String,
    pub kind: ManagedKind,
    pub organization: String,
    pub action: SyncAction,
    pub dest_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub sync_id: String,
    pub dry_run: bool,
    pub progress: ExecutionProgress,
    pub results: Vec<ItemResult>,
    pub assignments: BTreeMap<String, AssignmentOutcome>,
    pub drift_warnings: Vec<DriftWarning>,
    pub state_path: Option<PathBuf>,
    pub checkpoint_path: Option<PathBuf>,
    /// Audit summary, with the files written when not a dry run.
    pub audit: Option<AuditReport>,
}

impl ExecutionReport {
    pub fn success(&self) -> bool {
        self.progress.phase == Phase::Completed && self.progress.failed_items == 0
    }
}

fn object_kind(kind: ManagedKind) -> ObjectKind {
    match kind {
        ManagedKind::User => ObjectKind::User,
        ManagedKind::Group => ObjectKind::Group,
        ManagedKind::Role => ObjectKind::Role,
        ManagedKind::Project => ObjectKind::Project,
        ManagedKind::Acl => ObjectKind::Acl,
    }
}

/// Applies a plan: users, then groups and role assignments, then
/// finalization and a drift check.
pub struct SyncExecutor<'a> {
    config: &'a SyncConfig,
    targets: &'a OrgClients<'a>,
    states: &'a StateManager,
    options: ExecutionOptions,
    retry: RetryPolicy,
}

impl<'a> SyncExecutor<'a> {
    pub fn new(
        config: &'a SyncConfig,
        targets: &'a OrgClients<'a>,
        states: &'a StateManager,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            config,
            targets,
            states,
            options,
            retry: RetryPolicy::none(),
        }
    }

    /// Retries writes with `retry`. Only for clients that do not retry on
    /// their own, such as a bare `HttpClient`; a `RetryingClient` already does.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn client(&self, organization: &str) -> Result<&'a dyn PlatformClient, SyncError> {
        self.targets
            .get(organization)
            .copied()
            .ok_or_else(|| SyncError::UnknownOrganization(organization.to_string()))
    }

    pub async fn execute(&self, plan: &SyncPlan, state: &mut SyncState) -> Result<ExecutionReport, SyncError> {
        let mut progress = ExecutionProgress::new(plan);
        let mut report = ExecutionReport {
            sync_id: state.sync_id.clone(),
            dry_run: self.options.dry_run,
            progress: progress.clone(),
            results: Vec::new(),
            assignments: BTreeMap::new(),
            drift_warnings: Vec::new(),
            state_path: None,
            checkpoint_path: None,
            audit: None,
        };

        progress.start(Phase::Initializing);
        for item in plan.items() {
            self.client(&item.organization)?;
        }
        state.stats.insert("plan_id".into(), json!(plan.plan_id));
        state.stats.insert("config_hash".into(), json!(plan.config_hash));

        let mut audit = AuditLogger::new(self.states.dir(), &self.config.audit).persisted(!self.options.dry_run);
        if let Err(err) = audit.start(&state.sync_id) {
            warn!(target: "orgmigrate", event = "audit_start_failed", sync_id = %state.sync_id, error = %err);
            progress.warnings.push(format!("audit trail unavailable: {err}"));
        }

        let phases = [(Phase::Users, &plan.user_items), (Phase::Groups, &plan.group_items)];
        for (phase, items) in phases {
            progress.start(phase);
            for item in items.iter() {
                if let Err(err) = self.run_item(item, state, &mut progress, &mut report, &mut audit).await {
                    return self.abort(err, state, progress, report, audit);
                }
            }
            if phase == Phase::Groups {
                if let Err(err) = self.run_assignments(state, &mut progress, &mut report, &mut audit).await {
                    return self.abort(err, state, progress, report, audit);
                }
            }
        }

        progress.start(Phase::Finalizing);
        if let Err(err) = self.finalize(state, &progress, &mut report) {
            self.close_audit(&mut audit, false, Some(err.to_string()), &mut progress);
            return Err(err);
        }

        if self.options.detect_drift {
            progress.start(Phase::DriftDetection);
            self.run_drift_detection(state, &mut progress, &mut report).await;
        }

        let failure = (progress.failed_items > 0).then(|| format!("{} items failed", progress.failed_items));
        report.audit = self.close_audit(&mut audit, failure.is_none(), failure, &mut progress);

        progress.start(Phase::Completed);
        info!(
            target: "orgmigrate",
            event = "sync_completed",
            sync_id = %state.sync_id,
            completed = progress.completed_items,
            failed = progress.failed_items,
            skipped = progress.skipped_items,
            dry_run = self.options.dry_run
        );
        report.progress = progress;
        Ok(report)
    }

    fn abort(
        &self,
        err: SyncError,
        state: &mut SyncState,
        mut progress: ExecutionProgress,
        mut report: ExecutionReport,
        mut audit: AuditLogger,
    ) -> Result<ExecutionReport, SyncError> {
        error!(target: "orgmigrate", event = "sync_aborted", sync_id = %state.sync_id, error = %err);
        progress.errors.push(err.to_string());
        progress.start(Phase::Finalizing);
        if let Err(save_err) = self.finalize(state, &progress, &mut report) {
            warn!(target: "orgmigrate", event = "sync_state_save_failed", error = %save_err);
        }
        self.close_audit(&mut audit, false, Some(err.to_string()), &mut progress);
        progress.start(Phase::Failed);
        Err(err)
    }

    /// Writes the completion event and summary, then drops expired audit
    /// files. Audit failures become warnings; they never fail the sync.
    fn close_audit(
        &self,
        audit: &mut AuditLogger,
        success: bool,
        error: Option<String>,
        progress: &mut ExecutionProgress,
    ) -> Option<AuditReport> {
        let report = match audit.complete(success, error) {
            Ok(report) => report,
            Err(err) => {
                warn!(target: "orgmigrate", event = "audit_complete_failed", error = %err);
                progress.warnings.push(format!("failed to write audit summary: {err}"));
                None
            }
        };
        if !self.options.dry_run {
            if let Err(err) = audit.cleanup_old(Utc::now()) {
                warn!(target: "orgmigrate", event = "audit_cleanup_failed", error = %err);
            }
        }
        report
    }

    async fn run_item(
        &self,
        item: &PlanItem,
        state: &mut SyncState,
        progress: &mut ExecutionProgress,
        report: &mut ExecutionReport,
        audit: &mut AuditLogger,
    ) -> Result<(), SyncError> {
        let kind = match item.kind {
            ManagedKind::User => "user",
            _ => "group",
        };
        let started = Instant::now();
        let outcome = self.apply_item(item, state).await;
        let (result, item_outcome) = match outcome {
            Ok(dest_id) => {
                let skipped = item.action == SyncAction::Skip;
                (
                    ItemResult {
                        directory_id: item.directory_id.clone(),
                        kind: item.kind,
                        organization: item.organization.clone(),
                        action: item.action,
                        dest_id,
                        success: true,
                        error: None,
                    },
                    if skipped { ItemOutcome::Skipped } else { ItemOutcome::Applied },
                )
            }
            Err(message) => {
                warn!(
                    target: "orgmigrate",
                    event = "sync_item_failed",
                    kind,
                    directory_id = %item.directory_id,
                    organization = %item.organization,
                    error = %message
                );
                progress.errors.push(format!("{kind} {}: {message}", item.identifier));
                (
                    ItemResult {
                        directory_id: item.directory_id.clone(),
                        kind: item.kind,
                        organization: item.organization.clone(),
                        action: item.action,
                        dest_id: None,
                        success: false,
                        error: Some(message.clone()),
                    },
                    ItemOutcome::Failed,
                )
            }
        };
        let failed = matches!(item_outcome, ItemOutcome::Failed);
        progress.record(&item.organization, &item_outcome);
        let message = result.error.clone();
        audit.record(AuditEvent::for_item(&state.sync_id, &result, started.elapsed().as_millis()));
        report.results.push(result);

        match message {
            Some(message) if failed && !self.options.continue_on_error => Err(SyncError::ItemFailed {
                kind,
                identifier: item.identifier.clone(),
                organization: item.organization.clone(),
                message,
            }),
            _ => Ok(()),
        }
    }

    /// Group membership resolved through the mappings known so far.
    fn member_ids(&self, item: &PlanItem, state: &SyncState) -> Value {
        let mut ids: Vec<&str> = item
            .members
            .iter()
            .filter_map(|member| state.mapping(member, &item.organization, ManagedKind::User))
            .collect();
        ids.sort();
        ids.dedup();
        json!(ids)
    }

    fn payload(&self, item: &PlanItem, state: &SyncState) -> Map<String, Value> {
        let mut fields = item.proposed_changes.clone();
        if item.kind == ManagedKind::Group && fields.contains_key("member_users") && self.config.groups.sync_memberships {
            fields.insert("member_users".into(), self.member_ids(item, state));
        }
        fields
    }

    async fn apply_item(&self, item: &PlanItem, state: &mut SyncState) -> Result<Option<String>, String> {
        let client = self.client(&item.organization).map_err(|err| err.to_string())?;
        let kind = object_kind(item.kind);
        let dry_run = self.options.dry_run;

        match item.action {
            SyncAction::Error => Err(item.reason.clone()),
            SyncAction::Skip => {
                if let (Some(existing), false) = (item.existing_id.as_deref(), dry_run) {
                    state.set_mapping(&item.directory_id, existing, &item.organization, item.kind);
                    state.track_resource(item.kind, existing, Some(&item.identifier), &item.organization, false, None);
                }
                Ok(item.existing_id.clone())
            }
            SyncAction::Create => {
                let fields = self.payload(item, state);
                if dry_run {
                    info!(target: "orgmigrate", event = "dry_run_create", kind = %kind, identifier = %item.identifier, organization = %item.organization);
                    return Ok(None);
                }
                let created = self
                    .retry
                    .run("create", || client.create(kind, fields.clone()))
                    .await
                    .map_err(|err| err.to_string())?;
                let dest_id = created
                    .id()
                    .ok_or_else(|| format!("created {kind} has no id"))?
                    .to_string();
                let config = Value::Object(fields);
                state.set_mapping(&item.directory_id, &dest_id, &item.organization, item.kind);
                state.track_resource(item.kind, &dest_id, Some(&item.identifier), &item.organization, true, Some(&config));
                Ok(Some(dest_id))
            }
            SyncAction::Update => {
                let existing = item
                    .existing_id
                    .clone()
                    .ok_or_else(|| "update has no target id".to_string())?;
                let fields = self.payload(item, state);
                if dry_run {
                    info!(target: "orgmigrate", event = "dry_run_update", kind = %kind, identifier = %item.identifier, fields = ?fields.keys().collect::<Vec<_>>());
                    return Ok(Some(existing));
                }
                self.retry
                    .run("update", || client.update(kind, &existing, fields.clone()))
                    .await
                    .map_err(|err| err.to_string())?;
                let config = Value::Object(fields);
                state.set_mapping(&item.directory_id, &existing, &item.organization, item.kind);
                state.track_resource(item.kind, &existing, Some(&item.identifier), &item.organization, false, Some(&config));
                Ok(Some(existing))
            }
            SyncAction::Delete => {
                let existing = item
                    .existing_id
                    .clone()
                    .ok_or_else(|| "delete has no target id".to_string())?;
                if dry_run {
                    info!(target: "orgmigrate", event = "dry_run_delete", kind = %kind, id = %existing);
                    return Ok(Some(existing));
                }
                self.retry
                    .run("delete", || client.delete(kind, &existing))
                    .await
                    .map_err(|err| err.to_string())?;
                state.remove_mapping(&item.directory_id, &item.organization, item.kind);
                Ok(Some(existing))
            }
        }
    }

    async fn run_assignments(
        &self,
        state: &mut SyncState,
        progress: &mut ExecutionProgress,
        report: &mut ExecutionReport,
        audit: &mut AuditLogger,
    ) -> Result<(), SyncError> {
        let Some(role_project) = &self.config.role_project else {
            return Ok(());
        };
        for (organization, client) in self.targets.iter() {
            let assigner = RoleProjectAssigner::new(*client, organization, role_project, self.retry, self.options.dry_run);
            let result = assigner.run(state).await;
            let event = match &result {
                Ok(outcome) => {
                    let metadata = match serde_json::to_value(outcome) {
                        Ok(Value::Object(counts)) => counts,
                        _ => Map::new(),
                    };
                    AuditEvent::for_assignments(&state.sync_id, organization, outcome.errors.first().cloned(), metadata)
                }
                Err(err) => AuditEvent::for_assignments(&state.sync_id, organization, Some(err.to_string()), Map::new()),
            };
            audit.record(event);
            match result {
                Ok(outcome) => {
                    if let (Some(first), false) = (outcome.errors.first(), self.options.continue_on_error) {
                        return Err(SyncError::ItemFailed {
                            kind: "assignment",
                            identifier: "role_project".into(),
                            organization: organization.clone(),
                            message: first.clone(),
                        });
                    }
                    progress
                        .errors
                        .extend(outcome.errors.iter().map(|e| format!("{organization}: {e}")));
                    report.assignments.insert(organization.clone(), outcome);
                }
                Err(err) if self.options.continue_on_error => {
                    warn!(target: "orgmigrate", event = "role_assignments_failed", organization = %organization, error = %err);
                    progress.errors.push(format!("{organization}: role assignments failed: {err}"));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Records stats, marks and saves the state, then writes a checkpoint copy.
    fn finalize(
        &self,
        state: &mut SyncState,
        progress: &ExecutionProgress,
        report: &mut ExecutionReport,
    ) -> Result<(), SyncError> {
        state.stats.insert("completed_items".into(), json!(progress.completed_items));
        state.stats.insert("failed_items".into(), json!(progress.failed_items));
        state.stats.insert("skipped_items".into(), json!(progress.skipped_items));
        state.stats.insert("errors".into(), json!(progress.errors.len()));
        state.stats.insert("managed".into(), state.managed_summary());
        state.completed_at = Some(Utc::now());
        state.status = if progress.failed_items == 0 && progress.errors.is_empty() {
            SyncStatus::Completed
        } else {
            SyncStatus::Failed
        };
        if self.options.dry_run {
            return Ok(());
        }
        report.state_path = Some(self.states.save(state)?);
        report.checkpoint_path = Some(self.states.checkpoint(state, "final")?);
        Ok(())
    }

    async fn run_drift_detection(
        &self,
        state: &mut SyncState,
        progress: &mut ExecutionProgress,
        report: &mut ExecutionReport,
    ) {
        for (organization, client) in self.targets.iter() {
            match drift::check_organization(state, organization, *client).await {
                Ok(warnings) => report.drift_warnings.extend(warnings),
                Err(err) => progress
                    .warnings
                    .push(format!("{organization}: drift detection failed: {err}")),
            }
        }
        if !report.drift_warnings.is_empty() && !self.options.dry_run {
            match self.states.save(state) {
                Ok(path) => report.state_path = Some(path),
                Err(err) => progress.warnings.push(format!("failed to save drift warnings: {err}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::client::memory::InMemoryClient;
    use crate::client::RetryingClient;
    use crate::config::OrgConfig;
    use crate::sync::identity::{DirectoryGroup, DirectoryUser, JsonDirectory};
    use crate::sync::planner::SyncPlanner;
    use tempfile::TempDir;

    fn config() -> SyncConfig {
        let mut orgs = BTreeMap::new();
        orgs.insert("acme".to_string(), OrgConfig::new("key"));
        SyncConfig::new(orgs)
    }

    fn directory() -> JsonDirectory {
        let user = |id: &str, email: &str| DirectoryUser {
            id: id.into(),
            email: Some(email.into()),
            given_name: id.to_uppercase(),
            family_name: "Test".into(),
            status: "ACTIVE".into(),
        };
        JsonDirectory::new(
            vec![user("u1", "one@acme.com"), user("u2", "two@acme.com")],
            vec![DirectoryGroup {
                id: "g1".into(),
                name: "eng".into(),
                description: Some("Engineering".into()),
                members: vec!["u1".into(), "u2".into()],
            }],
        )
    }

    async fn plan_for(config: &SyncConfig, client: &InMemoryClient, state: &SyncState) -> SyncPlan {
        let directory = directory();
        let targets: OrgClients<'_> = [("acme".to_string(), client as &dyn PlatformClient)].into();
        SyncPlanner::new(config, &directory, Some(state)).plan(&targets).await.unwrap()
    }

    #[tokio::test]
    async fn applies_users_before_groups_and_saves_state() {
        let dir = TempDir::new().unwrap();
        let client = InMemoryClient::new("acme");
        let config = config();
        let states = StateManager::new(dir.path());
        let mut state = SyncState::new("sync_1", json!({}));
        let plan = plan_for(&config, &client, &state).await;

        let targets: OrgClients<'_> = [("acme".to_string(), &client as &dyn PlatformClient)].into();
        let executor = SyncExecutor::new(&config, &targets, &states, ExecutionOptions::default());
        let report = executor.execute(&plan, &mut state).await.unwrap();

        assert!(report.success());
        assert_eq!(report.progress.completed_items, 3);
        assert_eq!(report.progress.by_org["acme"].completed, 3);
        let group = &client.created(ObjectKind::Group)[0];
        let u1 = state.mapping("u1", "acme", ManagedKind::User).unwrap().to_string();
        let u2 = state.mapping("u2", "acme", ManagedKind::User).unwrap().to_string();
        let mut expected = vec![u1, u2];
        expected.sort();
        assert_eq!(group.get("member_users"), Some(&json!(expected)));
        assert_eq!(state.status, SyncStatus::Completed);
        assert!(report.state_path.unwrap().exists());
        assert!(report.checkpoint_path.unwrap().exists());
        let audit = report.audit.unwrap();
        assert_eq!(audit.summary.total_events, 3);
        assert_eq!(audit.summary.success_rate(), 100.0);
        assert_eq!(audit.summary.resource_types["group"], 1);
        assert!(audit.summary_path.unwrap().exists());
        assert_eq!(audit.event_files.len(), 1);

        // Second plan against the synced organization changes nothing.
        let replan = plan_for(&config, &client, &state).await;
        assert_eq!(replan.count(SyncAction::Skip), replan.total_items());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let client = InMemoryClient::new("acme");
        let config = config();
        let states = StateManager::new(dir.path());
        let mut state = SyncState::new("sync_1", json!({}));
        let plan = plan_for(&config, &client, &state).await;

        let targets: OrgClients<'_> = [("acme".to_string(), &client as &dyn PlatformClient)].into();
        let options = ExecutionOptions {
            dry_run: true,
            ..ExecutionOptions::default()
        };
        let report = SyncExecutor::new(&config, &targets, &states, options)
            .execute(&plan, &mut state)
            .await
            .unwrap();
        assert_eq!(client.create_count(), 0);
        assert!(report.state_path.is_none());
        assert!(states.list().unwrap().is_empty());
        assert!(state.resource_mappings.is_empty());
        assert_eq!(report.audit.unwrap().summary.total_events, 3);
        assert!(!dir.path().join(crate::sync::audit::AUDIT_DIR).exists());
    }

    #[tokio::test]
    async fn failures_are_isolated_unless_stop_on_error() {
        let dir = TempDir::new().unwrap();
        let client = InMemoryClient::new("acme");
        client.fail_creates(ObjectKind::User);
        let config = config();
        let states = StateManager::new(dir.path());
        let targets: OrgClients<'_> = [("acme".to_string(), &client as &dyn PlatformClient)].into();

        let mut state = SyncState::new("sync_1", json!({}));
        let plan = plan_for(&config, &client, &state).await;
        let report = SyncExecutor::new(&config, &targets, &states, ExecutionOptions::default())
            .execute(&plan, &mut state)
            .await
            .unwrap();
        assert_eq!(report.progress.failed_items, 2);
        assert_eq!(report.progress.completed_items, 1);
        assert!(!report.success());
        assert_eq!(state.status, SyncStatus::Failed);
        assert_eq!(report.audit.as_ref().unwrap().summary.error_types["other_error"], 2);

        let mut state = SyncState::new("sync_2", json!({}));
        let options = ExecutionOptions {
            continue_on_error: false,
            ..ExecutionOptions::default()
        };
        let err = SyncExecutor::new(&config, &targets, &states, options)
            .execute(&plan, &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ItemFailed { kind: "user", .. }));
        assert_eq!(states.load("sync_2").unwrap().status, SyncStatus::Failed);

        // The aborted run still leaves a summary behind.
        let summaries = AuditLogger::new(dir.path(), &config.audit).recent_summaries(10).unwrap();
        let aborted = summaries.iter().find(|summary| summary.sync_id == "sync_2").unwrap();
        assert_eq!((aborted.total_events, aborted.error_events), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn writes_through_a_retrying_client_are_retried_once_per_call() {
        let dir = TempDir::new().unwrap();
        let client = RetryingClient::new(InMemoryClient::new("acme"), RetryPolicy::new(3, Duration::from_millis(10)));
        client.inner().fail_creates(ObjectKind::User);
        let config = config();
        let states = StateManager::new(dir.path());
        let mut state = SyncState::new("sync_1", json!({}));
        let plan = plan_for(&config, client.inner(), &state).await;

        let targets: OrgClients<'_> = [("acme".to_string(), &client as &dyn PlatformClient)].into();
        let report = SyncExecutor::new(&config, &targets, &states, ExecutionOptions::default())
            .execute(&plan, &mut state)
            .await
            .unwrap();
        assert_eq!(report.progress.failed_items, 2);
        // Two users, one call plus three retries each.
        assert_eq!(client.inner().create_attempts(ObjectKind::User), 8);
    }

    #[tokio::test]
    async fn unknown_organization_fails_before_any_write() {
        let dir = TempDir::new().unwrap();
        let client = InMemoryClient::new("acme");
        let config = config();
        let states = StateManager::new(dir.path());
        let mut state = SyncState::new("sync_1", json!({}));
        let plan = plan_for(&config, &client, &state).await;

        let targets: OrgClients<'_> = BTreeMap::new();
        let err = SyncExecutor::new(&config, &targets, &states, ExecutionOptions::default())
            .execute(&plan, &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownOrganization(name) if name == "acme"));
        assert_eq!(client.create_count(), 0);
    }
}
