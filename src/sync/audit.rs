//! Audit trail for sync executions.
//!
//! Each execution appends JSON-lines events to
//! `<state_dir>/audit/audit_<stamp>_<sync_id>.jsonl` and writes
//! `summary_<stamp>_<sync_id>.json` when it finishes. A file that grows past
//! the size limit is closed and the next part (`.1.jsonl`, `.2.jsonl`, ...)
//! is opened. Files older than the retention window are removed by
//! [`AuditLogger::cleanup_old`].

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::config::AuditSettings;
use super::executor::ItemResult;
use super::state::{io_error, ManagedKind};
use super::SyncError;

pub const AUDIT_DIR: &str = "audit";
const EVENTS_PREFIX: &str = "audit_";
const SUMMARY_PREFIX: &str = "summary_";
const FILE_STAMP: &str = "%Y%m%d_%H%M%S";
const SYSTEM: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SyncStart,
    SyncResult,
    RoleAssignment,
    SyncComplete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub sync_id: String,
    pub resource_type: Option<ManagedKind>,
    /// Directory ID for item events, `system` otherwise.
    pub resource_id: String,
    pub organization: String,
    pub dest_id: Option<String>,
    pub operation: String,
    pub success: bool,
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl AuditEvent {
    fn system(sync_id: &str, event_type: AuditEventType, operation: &str, success: bool) -> Self {
        let suffix = match event_type {
            AuditEventType::SyncStart => "start",
            _ => "complete",
        };
        Self {
            event_id: format!("{sync_id}_{suffix}"),
            timestamp: Utc::now(),
            event_type,
            sync_id: sync_id.to_string(),
            resource_type: None,
            resource_id: SYSTEM.into(),
            organization: SYSTEM.into(),
            dest_id: None,
            operation: operation.into(),
            success,
            error_message: None,
            metadata: Map::new(),
        }
    }

    /// One applied (or failed) plan item.
    pub fn for_item(sync_id: &str, result: &ItemResult, duration_ms: u128) -> Self {
        let mut metadata = Map::new();
        metadata.insert("duration_ms".into(), json!(duration_ms));
        Self {
            event_id: format!(
                "{sync_id}_{}_{}_{}",
                result.organization,
                result.kind.as_str(),
                result.directory_id
            ),
            timestamp: Utc::now(),
            event_type: AuditEventType::SyncResult,
            sync_id: sync_id.to_string(),
            resource_type: Some(result.kind),
            resource_id: result.directory_id.clone(),
            organization: result.organization.clone(),
            dest_id: result.dest_id.clone(),
            operation: result.action.as_str().to_string(),
            success: result.success,
            error_message: result.error.clone(),
            metadata,
        }
    }

    /// Role and ACL assignment for one organization.
    pub fn for_assignments(
        sync_id: &str,
        organization: &str,
        error: Option<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            event_id: format!("{sync_id}_{organization}_assignments"),
            timestamp: Utc::now(),
            event_type: AuditEventType::RoleAssignment,
            sync_id: sync_id.to_string(),
            resource_type: Some(ManagedKind::Acl),
            resource_id: "role_project".into(),
            organization: organization.to_string(),
            dest_id: None,
            operation: "assign".into(),
            success: error.is_none(),
            error_message: error,
            metadata,
        }
    }

    fn is_system(&self) -> bool {
        matches!(self.event_type, AuditEventType::SyncStart | AuditEventType::SyncComplete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Authentication,
    RateLimit,
    NotFound,
    Validation,
    Permission,
    Other,
}

impl ErrorCategory {
    /// Buckets an error message by the words and status codes it mentions.
    pub fn of(message: &str) -> Self {
        let lower = message.to_lowercase();
        let mentions = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));
        if mentions(&["network", "connect", "timed out", "timeout"]) {
            ErrorCategory::Network
        } else if mentions(&["authentication", "unauthorized", "401"]) {
            ErrorCategory::Authentication
        } else if mentions(&["rate limit", "429"]) {
            ErrorCategory::RateLimit
        } else if mentions(&["not found", "404"]) {
            ErrorCategory::NotFound
        } else if mentions(&["validation", "invalid", "400"]) {
            ErrorCategory::Validation
        } else if mentions(&["permission", "forbidden", "403"]) {
            ErrorCategory::Permission
        } else {
            ErrorCategory::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network_error",
            ErrorCategory::Authentication => "authentication_error",
            ErrorCategory::RateLimit => "rate_limit_error",
            ErrorCategory::NotFound => "not_found_error",
            ErrorCategory::Validation => "validation_error",
            ErrorCategory::Permission => "permission_error",
            ErrorCategory::Other => "other_error",
        }
    }
}

/// Counts over the item and assignment events of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub sync_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_events: usize,
    pub success_events: usize,
    pub error_events: usize,
    pub operations: BTreeMap<String, usize>,
    pub resource_types: BTreeMap<String, usize>,
    pub organizations: BTreeMap<String, usize>,
    pub error_types: BTreeMap<String, usize>,
}

impl AuditSummary {
    pub fn new(sync_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            sync_id: sync_id.to_string(),
            started_at,
            completed_at: None,
            total_events: 0,
            success_events: 0,
            error_events: 0,
            operations: BTreeMap::new(),
            resource_types: BTreeMap::new(),
            organizations: BTreeMap::new(),
            error_types: BTreeMap::new(),
        }
    }

    pub fn add_event(&mut self, event: &AuditEvent) {
        self.total_events += 1;
        if event.success {
            self.success_events += 1;
        } else {
            self.error_events += 1;
            if let Some(message) = &event.error_message {
                *self
                    .error_types
                    .entry(ErrorCategory::of(message).as_str().to_string())
                    .or_default() += 1;
            }
        }
        *self.operations.entry(event.operation.clone()).or_default() += 1;
        if let Some(kind) = event.resource_type {
            *self.resource_types.entry(kind.as_str().to_string()).or_default() += 1;
        }
        *self.organizations.entry(event.organization.clone()).or_default() += 1;
    }

    /// Percentage of successful events; zero when nothing was recorded.
    pub fn success_rate(&self) -> f64 {
        if self.total_events == 0 {
            return 0.0;
        }
        self.success_events as f64 * 100.0 / self.total_events as f64
    }
}

/// What one execution left on disk.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub summary: AuditSummary,
    pub event_files: Vec<PathBuf>,
    pub summary_path: Option<PathBuf>,
}

struct EventFile {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
    part: u32,
}

pub struct AuditLogger {
    dir: PathBuf,
    max_file_bytes: u64,
    retention_days: u32,
    persist: bool,
    stamp: String,
    current: Option<EventFile>,
    files: Vec<PathBuf>,
    summary: Option<AuditSummary>,
}

impl AuditLogger {
    pub fn new(state_dir: &Path, settings: &AuditSettings) -> Self {
        Self {
            dir: state_dir.join(AUDIT_DIR),
            max_file_bytes: settings.max_file_size_mb.saturating_mul(1024 * 1024),
            retention_days: settings.retention_days,
            persist: settings.enabled,
            stamp: String::new(),
            current: None,
            files: Vec::new(),
            summary: None,
        }
    }

    /// Keeps events in memory only when `persist` is false.
    pub fn persisted(mut self, persist: bool) -> Self {
        self.persist &= persist;
        self
    }

    pub fn with_max_file_bytes(mut self, bytes: u64) -> Self {
        self.max_file_bytes = bytes.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn start(&mut self, sync_id: &str) -> Result<(), SyncError> {
        self.start_at(sync_id, Utc::now())
    }

    /// Opens the execution's first event file and records the start event.
    /// On failure the execution is still summarized, only in memory.
    pub fn start_at(&mut self, sync_id: &str, started_at: DateTime<Utc>) -> Result<(), SyncError> {
        self.summary = Some(AuditSummary::new(sync_id, started_at));
        self.stamp = started_at.format(FILE_STAMP).to_string();
        self.files.clear();
        let opened = if self.persist { self.open_part(0) } else { Ok(()) };
        if opened.is_err() {
            self.persist = false;
        }
        let mut event = AuditEvent::system(sync_id, AuditEventType::SyncStart, "start", true);
        event.timestamp = started_at;
        self.record(event);
        if let Some(file) = &self.current {
            info!(target: "orgmigrate", event = "audit_started", sync_id, file = %file.path.display());
        }
        opened
    }

    pub fn record(&mut self, event: AuditEvent) {
        if !event.is_system() {
            if let Some(summary) = self.summary.as_mut() {
                summary.add_event(&event);
            }
        }
        debug!(
            target: "orgmigrate",
            event = "audit_event",
            event_id = %event.event_id,
            operation = %event.operation,
            organization = %event.organization,
            success = event.success
        );
        if self.persist {
            if let Err(err) = self.write_event(&event) {
                warn!(target: "orgmigrate", event = "audit_write_failed", event_id = %event.event_id, error = %err);
            }
        }
    }

    /// Records the completion event, closes the event file and writes the
    /// summary. Returns `None` when no execution was started.
    pub fn complete(&mut self, success: bool, error: Option<String>) -> Result<Option<AuditReport>, SyncError> {
        let Some(mut summary) = self.summary.take() else {
            return Ok(None);
        };
        let completed_at = Utc::now();
        summary.completed_at = Some(completed_at);

        let operation = if success { "complete" } else { "failed" };
        let mut event = AuditEvent::system(&summary.sync_id, AuditEventType::SyncComplete, operation, success);
        event.timestamp = completed_at;
        event.error_message = error;
        event.metadata.insert("total_events".into(), json!(summary.total_events));
        event.metadata.insert("success_rate".into(), json!(summary.success_rate()));
        event.metadata.insert(
            "duration_seconds".into(),
            json!((completed_at - summary.started_at).num_milliseconds() as f64 / 1000.0),
        );
        self.record(event);
        let closed = self.close_current();

        let summary_path = if self.persist {
            Some(self.write_summary(&summary)?)
        } else {
            None
        };
        closed?;
        info!(
            target: "orgmigrate",
            event = "audit_completed",
            sync_id = %summary.sync_id,
            total_events = summary.total_events,
            success_rate = summary.success_rate()
        );
        Ok(Some(AuditReport {
            summary,
            event_files: std::mem::take(&mut self.files),
            summary_path,
        }))
    }

    /// Removes event and summary files stamped before the retention window.
    pub fn cleanup_old(&self, now: DateTime<Utc>) -> Result<usize, SyncError> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let cutoff = now - Duration::days(i64::from(self.retention_days));
        let entries = fs::read_dir(&self.dir).map_err(|err| io_error(&self.dir, err))?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stamp) = file_stamp(&name) else {
                continue;
            };
            if stamp >= cutoff {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(target: "orgmigrate", event = "audit_cleanup_failed", file = %name, error = %err);
                }
            }
        }
        if removed > 0 {
            info!(target: "orgmigrate", event = "audit_files_cleaned", removed, retention_days = self.retention_days);
        }
        Ok(removed)
    }

    /// Up to `limit` stored summaries, newest first.
    pub fn recent_summaries(&self, limit: usize) -> Result<Vec<AuditSummary>, SyncError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|err| io_error(&self.dir, err))?;
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(SUMMARY_PREFIX) && name.ends_with(".json"))
            })
            .collect();
        paths.sort();
        paths.reverse();

        let mut summaries = Vec::new();
        for path in paths.into_iter().take(limit) {
            let parsed = fs::read_to_string(&path)
                .map_err(|err| err.to_string())
                .and_then(|raw| serde_json::from_str::<AuditSummary>(&raw).map_err(|err| err.to_string()));
            match parsed {
                Ok(summary) => summaries.push(summary),
                Err(err) => warn!(target: "orgmigrate", event = "audit_summary_unreadable", path = %path.display(), error = %err),
            }
        }
        Ok(summaries)
    }

    fn file_base(&self) -> String {
        let sync_id = self.summary.as_ref().map(|summary| summary.sync_id.as_str()).unwrap_or(SYSTEM);
        format!("{}_{sync_id}", self.stamp)
    }

    fn open_part(&mut self, part: u32) -> Result<(), SyncError> {
        fs::create_dir_all(&self.dir).map_err(|err| io_error(&self.dir, err))?;
        let name = match part {
            0 => format!("{EVENTS_PREFIX}{}.jsonl", self.file_base()),
            part => format!("{EVENTS_PREFIX}{}.{part}.jsonl", self.file_base()),
        };
        let path = self.dir.join(name);
        let file = File::create(&path).map_err(|err| io_error(&path, err))?;
        self.files.push(path.clone());
        self.current = Some(EventFile {
            path,
            writer: BufWriter::new(file),
            written: 0,
            part,
        });
        Ok(())
    }

    fn write_event(&mut self, event: &AuditEvent) -> Result<(), SyncError> {
        let rotate_to = match &self.current {
            Some(file) if file.written >= self.max_file_bytes => Some(file.part + 1),
            Some(_) => None,
            None => return Ok(()),
        };
        if let Some(part) = rotate_to {
            self.close_current()?;
            self.open_part(part)?;
            debug!(target: "orgmigrate", event = "audit_file_rotated", part);
        }
        let Some(file) = self.current.as_mut() else {
            return Ok(());
        };
        let line = serde_json::to_string(event).map_err(|source| SyncError::Parse {
            path: file.path.display().to_string(),
            source,
        })?;
        writeln!(file.writer, "{line}")
            .and_then(|()| file.writer.flush())
            .map_err(|err| io_error(&file.path, err))?;
        file.written += line.len() as u64 + 1;
        Ok(())
    }

    fn close_current(&mut self) -> Result<(), SyncError> {
        match self.current.take() {
            Some(mut file) => file.writer.flush().map_err(|err| io_error(&file.path, err)),
            None => Ok(()),
        }
    }

    fn write_summary(&self, summary: &AuditSummary) -> Result<PathBuf, SyncError> {
        fs::create_dir_all(&self.dir).map_err(|err| io_error(&self.dir, err))?;
        let path = self
            .dir
            .join(format!("{SUMMARY_PREFIX}{}_{}.json", self.stamp, summary.sync_id));
        let body = serde_json::to_string_pretty(summary).map_err(|source| SyncError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        fs::write(&path, body).map_err(|err| io_error(&path, err))?;
        Ok(path)
    }
}

/// Stamp embedded in an audit or summary file name.
fn file_stamp(name: &str) -> Option<DateTime<Utc>> {
    let rest = name
        .strip_prefix(EVENTS_PREFIX)
        .or_else(|| name.strip_prefix(SUMMARY_PREFIX))?;
    let stamp = rest.get(..15)?;
    NaiveDateTime::parse_from_str(stamp, FILE_STAMP)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::planner::SyncAction;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn item(directory_id: &str, organization: &str, error: Option<&str>) -> ItemResult {
        ItemResult {
            directory_id: directory_id.into(),
            kind: ManagedKind::User,
            organization: organization.into(),
            action: SyncAction::Create,
            dest_id: error.is_none().then(|| format!("{directory_id}-dest")),
            success: error.is_none(),
            error: error.map(str::to_string),
        }
    }

    fn lines(path: &Path) -> Vec<Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn errors_are_bucketed_by_message() {
        assert_eq!(ErrorCategory::of("failed to connect to acme: refused"), ErrorCategory::Network);
        assert_eq!(ErrorCategory::of("create user failed with status 429: slow down"), ErrorCategory::RateLimit);
        assert_eq!(ErrorCategory::of("update group failed with status 404: gone"), ErrorCategory::NotFound);
        assert_eq!(ErrorCategory::of("status 403: Permission denied"), ErrorCategory::Permission);
        assert_eq!(ErrorCategory::of("injected failure"), ErrorCategory::Other);
    }

    #[test]
    fn summary_counts_items_and_ignores_system_events() {
        let dir = TempDir::new().unwrap();
        let mut audit = AuditLogger::new(dir.path(), &AuditSettings::default());
        audit.start("sync_1").unwrap();
        audit.record(AuditEvent::for_item("sync_1", &item("u1", "acme", None), 3));
        audit.record(AuditEvent::for_item("sync_1", &item("u2", "acme", Some("failed with status 401: bad key")), 5));
        audit.record(AuditEvent::for_item("sync_1", &item("u1", "beta", None), 2));
        let report = audit.complete(false, Some("1 item failed".into())).unwrap().unwrap();

        let summary = &report.summary;
        assert_eq!((summary.total_events, summary.success_events, summary.error_events), (3, 2, 1));
        assert!((summary.success_rate() - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.error_types["authentication_error"], 1);
        assert_eq!(summary.organizations["acme"], 2);
        assert_eq!(summary.operations["create"], 3);
        assert_eq!(summary.resource_types["user"], 3);
        assert!(summary.completed_at.is_some());

        let events = lines(&report.event_files[0]);
        assert_eq!(events.len(), 5);
        assert_eq!(events[0]["event_type"], "sync_start");
        assert_eq!(events[2]["error_message"], "failed with status 401: bad key");
        assert_eq!(events[4]["operation"], "failed");
        assert_eq!(events[4]["metadata"]["total_events"], 3);

        let stored = audit.recent_summaries(10).unwrap();
        assert_eq!(stored, vec![report.summary.clone()]);
        assert!(report.summary_path.unwrap().exists());
    }

    #[test]
    fn oversized_files_roll_over_to_new_parts() {
        let dir = TempDir::new().unwrap();
        let mut audit = AuditLogger::new(dir.path(), &AuditSettings::default()).with_max_file_bytes(1);
        audit.start("sync_1").unwrap();
        audit.record(AuditEvent::for_item("sync_1", &item("u1", "acme", None), 1));
        let report = audit.complete(true, None).unwrap().unwrap();

        // One event per part once the limit is this small.
        assert_eq!(report.event_files.len(), 3);
        assert!(report.event_files[1].to_string_lossy().ends_with(".1.jsonl"));
        for path in &report.event_files {
            assert_eq!(lines(path).len(), 1);
        }
    }

    #[test]
    fn in_memory_logger_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut audit = AuditLogger::new(dir.path(), &AuditSettings::default()).persisted(false);
        audit.start("sync_1").unwrap();
        audit.record(AuditEvent::for_item("sync_1", &item("u1", "acme", None), 1));
        let report = audit.complete(true, None).unwrap().unwrap();
        assert_eq!(report.summary.total_events, 1);
        assert!(report.event_files.is_empty());
        assert!(report.summary_path.is_none());
        assert!(!audit.dir().exists());
    }

    #[test]
    fn cleanup_removes_files_past_retention() {
        let dir = TempDir::new().unwrap();
        let settings = AuditSettings {
            retention_days: 30,
            ..AuditSettings::default()
        };
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        for (sync_id, started_at) in [("sync_old", old), ("sync_new", recent)] {
            let mut audit = AuditLogger::new(dir.path(), &settings);
            audit.start_at(sync_id, started_at).unwrap();
            audit.complete(true, None).unwrap();
        }
        let audit = AuditLogger::new(dir.path(), &settings);
        fs::write(audit.dir().join("notes.txt"), "kept").unwrap();

        let now = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(audit.cleanup_old(now).unwrap(), 2);
        let mut left: Vec<String> = fs::read_dir(audit.dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec![
                "audit_20240301_080000_sync_new.jsonl".to_string(),
                "notes.txt".to_string(),
                "summary_20240301_080000_sync_new.json".to_string(),
            ]
        );
        assert_eq!(audit.recent_summaries(5).unwrap()[0].sync_id, "sync_new");
    }
}
