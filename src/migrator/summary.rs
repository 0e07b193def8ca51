use serde::{Deserialize, Serialize};

use crate::checkpoint::SkipReason;

/// Outcome of processing one resource in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationResult {
    pub success: bool,
    pub source_id: String,
    pub dest_id: Option<String>,
    pub skipped: bool,
    pub skip_reason: Option<SkipReason>,
    pub error: Option<String>,
    pub checksum: Option<String>,
    pub name: Option<String>,
}

impl MigrationResult {
    pub fn migrated(
        source_id: impl Into<String>,
        dest_id: impl Into<String>,
        checksum: impl Into<String>,
        name: Option<String>,
    ) -> Self {
        Self {
            success: true,
            source_id: source_id.into(),
            dest_id: Some(dest_id.into()),
            skipped: false,
            skip_reason: None,
            error: None,
            checksum: Some(checksum.into()),
            name,
        }
    }

    pub fn skipped(
        source_id: impl Into<String>,
        dest_id: Option<String>,
        reason: SkipReason,
        name: Option<String>,
    ) -> Self {
        Self {
            success: true,
            source_id: source_id.into(),
            dest_id,
            skipped: true,
            skip_reason: Some(reason),
            error: None,
            checksum: None,
            name,
        }
    }

    pub fn failed(
        source_id: impl Into<String>,
        error: impl Into<String>,
        name: Option<String>,
    ) -> Self {
        Self {
            success: false,
            source_id: source_id.into(),
            dest_id: None,
            skipped: false,
            skip_reason: None,
            error: Some(error.into()),
            checksum: None,
            name,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub source_id: String,
    pub error: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedDetail {
    pub source_id: String,
    pub dest_id: Option<String>,
    pub name: Option<String>,
    pub skip_reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratedDetail {
    pub source_id: String,
    pub dest_id: String,
    pub name: Option<String>,
}

/// Per-resource-type totals returned by `migrate_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub resource_type: String,
    pub total: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<ErrorDetail>,
    pub skipped_details: Vec<SkippedDetail>,
    pub migrated_details: Vec<MigratedDetail>,
}

impl MigrationSummary {
    pub fn empty(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Self::default()
        }
    }

    pub fn absorb(&mut self, results: &[MigrationResult]) {
        for result in results {
            self.total += 1;
            if !result.success {
                self.failed += 1;
                self.errors.push(ErrorDetail {
                    source_id: result.source_id.clone(),
                    error: result.error.clone().unwrap_or_default(),
                    name: result.name.clone(),
                });
            } else if result.skipped {
                self.skipped += 1;
                self.skipped_details.push(SkippedDetail {
                    source_id: result.source_id.clone(),
                    dest_id: result.dest_id.clone(),
                    name: result.name.clone(),
                    skip_reason: result.skip_reason.unwrap_or(SkipReason::Unchanged),
                });
            } else {
                self.migrated += 1;
                self.migrated_details.push(MigratedDetail {
                    source_id: result.source_id.clone(),
                    dest_id: result.dest_id.clone().unwrap_or_default(),
                    name: result.name.clone(),
                });
            }
        }
    }
}
