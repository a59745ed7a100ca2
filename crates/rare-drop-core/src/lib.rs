//! Pure domain model for rare-drop synchronization.
//!
//! Nothing in this crate performs I/O. The store adapter feeds a [`Catalog`]
//! and a validated [`DropConfig`] into [`plan_drops`], and writes the
//! resulting [`Plan`] under the [`BatchLimits`] of the target store.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

pub mod batch;
pub mod catalog;
pub mod config;
pub mod detect;
pub mod naming;
pub mod planner;
pub mod progress;
pub mod rates;
pub mod tier;

pub use batch::{chunk_ranges, rows_per_batch, BatchLimits, DEFAULT_PARAMETER_CEILING};
pub use catalog::{Actor, Catalog, RareItem};
pub use config::{
    DegradationRule, DropConfig, RegionMode, Strategy, DEFAULT_LEVEL_DISTANCE,
    PROBABILITY_FLOOR_RATIO,
};
pub use detect::{
    mode_of, probability_mode, DetectedConfig, DetectionConfidence, DetectionEvidence,
    DetectionReport, ObservedAssignment, DEFAULT_DETECTION_SAMPLE,
};
pub use naming::{GroupName, NamingScheme, GROUP_PREFIX};
pub use planner::{plan_drops, Assignment, DropGroup, Plan, PlanSummary, TierSummary};
pub use progress::{
    estimate_remaining, scaled_percent, NullProgress, ProgressSink, ProgressUpdate,
};
pub use rates::{probability_table, RateRow};
pub use tier::{Region, Tier};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DropError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("naming error: {0}")]
    Naming(String),
}

/// Logical phase of a destructive write sequence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WritePhase {
    DeleteGroups,
    DeleteAssignments,
    InsertGroups,
    InsertAssignments,
    ClearTables,
    CopySnapshot,
}

impl WritePhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeleteGroups => "delete_groups",
            Self::DeleteAssignments => "delete_assignments",
            Self::InsertGroups => "insert_groups",
            Self::InsertAssignments => "insert_assignments",
            Self::ClearTables => "clear_tables",
            Self::CopySnapshot => "copy_snapshot",
        }
    }
}

impl Display for WritePhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation-level failure taxonomy surfaced to hosts.
///
/// Store adapters raise these inside their error chains so callers can
/// recover the structured reason with `downcast_ref`.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SyncError {
    #[error("connectivity failure: {0}; re-run once the database is reachable")]
    Connectivity(String),
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),
    #[error("validation failure: {0}")]
    Validation(String),
    #[error("snapshot is empty or missing ({groups} group rows, {assignments} assignment rows); refusing to restore")]
    EmptySnapshot { groups: u64, assignments: u64 },
    #[error(
        "partial batch failure during {phase} at chunk {chunk_index}/{chunks_total} \
         after {rows_committed} committed rows: {message}; the drop tables are now in a \
         mixed state (old rows deleted, new rows partially inserted), run restore to recover"
    )]
    PartialBatch {
        phase: WritePhase,
        chunk_index: usize,
        chunks_total: usize,
        rows_committed: u64,
        message: String,
    },
}

impl SyncError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connectivity(_) => "connectivity_failure",
            Self::CatalogUnavailable(_) => "catalog_unavailable",
            Self::Validation(_) => "validation_failure",
            Self::EmptySnapshot { .. } => "empty_snapshot",
            Self::PartialBatch { .. } => "partial_batch_failure",
        }
    }
}

impl From<DropError> for SyncError {
    fn from(err: DropError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`DropError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DropError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| DropError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Parses an RFC3339 timestamp.
///
/// # Errors
/// Returns [`DropError::Validation`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, DropError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DropError::Validation(format!("invalid RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
