//! Row and request types for the batch tables.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Run Types
// ============================================================================

/// A persisted batch execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: i64,
    pub valuation_date: NaiveDate,
    /// Valuation time label, e.g. `"17:00"` or `"LDN_CLOSE"`.
    pub valuation_time: String,
    pub snapshot_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub num_restarts: i32,
    pub complete: bool,
}

/// What a caller wants recorded when a batch starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub valuation_date: NaiveDate,
    pub valuation_time: String,
    pub snapshot_ref: Option<String>,
    /// Run parameters; a restarted run must present the same set.
    pub parameters: BTreeMap<String, String>,
    pub calc_configs: Vec<String>,
}

/// How `start_batch` treats an existing run for the same valuation slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunCreationMode {
    /// Restart the existing run if there is one, otherwise create.
    #[default]
    Auto,
    /// Always create a fresh run.
    Always,
    /// Only restart; fail when no run exists.
    Never,
}

/// Result of starting a batch.
#[derive(Debug, Clone)]
pub struct StartedBatch {
    pub run: Run,
    pub restarted: bool,
}

impl StartedBatch {
    pub fn is_restart(&self) -> bool {
        self.restarted
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// Per-target execution status within a run and calculation configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetStatus {
    Running,
    Success,
    Failure,
    NotRunning,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::NotRunning => "NOT_RUNNING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            "NOT_RUNNING" => Some(Self::NotRunning),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One `(calc config, target) -> status` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub calc_conf: String,
    pub target: String,
    pub status: TargetStatus,
}

impl StatusEntry {
    pub fn new(calc_conf: impl Into<String>, target: impl Into<String>, status: TargetStatus) -> Self {
        Self {
            calc_conf: calc_conf.into(),
            target: target.into(),
            status,
        }
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Identity of one stored output: config + requirement name + properties + target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueKey {
    pub calc_conf: String,
    pub value_name: String,
    /// Canonical rendering of the value's resolved properties.
    pub properties: String,
    pub target: String,
}

/// A successful numeric output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueRow {
    pub key: ValueKey,
    pub value: f64,
}

/// A failed output with links to the reasons behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRow {
    pub key: ValueKey,
    /// Content hashes of [`ComputeFailureKey`]s that caused this failure.
    pub reasons: Vec<String>,
}

/// Root cause of a failed function invocation; stored once per distinct content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeFailureKey {
    pub function_id: String,
    pub exception_class: String,
    pub exception_msg: String,
    pub stack_trace: String,
}

impl ComputeFailureKey {
    pub fn new(
        function_id: impl Into<String>,
        exception_class: impl Into<String>,
        exception_msg: impl Into<String>,
        stack_trace: impl Into<String>,
    ) -> Self {
        Self {
            function_id: function_id.into(),
            exception_class: exception_class.into(),
            exception_msg: exception_msg.into(),
            stack_trace: stack_trace.into(),
        }
    }

    /// Stable content hash used for deduplication.
    pub fn content_hash(&self) -> String {
        const SEP: u8 = 0x1f;
        let mut hasher = blake3::Hasher::new();
        for part in [
            &self.function_id,
            &self.exception_class,
            &self.exception_msg,
            &self.stack_trace,
        ] {
            hasher.update(part.as_bytes());
            hasher.update(&[SEP]);
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Everything produced by one executed unit, committed in a single transaction.
#[derive(Debug, Clone, Default)]
pub struct ResultBatch {
    pub run_id: i64,
    pub values: Vec<ValueRow>,
    pub failures: Vec<FailureRow>,
    pub compute_failures: Vec<ComputeFailureKey>,
    pub statuses: Vec<StatusEntry>,
}

impl ResultBatch {
    pub fn new(run_id: i64) -> Self {
        Self {
            run_id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
            && self.failures.is_empty()
            && self.compute_failures.is_empty()
            && self.statuses.is_empty()
    }
}

/// Row counts written by one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWriteSummary {
    pub values: u64,
    pub failures: u64,
    pub failure_reasons: u64,
    pub compute_failures: u64,
    pub statuses: u64,
}
