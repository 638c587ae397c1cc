//! In-memory counters for the evaluation engine.
//!
//! Lock-free atomics behind a single global; `snapshot()` copies them out for
//! reporting and `prometheus_format()` renders the exposition text.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // Evaluation jobs
    pub jobs_started: AtomicU64,
    pub jobs_succeeded: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub duplicate_reports: AtomicU64,

    // Result building
    pub points_recorded: AtomicU64,
    pub unrequested_values_dropped: AtomicU64,

    // Fleet management
    pub notifications_ignored: AtomicU64,
    pub notifications_accepted: AtomicU64,
    pub reinitializations: AtomicU64,
    pub reinitializations_abandoned: AtomicU64,
    pub repository_failures: AtomicU64,

    // Batch persistence
    pub nodes_pruned: AtomicU64,
    pub value_rows_written: AtomicU64,
    pub failure_rows_written: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_started: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            duplicate_reports: AtomicU64::new(0),
            points_recorded: AtomicU64::new(0),
            unrequested_values_dropped: AtomicU64::new(0),
            notifications_ignored: AtomicU64::new(0),
            notifications_accepted: AtomicU64::new(0),
            reinitializations: AtomicU64::new(0),
            reinitializations_abandoned: AtomicU64::new(0),
            repository_failures: AtomicU64::new(0),
            nodes_pruned: AtomicU64::new(0),
            value_rows_written: AtomicU64::new(0),
            failure_rows_written: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_jobs_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_jobs_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_duplicate_reports(&self) {
        self.duplicate_reports.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_points_recorded(&self) {
        self.points_recorded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_unrequested_values_dropped(&self) {
        self.unrequested_values_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_notifications_ignored(&self) {
        self.notifications_ignored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_notifications_accepted(&self) {
        self.notifications_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_reinitializations(&self) {
        self.reinitializations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_reinitializations_abandoned(&self) {
        self.reinitializations_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_repository_failures(&self) {
        self.repository_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_nodes_pruned(&self) {
        self.nodes_pruned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_value_rows_written(&self) {
        self.value_rows_written.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_failure_rows_written(&self) {
        self.failure_rows_written.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_nodes_pruned(&self, count: u64) {
        self.nodes_pruned.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_rows_written(&self, values: u64, failures: u64) {
        self.value_rows_written.fetch_add(values, Ordering::Relaxed);
        self.failure_rows_written.fetch_add(failures, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            duplicate_reports: self.duplicate_reports.load(Ordering::Relaxed),
            points_recorded: self.points_recorded.load(Ordering::Relaxed),
            unrequested_values_dropped: self.unrequested_values_dropped.load(Ordering::Relaxed),
            notifications_ignored: self.notifications_ignored.load(Ordering::Relaxed),
            notifications_accepted: self.notifications_accepted.load(Ordering::Relaxed),
            reinitializations: self.reinitializations.load(Ordering::Relaxed),
            reinitializations_abandoned: self.reinitializations_abandoned.load(Ordering::Relaxed),
            repository_failures: self.repository_failures.load(Ordering::Relaxed),
            nodes_pruned: self.nodes_pruned.load(Ordering::Relaxed),
            value_rows_written: self.value_rows_written.load(Ordering::Relaxed),
            failure_rows_written: self.failure_rows_written.load(Ordering::Relaxed),
        }
    }

    /// Format as Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        for (name, help, value) in s.counters() {
            out.push_str(&format!(
                "# HELP riskflow_{name}_total {help}\n# TYPE riskflow_{name}_total counter\nriskflow_{name}_total {value}\n\n"
            ));
        }
        out
    }
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub jobs_started: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub duplicate_reports: u64,
    pub points_recorded: u64,
    pub unrequested_values_dropped: u64,
    pub notifications_ignored: u64,
    pub notifications_accepted: u64,
    pub reinitializations: u64,
    pub reinitializations_abandoned: u64,
    pub repository_failures: u64,
    pub nodes_pruned: u64,
    pub value_rows_written: u64,
    pub failure_rows_written: u64,
}

impl MetricsSnapshot {
    fn counters(&self) -> [(&'static str, &'static str, u64); 14] {
        [
            ("jobs_started", "Evaluation jobs started", self.jobs_started),
            ("jobs_succeeded", "Evaluation jobs that produced a result", self.jobs_succeeded),
            ("jobs_failed", "Evaluation jobs that failed", self.jobs_failed),
            ("duplicate_reports", "Outcome reports suppressed after the first", self.duplicate_reports),
            ("points_recorded", "Date-series points recorded", self.points_recorded),
            ("unrequested_values_dropped", "Cycle values with no matching requirement", self.unrequested_values_dropped),
            ("notifications_ignored", "Change notifications outside the watch set", self.notifications_ignored),
            ("notifications_accepted", "Change notifications queued for reinitialization", self.notifications_accepted),
            ("reinitializations", "Completed fleet reinitializations", self.reinitializations),
            ("reinitializations_abandoned", "Reinitializations abandoned while suspending", self.reinitializations_abandoned),
            ("repository_failures", "Function repository initialization failures", self.repository_failures),
            ("nodes_pruned", "Dependency graph nodes skipped on restart", self.nodes_pruned),
            ("value_rows_written", "Value rows committed", self.value_rows_written),
            ("failure_rows_written", "Failure rows committed", self.failure_rows_written),
        ]
    }
}
