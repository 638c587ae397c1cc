//! Evaluation targets and the interning store that hands out shared handles.

use crate::sequence::{ExecutionSequence, ValuationContext};
use crate::types::ViewDefinition;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use riskflow_ids::TargetKey;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Immutable description of one view evaluation job.
///
/// Shared as `Arc<EvaluationTarget>`; equal content always hashes to the same
/// [`TargetKey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvaluationTarget {
    pub view_definition: ViewDefinition,
    pub sequence: ExecutionSequence,
    pub time_zone: Tz,
    pub valuation_time: NaiveTime,
    /// Version/correction cutoff for all inputs; `None` means latest.
    pub correction: Option<DateTime<Utc>>,
    pub first_valuation_date: NaiveDate,
    pub include_first_valuation_date: bool,
    pub last_valuation_date: NaiveDate,
    pub include_last_valuation_date: bool,
}

impl EvaluationTarget {
    /// A historical evaluation over `[first, last]`, with per-end inclusivity.
    pub fn historical(
        view_definition: ViewDefinition,
        time_zone: Tz,
        valuation_time: NaiveTime,
        first: (NaiveDate, bool),
        last: (NaiveDate, bool),
    ) -> Self {
        Self {
            view_definition,
            sequence: ExecutionSequence::historical(first.0, last.0, first.1, last.1),
            time_zone,
            valuation_time,
            correction: None,
            first_valuation_date: first.0,
            include_first_valuation_date: first.1,
            last_valuation_date: last.0,
            include_last_valuation_date: last.1,
        }
    }

    pub fn with_correction(mut self, correction: DateTime<Utc>) -> Self {
        self.correction = Some(correction);
        self
    }

    /// Same view, moved to another window.
    pub fn with_window(&self, first: (NaiveDate, bool), last: (NaiveDate, bool)) -> Self {
        let mut target = Self::historical(
            self.view_definition.clone(),
            self.time_zone,
            self.valuation_time,
            first,
            last,
        );
        target.correction = self.correction;
        target
    }

    /// Content hash of everything that defines the job.
    pub fn key(&self) -> TargetKey {
        let bytes = match serde_json::to_vec(self) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Target serialization failed; hashing debug form");
                format!("{:?}", self).into_bytes()
            }
        };
        TargetKey::of_content(&bytes)
    }

    pub fn contexts(&self) -> Vec<ValuationContext> {
        self.sequence
            .contexts(self.time_zone, self.valuation_time, self.correction)
    }

    /// Non-view parameters equal (window, zone, time, correction, sequence).
    pub fn same_schedule(&self, other: &Self) -> bool {
        self.sequence == other.sequence
            && self.time_zone == other.time_zone
            && self.valuation_time == other.valuation_time
            && self.correction == other.correction
            && self.first_valuation_date == other.first_valuation_date
            && self.include_first_valuation_date == other.include_first_valuation_date
            && self.last_valuation_date == other.last_valuation_date
            && self.include_last_valuation_date == other.include_last_valuation_date
    }
}

/// Interning arena for targets.
///
/// Holds weak handles keyed by content, so interning equal content while a
/// handle is alive returns that same allocation.
#[derive(Debug, Default)]
pub struct TargetStore {
    entries: Mutex<HashMap<TargetKey, Weak<EvaluationTarget>>>,
}

impl TargetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, target: EvaluationTarget) -> Arc<EvaluationTarget> {
        let key = target.key();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = entries.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        entries.retain(|_, weak| weak.strong_count() > 0);
        let shared = Arc::new(target);
        entries.insert(key.clone(), Arc::downgrade(&shared));
        debug!(target_key = %key.short(), live = entries.len(), "Interned evaluation target");
        shared
    }

    pub fn get(&self, key: &TargetKey) -> Option<Arc<EvaluationTarget>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).and_then(Weak::upgrade)
    }

    /// Number of targets still referenced somewhere.
    pub fn live(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_target() -> EvaluationTarget {
        EvaluationTarget::historical(
            ViewDefinition::new("Risk", "analyst"),
            chrono_tz::Europe::London,
            NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            (NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), true),
            (NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(), true),
        )
    }

    #[test]
    fn test_key_is_content_addressed() {
        let a = sample_target();
        let b = sample_target();
        assert_eq!(a.key(), b.key());

        let moved = a.with_window(
            (NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), true),
            (NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(), true),
        );
        assert_ne!(a.key(), moved.key());
    }

    #[test]
    fn test_intern_returns_same_allocation_while_alive() {
        let store = TargetStore::new();
        let first = store.intern(sample_target());
        let second = store.intern(sample_target());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.live(), 1);

        let key = first.key();
        drop(first);
        drop(second);
        assert!(store.get(&key).is_none());
        assert_eq!(store.live(), 0);
    }
}
