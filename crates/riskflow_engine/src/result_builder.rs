//! Folding of per-cycle values into date series.
//!
//! Points arrive in any date order. Each requirement gets a series builder
//! keyed by epoch day, which starts compact-numeric and is promoted once to
//! the general representation the first time a non-numeric value shows up.

use crate::error::{EngineError, Result};
use crate::metrics::METRICS;
use crate::process::{CompiledViewDefinition, CycleResult};
use crate::types::{ComputedValue, ValueRequirement, ValueSpecification, ViewDefinition};
use chrono::{Datelike, NaiveDate};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// `NaiveDate::num_days_from_ce()` of 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

pub fn epoch_day(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub fn date_from_epoch_day(day: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(day + UNIX_EPOCH_DAYS_FROM_CE)
}

// ============================================================================
// Series Builders
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct NumericSeriesBuilder {
    points: BTreeMap<i32, f64>,
}

impl NumericSeriesBuilder {
    /// Widen into the general representation, keeping every point.
    pub fn promote(self) -> GeneralSeriesBuilder {
        GeneralSeriesBuilder {
            points: self
                .points
                .into_iter()
                .map(|(day, v)| (day, ComputedValue::Double(v)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GeneralSeriesBuilder {
    points: BTreeMap<i32, ComputedValue>,
}

/// Accumulates the points of one requirement.
#[derive(Debug, Clone)]
pub enum SeriesBuilder {
    Numeric(NumericSeriesBuilder),
    General(GeneralSeriesBuilder),
}

impl SeriesBuilder {
    /// Representation suited to the first value seen.
    pub fn for_value(value: &ComputedValue) -> Self {
        match value {
            ComputedValue::Double(_) => Self::Numeric(NumericSeriesBuilder::default()),
            ComputedValue::Other(_) => Self::General(GeneralSeriesBuilder::default()),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        let day = epoch_day(date);
        match self {
            Self::Numeric(b) => b.points.contains_key(&day),
            Self::General(b) => b.points.contains_key(&day),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(b) => b.points.len(),
            Self::General(b) => b.points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record one point. Returns `false` (and records nothing) when the date
    /// already has a value.
    pub fn add_point(&mut self, date: NaiveDate, value: ComputedValue) -> bool {
        if self.contains(date) {
            return false;
        }
        let day = epoch_day(date);
        match (self, value) {
            (Self::Numeric(b), ComputedValue::Double(v)) => {
                b.points.insert(day, v);
            }
            (this, value) => {
                this.promote();
                if let Self::General(b) = this {
                    b.points.insert(day, value);
                }
            }
        }
        true
    }

    /// Migrate a numeric builder to the general representation in place.
    pub fn promote(&mut self) {
        if let Self::Numeric(numeric) = self {
            let general = std::mem::take(numeric).promote();
            *self = Self::General(general);
        }
    }

    pub fn build(&self) -> DateSeries {
        match self {
            Self::Numeric(b) => DateSeries::Double(
                b.points
                    .iter()
                    .filter_map(|(day, v)| date_from_epoch_day(*day).map(|d| (d, *v)))
                    .collect(),
            ),
            Self::General(b) => DateSeries::Object(
                b.points
                    .iter()
                    .filter_map(|(day, v)| date_from_epoch_day(*day).map(|d| (d, v.clone())))
                    .collect(),
            ),
        }
    }
}

/// A finished, date-ordered series with at most one value per date.
#[derive(Debug, Clone, PartialEq)]
pub enum DateSeries {
    Double(Vec<(NaiveDate, f64)>),
    Object(Vec<(NaiveDate, ComputedValue)>),
}

impl DateSeries {
    pub fn len(&self) -> usize {
        match self {
            Self::Double(points) => points.len(),
            Self::Object(points) => points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        match self {
            Self::Double(points) => points.iter().map(|(d, _)| *d).collect(),
            Self::Object(points) => points.iter().map(|(d, _)| *d).collect(),
        }
    }

    pub fn get(&self, date: NaiveDate) -> Option<ComputedValue> {
        self.points()
            .into_iter()
            .find(|(d, _)| *d == date)
            .map(|(_, v)| v)
    }

    pub fn points(&self) -> Vec<(NaiveDate, ComputedValue)> {
        match self {
            Self::Double(points) => points
                .iter()
                .map(|(d, v)| (*d, ComputedValue::Double(*v)))
                .collect(),
            Self::Object(points) => points.clone(),
        }
    }
}

// ============================================================================
// View Result Builder
// ============================================================================

/// Final output of one evaluation job: per configuration, per requirement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewEvaluationResult {
    pub series: BTreeMap<String, BTreeMap<ValueRequirement, DateSeries>>,
}

impl ViewEvaluationResult {
    pub fn get(&self, calc_conf: &str, requirement: &ValueRequirement) -> Option<&DateSeries> {
        self.series.get(calc_conf)?.get(requirement)
    }
}

/// Accumulates cycle results for one job.
///
/// Requirements with no recorded points are absent from the finished result.
#[derive(Debug)]
pub struct ViewEvaluationResultBuilder {
    requested: BTreeMap<String, BTreeSet<ValueRequirement>>,
    mappings: HashMap<String, HashMap<ValueSpecification, BTreeSet<ValueRequirement>>>,
    builders: BTreeMap<String, BTreeMap<ValueRequirement, SeriesBuilder>>,
    result: Option<Arc<ViewEvaluationResult>>,
}

impl ViewEvaluationResultBuilder {
    pub fn new(view: &ViewDefinition) -> Self {
        let requested = view
            .calculation_configurations
            .iter()
            .map(|(name, config)| (name.clone(), config.requirements.clone()))
            .collect();
        Self {
            requested,
            mappings: HashMap::new(),
            builders: BTreeMap::new(),
            result: None,
        }
    }

    /// Replace the output-to-requirement fan-out after a (re)compilation.
    pub fn add_compiled(&mut self, compiled: &CompiledViewDefinition) {
        for (calc_conf, outputs) in &compiled.terminal_outputs {
            let mapping = outputs
                .iter()
                .map(|(spec, reqs)| (spec.clone(), reqs.clone()))
                .collect();
            self.mappings.insert(calc_conf.clone(), mapping);
        }
        debug!(
            configs = compiled.terminal_outputs.len(),
            "Recorded compiled output mappings"
        );
    }

    pub fn add_cycle_results(&mut self, cycle: &CycleResult) -> Result<()> {
        for (calc_conf, values) in &cycle.values {
            for (spec, value) in values {
                let requirements = match self
                    .mappings
                    .get(calc_conf)
                    .and_then(|m| m.get(spec))
                    .filter(|reqs| !reqs.is_empty())
                {
                    Some(reqs) => reqs.clone(),
                    None => {
                        warn!(
                            calc_conf = %calc_conf,
                            output = %spec,
                            "Dropping output that maps to no requirement"
                        );
                        METRICS.inc_unrequested_values_dropped();
                        continue;
                    }
                };
                for requirement in requirements {
                    self.add_point(calc_conf, &requirement, cycle.valuation_date, value.clone())?;
                }
            }
        }
        Ok(())
    }

    /// Record one point; a second value for the same date is a [`EngineError::DuplicateResult`].
    pub fn add_point(
        &mut self,
        calc_conf: &str,
        requirement: &ValueRequirement,
        date: NaiveDate,
        value: ComputedValue,
    ) -> Result<()> {
        if self.result.is_some() {
            return Err(EngineError::invalid_state(
                "Result already finalized; no more points accepted",
            ));
        }
        let is_requested = self
            .requested
            .get(calc_conf)
            .is_some_and(|reqs| reqs.contains(requirement));
        if !is_requested {
            warn!(
                calc_conf = %calc_conf,
                requirement = %requirement,
                "Dropping value for a requirement with no series"
            );
            METRICS.inc_unrequested_values_dropped();
            return Ok(());
        }

        let builder = self
            .builders
            .entry(calc_conf.to_string())
            .or_default()
            .entry(requirement.clone())
            .or_insert_with(|| SeriesBuilder::for_value(&value));
        if !builder.add_point(date, value) {
            return Err(EngineError::DuplicateResult {
                requirement: requirement.to_string(),
                date,
            });
        }
        METRICS.inc_points_recorded();
        Ok(())
    }

    /// Finish the result. Later calls return the same instance.
    pub fn make_result(&mut self) -> Arc<ViewEvaluationResult> {
        if let Some(result) = &self.result {
            return Arc::clone(result);
        }
        let series = self
            .builders
            .iter()
            .map(|(calc_conf, builders)| {
                let finished = builders
                    .iter()
                    .map(|(req, builder)| (req.clone(), builder.build()))
                    .collect();
                (calc_conf.clone(), finished)
            })
            .collect();
        let result = Arc::new(ViewEvaluationResult { series });
        self.result = Some(Arc::clone(&result));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CalculationConfiguration, TargetSpecification};
    use proptest::prelude::*;
    use serde_json::json;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    /// Distinct day offsets in a random order, plus the index that carries a
    /// non-numeric value.
    fn shuffled_days() -> impl Strategy<Value = (Vec<i64>, usize)> {
        proptest::collection::btree_set(0i64..400, 1..40).prop_flat_map(|days| {
            let days: Vec<i64> = days.into_iter().collect();
            let len = days.len();
            (Just(days).prop_shuffle(), 0..len)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn test_any_insertion_order_builds_sorted_complete_series(
            (days, other_at) in shuffled_days(),
        ) {
            let base = d(1);
            let mut builder = SeriesBuilder::for_value(&ComputedValue::Double(0.0));
            let mut expected = BTreeMap::new();
            for (i, offset) in days.iter().enumerate() {
                let date = base + chrono::Duration::days(*offset);
                let value = if i == other_at {
                    ComputedValue::Other(json!({ "offset": offset }))
                } else {
                    ComputedValue::Double(*offset as f64)
                };
                prop_assert!(builder.add_point(date, value.clone()));
                expected.insert(date, value);
            }

            let series = builder.build();
            prop_assert!(matches!(series, DateSeries::Object(_)));
            prop_assert_eq!(series.len(), days.len());
            let dates = series.dates();
            prop_assert!(dates.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(series.points(), expected.into_iter().collect::<Vec<_>>());

            let repeat = base + chrono::Duration::days(days[0]);
            prop_assert!(!builder.add_point(repeat, ComputedValue::Double(-1.0)));
            prop_assert_eq!(builder.len(), days.len());
        }
    }

    #[test]
    fn test_epoch_day_round_trip() {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        assert_eq!(epoch_day(epoch), 0);
        assert_eq!(date_from_epoch_day(epoch_day(d(15))), Some(d(15)));
    }

    #[test]
    fn test_out_of_order_points_come_out_sorted() {
        let mut builder = SeriesBuilder::for_value(&ComputedValue::Double(0.0));
        for day in [5, 1, 4, 2, 3] {
            assert!(builder.add_point(d(day), ComputedValue::Double(day as f64)));
        }
        let series = builder.build();
        assert_eq!(series.dates(), (1..=5).map(d).collect::<Vec<_>>());
        assert!(matches!(series, DateSeries::Double(_)));
    }

    #[test]
    fn test_promotion_keeps_earlier_points() {
        let mut builder = SeriesBuilder::for_value(&ComputedValue::Double(0.0));
        builder.add_point(d(2), ComputedValue::Double(2.0));
        builder.add_point(d(1), ComputedValue::Double(1.0));
        builder.add_point(d(3), ComputedValue::Other(json!({"curve": "USD"})));

        assert!(matches!(builder, SeriesBuilder::General(_)));
        let series = builder.build();
        assert_eq!(
            series.points(),
            vec![
                (d(1), ComputedValue::Double(1.0)),
                (d(2), ComputedValue::Double(2.0)),
                (d(3), ComputedValue::Other(json!({"curve": "USD"}))),
            ]
        );
    }

    #[test]
    fn test_duplicate_date_is_rejected_without_promotion() {
        let mut builder = SeriesBuilder::for_value(&ComputedValue::Double(0.0));
        assert!(builder.add_point(d(1), ComputedValue::Double(1.0)));
        assert!(!builder.add_point(d(1), ComputedValue::Double(1.0)));
        assert!(!builder.add_point(d(1), ComputedValue::Other(json!("x"))));
        assert!(matches!(builder, SeriesBuilder::Numeric(_)));
        assert_eq!(builder.len(), 1);
    }

    fn pv() -> ValueRequirement {
        ValueRequirement::new("PV", TargetSpecification::position("Pos", "1"))
    }

    fn view() -> ViewDefinition {
        ViewDefinition::new("Risk", "analyst")
            .with_calculation_configuration(CalculationConfiguration::new("Default").with_requirement(pv()))
    }

    #[test]
    fn test_view_builder_duplicate_is_fatal_even_with_same_value() {
        let mut builder = ViewEvaluationResultBuilder::new(&view());
        builder
            .add_point("Default", &pv(), d(1), ComputedValue::Double(1.0))
            .unwrap();
        let err = builder
            .add_point("Default", &pv(), d(1), ComputedValue::Double(1.0))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateResult { .. }));
    }

    #[test]
    fn test_unmapped_outputs_are_dropped() {
        let mut builder = ViewEvaluationResultBuilder::new(&view());
        let spec = ValueSpecification::new("PV", TargetSpecification::position("Pos", "1"), "pv-fn");
        let stray = ValueSpecification::new("Theta", TargetSpecification::position("Pos", "1"), "theta-fn");
        builder.add_compiled(&CompiledViewDefinition::default().with_output("Default", spec.clone(), pv()));

        let cycle = CycleResult::new(d(1))
            .with_value("Default", spec, 10.0)
            .with_value("Default", stray, 3.0)
            .with_value("Unknown", ValueSpecification::new("PV", TargetSpecification::position("Pos", "9"), "f"), 1.0);
        builder.add_cycle_results(&cycle).unwrap();

        let result = builder.make_result();
        assert_eq!(result.series.len(), 1);
        assert_eq!(
            result.get("Default", &pv()).unwrap().get(d(1)),
            Some(ComputedValue::Double(10.0))
        );
    }

    #[test]
    fn test_make_result_is_idempotent_and_final() {
        let mut builder = ViewEvaluationResultBuilder::new(&view());
        builder
            .add_point("Default", &pv(), d(1), ComputedValue::Double(1.0))
            .unwrap();
        let first = builder.make_result();
        let second = builder.make_result();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(builder
            .add_point("Default", &pv(), d(2), ComputedValue::Double(2.0))
            .is_err());
    }
}
