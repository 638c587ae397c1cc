//! Merging of evaluation targets that can share one view process.
//!
//! Two targets merge when everything except their requirement sets agrees:
//! schedule (window, zone, valuation time, correction), view-level settings,
//! and the non-requirement settings of every calculation configuration they
//! both name. The merged target carries the union of requirements.

use crate::target::{EvaluationTarget, TargetStore};
use std::sync::Arc;
use tracing::debug;

pub struct TargetCollapser {
    store: Arc<TargetStore>,
}

impl TargetCollapser {
    pub fn new(store: Arc<TargetStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<TargetStore> {
        &self.store
    }

    /// Merge two targets, or `None` when they cannot share a view process.
    ///
    /// Returns one of the inputs unchanged when the union adds nothing to it.
    pub fn union(
        &self,
        a: &Arc<EvaluationTarget>,
        b: &Arc<EvaluationTarget>,
    ) -> Option<Arc<EvaluationTarget>> {
        if Arc::ptr_eq(a, b) {
            return Some(Arc::clone(a));
        }
        if !a.same_schedule(b) || !a.view_definition.has_same_settings(&b.view_definition) {
            return None;
        }

        let mut merged = EvaluationTarget::clone(a);
        let configs = &mut merged.view_definition.calculation_configurations;
        for (name, theirs) in &b.view_definition.calculation_configurations {
            match configs.get_mut(name) {
                Some(ours) => {
                    if !ours.is_compatible_with(theirs) {
                        debug!(calc_conf = %name, "Calculation configurations differ; not merging");
                        return None;
                    }
                    ours.requirements
                        .extend(theirs.requirements.iter().cloned());
                }
                None => {
                    configs.insert(name.clone(), theirs.clone());
                }
            }
        }

        // Schedules already match; the view name does not affect the job.
        if merged.view_definition.same_content(&a.view_definition) {
            return Some(Arc::clone(a));
        }
        if merged.view_definition.same_content(&b.view_definition) {
            return Some(Arc::clone(b));
        }
        let merged = self.store.intern(merged);
        debug!(
            a = %a.key().short(),
            b = %b.key().short(),
            merged = %merged.key().short(),
            "Merged evaluation targets"
        );
        Some(merged)
    }

    /// Fold a list of targets into the fewest jobs, first-fit in input order.
    pub fn collapse_all(&self, targets: &[Arc<EvaluationTarget>]) -> Vec<Arc<EvaluationTarget>> {
        let mut collapsed: Vec<Arc<EvaluationTarget>> = Vec::new();
        for target in targets {
            let slot = collapsed
                .iter()
                .enumerate()
                .find_map(|(i, existing)| self.union(existing, target).map(|merged| (i, merged)));
            match slot {
                Some((i, merged)) => collapsed[i] = merged,
                None => collapsed.push(Arc::clone(target)),
            }
        }
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CalculationConfiguration, TargetSpecification, ValueProperties, ValueRequirement,
        ViewDefinition,
    };
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};

    fn requirement(name: &str) -> ValueRequirement {
        ValueRequirement::new(name, TargetSpecification::position("Pos", "1"))
    }

    fn target(view: ViewDefinition) -> EvaluationTarget {
        EvaluationTarget::historical(
            view,
            chrono_tz::America::New_York,
            NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            (NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(), true),
            (NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(), true),
        )
    }

    fn view(reqs: &[&str]) -> ViewDefinition {
        let mut config = CalculationConfiguration::new("Default");
        for r in reqs {
            config = config.with_requirement(requirement(r));
        }
        ViewDefinition::new("Risk", "analyst").with_calculation_configuration(config)
    }

    fn collapser() -> TargetCollapser {
        TargetCollapser::new(Arc::new(TargetStore::new()))
    }

    #[test]
    fn test_union_with_itself_is_identity() {
        let c = collapser();
        let a = c.store().intern(target(view(&["PV"])));
        let copy = Arc::new(target(view(&["PV"])));
        assert!(Arc::ptr_eq(&c.union(&a, &a).unwrap(), &a));
        assert!(Arc::ptr_eq(&c.union(&a, &copy).unwrap(), &a));
    }

    #[test]
    fn test_union_returns_superset_input() {
        let c = collapser();
        let big = Arc::new(target(view(&["PV", "Delta"])));
        let small = Arc::new(target(view(&["PV"])));
        assert!(Arc::ptr_eq(&c.union(&small, &big).unwrap(), &big));
        assert!(Arc::ptr_eq(&c.union(&big, &small).unwrap(), &big));
    }

    #[test]
    fn test_superset_is_returned_whatever_its_name() {
        let c = collapser();
        let small = Arc::new(target(view(&["PV"])));
        let mut renamed = view(&["PV", "Delta"]);
        renamed.name = "Risk (desk copy)".to_string();
        let big = Arc::new(target(renamed));

        assert!(Arc::ptr_eq(&c.union(&small, &big).unwrap(), &big));
        assert!(Arc::ptr_eq(&c.union(&big, &small).unwrap(), &big));
        assert_eq!(c.store().live(), 0);
    }

    #[test]
    fn test_union_is_commutative_on_requirements() {
        let c = collapser();
        let a = Arc::new(target(view(&["PV"])));
        let b = Arc::new(target(view(&["Delta"])));
        let ab = c.union(&a, &b).unwrap();
        let ba = c.union(&b, &a).unwrap();
        let reqs = |t: &EvaluationTarget| {
            t.view_definition
                .calculation_configuration("Default")
                .unwrap()
                .requirements
                .clone()
        };
        assert_eq!(reqs(&ab), reqs(&ba));
        assert_eq!(reqs(&ab).len(), 2);
        assert!(Arc::ptr_eq(&ab, &ba));
    }

    #[test]
    fn test_extra_configuration_is_added() {
        let c = collapser();
        let a = Arc::new(target(view(&["PV"])));
        let extra = view(&["PV"]).with_calculation_configuration(
            CalculationConfiguration::new("Stressed").with_requirement(requirement("PV")),
        );
        let b = Arc::new(target(extra));
        let merged = c.union(&a, &b).unwrap();
        assert_eq!(merged.view_definition.calculation_configurations.len(), 2);
        assert!(Arc::ptr_eq(&merged, &b));
    }

    #[test]
    fn test_non_negotiable_differences_refuse_merge() {
        let c = collapser();
        let a = Arc::new(target(view(&["PV"])));

        let corrected = Arc::new(
            target(view(&["Delta"])).with_correction(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
        );
        assert!(c.union(&a, &corrected).is_none());

        let other_window = Arc::new(a.with_window(
            (NaiveDate::from_ymd_opt(2024, 2, 2).unwrap(), true),
            (NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(), true),
        ));
        assert!(c.union(&a, &other_window).is_none());

        let mut currency = target(view(&["Delta"]));
        currency.view_definition.default_currency = Some("EUR".to_string());
        assert!(c.union(&a, &Arc::new(currency)).is_none());

        let mut defaults = target(view(&["Delta"]));
        if let Some(config) = defaults
            .view_definition
            .calculation_configurations
            .get_mut("Default")
        {
            config.default_properties = ValueProperties::new().with("Currency", "USD");
        }
        assert!(c.union(&a, &Arc::new(defaults)).is_none());
    }

    #[test]
    fn test_collapse_all_groups_compatible_targets() {
        let c = collapser();
        let a = Arc::new(target(view(&["PV"])));
        let b = Arc::new(target(view(&["Delta"])));
        let mut odd = target(view(&["Gamma"]));
        odd.view_definition.market_data_user = "other".to_string();
        let odd = Arc::new(odd);

        let collapsed = c.collapse_all(&[a, odd.clone(), b]);
        assert_eq!(collapsed.len(), 2);
        assert!(Arc::ptr_eq(&collapsed[1], &odd));
        let reqs = &collapsed[0]
            .view_definition
            .calculation_configuration("Default")
            .unwrap()
            .requirements;
        assert_eq!(reqs.len(), 2);
    }
}
