//! Extra identifiers to watch, derived from what repositories reported.

use riskflow_ids::ObjectId;
use std::collections::HashSet;
use std::sync::Arc;

/// Maps the identifiers repositories depend on to additional identifiers
/// whose mutation must also trigger reinitialization. Must be pure.
pub trait WatchSetProvider: Send + Sync {
    fn additional_watch_set(&self, ids: &HashSet<ObjectId>) -> HashSet<ObjectId>;
}

/// Contributes a fixed set whenever any identifier of a scheme is present.
#[derive(Debug, Clone)]
pub struct SchemeWatchSetProvider {
    scheme: String,
    additional: HashSet<ObjectId>,
}

impl SchemeWatchSetProvider {
    pub fn new(scheme: impl Into<String>, additional: impl IntoIterator<Item = ObjectId>) -> Self {
        Self {
            scheme: scheme.into(),
            additional: additional.into_iter().collect(),
        }
    }
}

impl WatchSetProvider for SchemeWatchSetProvider {
    fn additional_watch_set(&self, ids: &HashSet<ObjectId>) -> HashSet<ObjectId> {
        if ids.iter().any(|id| id.scheme() == self.scheme) {
            self.additional.clone()
        } else {
            HashSet::new()
        }
    }
}

/// Union of several providers.
#[derive(Default, Clone)]
pub struct CompositeWatchSetProvider {
    providers: Vec<Arc<dyn WatchSetProvider>>,
}

impl CompositeWatchSetProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn WatchSetProvider>) -> Self {
        self.providers.push(provider);
        self
    }
}

impl WatchSetProvider for CompositeWatchSetProvider {
    fn additional_watch_set(&self, ids: &HashSet<ObjectId>) -> HashSet<ObjectId> {
        self.providers
            .iter()
            .flat_map(|p| p.additional_watch_set(ids))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[(&str, &str)]) -> HashSet<ObjectId> {
        items.iter().map(|(s, v)| ObjectId::new(*s, *v)).collect()
    }

    #[test]
    fn test_scheme_provider_matches_on_scheme() {
        let provider = SchemeWatchSetProvider::new("Curve", ids(&[("Snapshot", "Live")]));
        assert_eq!(
            provider.additional_watch_set(&ids(&[("Curve", "USD")])),
            ids(&[("Snapshot", "Live")])
        );
        assert!(provider
            .additional_watch_set(&ids(&[("Security", "AAPL")]))
            .is_empty());
    }

    #[test]
    fn test_composite_unions_contributions() {
        let composite = CompositeWatchSetProvider::new()
            .with_provider(Arc::new(SchemeWatchSetProvider::new(
                "Curve",
                ids(&[("Snapshot", "Live")]),
            )))
            .with_provider(Arc::new(SchemeWatchSetProvider::new(
                "Security",
                ids(&[("Holiday", "NYSE"), ("Snapshot", "Live")]),
            )));
        let out = composite.additional_watch_set(&ids(&[("Curve", "USD"), ("Security", "AAPL")]));
        assert_eq!(out, ids(&[("Snapshot", "Live"), ("Holiday", "NYSE")]));
    }
}
