//! Engine configuration.
//!
//! Both structs deserialize with every field optional so a partial JSON
//! document only overrides what it names.

use riskflow_ids::ObjectId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Canonical defaults.
pub mod defaults {
    use std::time::Duration;

    pub const DEFAULT_CLIENT_USER: &str = "riskflow";
    pub const DEFAULT_DEFINITION_NAME_PREFIX: &str = "ViewEvaluation";
    pub const DEFAULT_SUSPEND_TIMEOUT: Duration = Duration::from_millis(100);
}

/// Settings for [`crate::ViewEvaluationFunction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// User the view client is opened as.
    pub client_user: String,
    pub wait_for_first_trigger: bool,
    pub run_as_fast_as_possible: bool,
    pub skip_cycle_on_missing_market_data: bool,
    /// Published definitions are named `"{prefix} {target key}"`.
    pub definition_name_prefix: String,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            client_user: defaults::DEFAULT_CLIENT_USER.to_string(),
            wait_for_first_trigger: false,
            run_as_fast_as_possible: true,
            skip_cycle_on_missing_market_data: true,
            definition_name_prefix: defaults::DEFAULT_DEFINITION_NAME_PREFIX.to_string(),
        }
    }
}

impl EvaluationConfig {
    pub fn with_client_user(mut self, user: impl Into<String>) -> Self {
        self.client_user = user.into();
        self
    }

    pub fn with_definition_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.definition_name_prefix = prefix.into();
        self
    }

    pub fn with_wait_for_first_trigger(mut self, wait: bool) -> Self {
        self.wait_for_first_trigger = wait;
        self
    }

    pub fn with_skip_cycle_on_missing_market_data(mut self, skip: bool) -> Self {
        self.skip_cycle_on_missing_market_data = skip;
        self
    }
}

/// Settings for [`crate::ViewProcessorManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// How long one suspend round waits on each outstanding process.
    #[serde(with = "duration_millis")]
    pub suspend_timeout: Duration,
    /// Abandon a reinitialization after this many suspend rounds; `None` waits forever.
    pub max_suspend_rounds: Option<u32>,
    /// Identifiers that are always watched regardless of what repositories report.
    pub sentinel_ids: Vec<ObjectId>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            suspend_timeout: defaults::DEFAULT_SUSPEND_TIMEOUT,
            max_suspend_rounds: None,
            sentinel_ids: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn with_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.suspend_timeout = timeout;
        self
    }

    pub fn with_max_suspend_rounds(mut self, rounds: u32) -> Self {
        self.max_suspend_rounds = Some(rounds);
        self
    }

    pub fn with_sentinel_id(mut self, id: ObjectId) -> Self {
        self.sentinel_ids.push(id);
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluation_defaults() {
        let config = EvaluationConfig::default();
        assert!(!config.wait_for_first_trigger);
        assert!(config.run_as_fast_as_possible);
        assert!(config.skip_cycle_on_missing_market_data);
        assert_eq!(config.definition_name_prefix, "ViewEvaluation");
    }

    #[test]
    fn test_partial_manager_config_keeps_defaults() {
        let config: ManagerConfig =
            serde_json::from_str(r#"{"max_suspend_rounds": 3, "sentinel_ids": ["Cfg~Marker"]}"#)
                .unwrap();
        assert_eq!(config.suspend_timeout, Duration::from_millis(100));
        assert_eq!(config.max_suspend_rounds, Some(3));
        assert_eq!(config.sentinel_ids, vec![ObjectId::new("Cfg", "Marker")]);
    }
}
