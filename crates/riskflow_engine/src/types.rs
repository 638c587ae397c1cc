//! Domain types shared by evaluation, collapsing and batch persistence.

use riskflow_ids::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// Targets
// ============================================================================

/// Level of the portfolio hierarchy (or raw data) a computation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetKind {
    PortfolioNode,
    Position,
    Trade,
    Security,
    Primitive,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortfolioNode => "PORTFOLIO_NODE",
            Self::Position => "POSITION",
            Self::Trade => "TRADE",
            Self::Security => "SECURITY",
            Self::Primitive => "PRIMITIVE",
        }
    }

    /// Position-level targets carry restart status; everything else is re-executed.
    pub fn is_position_level(&self) -> bool {
        matches!(self, Self::PortfolioNode | Self::Position | Self::Trade)
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a value is computed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetSpecification {
    pub kind: TargetKind,
    pub id: ObjectId,
}

impl TargetSpecification {
    pub fn new(kind: TargetKind, id: ObjectId) -> Self {
        Self { kind, id }
    }

    pub fn position(scheme: &str, value: &str) -> Self {
        Self::new(TargetKind::Position, ObjectId::new(scheme, value))
    }

    pub fn primitive(scheme: &str, value: &str) -> Self {
        Self::new(TargetKind::Primitive, ObjectId::new(scheme, value))
    }
}

impl fmt::Display for TargetSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// ============================================================================
// Values
// ============================================================================

/// Property name to allowed values; an empty set means "any value".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueProperties(BTreeMap<String, BTreeSet<String>>);

impl ValueProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.entry(name.into()).or_default().insert(value.into());
        self
    }

    pub fn with_any(mut self, name: impl Into<String>) -> Self {
        self.0.entry(name.into()).or_default();
        self
    }

    pub fn get(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable text form, e.g. `{Currency=[USD],Curve=[]}`; used as a storage key.
    pub fn canonical(&self) -> String {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(name, values)| {
                let values: Vec<&str> = values.iter().map(String::as_str).collect();
                format!("{}=[{}]", name, values.join(","))
            })
            .collect();
        format!("{{{}}}", parts.join(","))
    }
}

/// A request for a named value on a target, under property constraints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueRequirement {
    pub value_name: String,
    pub target: TargetSpecification,
    #[serde(default)]
    pub constraints: ValueProperties,
}

impl ValueRequirement {
    pub fn new(value_name: impl Into<String>, target: TargetSpecification) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            constraints: ValueProperties::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: ValueProperties) -> Self {
        self.constraints = constraints;
        self
    }
}

impl fmt::Display for ValueRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.value_name, self.target)
    }
}

/// A concrete, resolved output produced by one function on one target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueSpecification {
    pub value_name: String,
    pub target: TargetSpecification,
    #[serde(default)]
    pub properties: ValueProperties,
    /// Function that produces the value.
    pub function_id: String,
}

impl ValueSpecification {
    pub fn new(
        value_name: impl Into<String>,
        target: TargetSpecification,
        function_id: impl Into<String>,
    ) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            properties: ValueProperties::default(),
            function_id: function_id.into(),
        }
    }

    pub fn with_properties(mut self, properties: ValueProperties) -> Self {
        self.properties = properties;
        self
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} on {} via {}",
            self.value_name,
            self.properties.canonical(),
            self.target,
            self.function_id
        )
    }
}

/// A computed value: numeric, or anything else the engine treats opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComputedValue {
    Double(f64),
    Other(serde_json::Value),
}

impl ComputedValue {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Double(_))
    }

    /// Numeric view used for persistence; JSON numbers count as numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::Other(v) => v.as_f64(),
        }
    }
}

impl From<f64> for ComputedValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<serde_json::Value> for ComputedValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Other(value)
    }
}

// ============================================================================
// View Definitions
// ============================================================================

/// Numeric tolerance used when comparing cycle results for delta recalculation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeltaDefinition {
    pub number_comparison_decimal_places: Option<u32>,
}

/// A named set of requirements evaluated under shared defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationConfiguration {
    pub name: String,
    #[serde(default)]
    pub requirements: BTreeSet<ValueRequirement>,
    #[serde(default)]
    pub default_properties: ValueProperties,
    #[serde(default)]
    pub delta_definition: DeltaDefinition,
    /// Named resolution rule transform applied during compilation.
    #[serde(default)]
    pub resolution_transform: Option<String>,
}

impl CalculationConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requirements: BTreeSet::new(),
            default_properties: ValueProperties::default(),
            delta_definition: DeltaDefinition::default(),
            resolution_transform: None,
        }
    }

    pub fn with_requirement(mut self, requirement: ValueRequirement) -> Self {
        self.requirements.insert(requirement);
        self
    }

    pub fn with_default_properties(mut self, properties: ValueProperties) -> Self {
        self.default_properties = properties;
        self
    }

    /// Same configuration apart from the requirement set.
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.name == other.name
            && self.default_properties == other.default_properties
            && self.delta_definition == other.delta_definition
            && self.resolution_transform == other.resolution_transform
    }
}

/// Which outputs of a target kind are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    None,
    TerminalOutputs,
    #[default]
    All,
}

/// Output policy per target kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultModelDefinition {
    pub aggregate_position_output: OutputMode,
    pub position_output: OutputMode,
    pub trade_output: OutputMode,
    pub security_output: OutputMode,
    pub primitive_output: OutputMode,
}

impl ResultModelDefinition {
    pub fn output_mode(&self, kind: TargetKind) -> OutputMode {
        match kind {
            TargetKind::PortfolioNode => self.aggregate_position_output,
            TargetKind::Position => self.position_output,
            TargetKind::Trade => self.trade_output,
            TargetKind::Security => self.security_output,
            TargetKind::Primitive => self.primitive_output,
        }
    }

    pub fn with_output_mode(mut self, kind: TargetKind, mode: OutputMode) -> Self {
        match kind {
            TargetKind::PortfolioNode => self.aggregate_position_output = mode,
            TargetKind::Position => self.position_output = mode,
            TargetKind::Trade => self.trade_output = mode,
            TargetKind::Security => self.security_output = mode,
            TargetKind::Primitive => self.primitive_output = mode,
        }
        self
    }
}

/// Recalculation periods, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculationWindows {
    pub min_delta_period_ms: Option<u64>,
    pub max_delta_period_ms: Option<u64>,
    pub min_full_period_ms: Option<u64>,
    pub max_full_period_ms: Option<u64>,
}

/// Declarative description of what to compute for a portfolio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    pub portfolio_id: Option<ObjectId>,
    pub market_data_user: String,
    #[serde(default)]
    pub default_currency: Option<String>,
    #[serde(default)]
    pub calculation_windows: CalculationWindows,
    #[serde(default)]
    pub result_model: ResultModelDefinition,
    /// Keyed by configuration name.
    #[serde(default)]
    pub calculation_configurations: BTreeMap<String, CalculationConfiguration>,
}

impl ViewDefinition {
    pub fn new(name: impl Into<String>, market_data_user: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            portfolio_id: None,
            market_data_user: market_data_user.into(),
            default_currency: None,
            calculation_windows: CalculationWindows::default(),
            result_model: ResultModelDefinition::default(),
            calculation_configurations: BTreeMap::new(),
        }
    }

    pub fn with_portfolio(mut self, portfolio_id: ObjectId) -> Self {
        self.portfolio_id = Some(portfolio_id);
        self
    }

    pub fn with_default_currency(mut self, currency: impl Into<String>) -> Self {
        self.default_currency = Some(currency.into());
        self
    }

    pub fn with_calculation_configuration(mut self, config: CalculationConfiguration) -> Self {
        self.calculation_configurations
            .insert(config.name.clone(), config);
        self
    }

    pub fn calculation_configuration(&self, name: &str) -> Option<&CalculationConfiguration> {
        self.calculation_configurations.get(name)
    }

    /// View-level settings that must match for two views to be merged.
    pub fn has_same_settings(&self, other: &Self) -> bool {
        self.portfolio_id == other.portfolio_id
            && self.market_data_user == other.market_data_user
            && self.default_currency == other.default_currency
            && self.calculation_windows == other.calculation_windows
            && self.result_model == other.result_model
    }

    /// Same definition except for its name.
    pub fn same_content(&self, other: &Self) -> bool {
        self.has_same_settings(other)
            && self.calculation_configurations == other.calculation_configurations
    }
}
