//! Interfaces to the external view processor and configuration store.
//!
//! The engine never compiles or executes views itself. It publishes a
//! definition, opens a client on the processor, and consumes the events the
//! client delivers. Callbacks may arrive on any thread.

use crate::sequence::ValuationContext;
use crate::types::{ComputedValue, ValueRequirement, ValueSpecification, ViewDefinition};
use chrono::{DateTime, NaiveDate, Utc};
use riskflow_ids::ViewDefinitionId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Flags controlling how the view process walks its cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionFlags {
    pub wait_for_first_trigger: bool,
    pub run_as_fast_as_possible: bool,
    pub skip_cycle_on_missing_market_data: bool,
}

/// Everything a client needs to attach to a view process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub contexts: Vec<ValuationContext>,
    /// Market data user applied to every cycle unless a context overrides it.
    pub market_data_user: String,
    pub correction: Option<DateTime<Utc>>,
    pub flags: ExecutionFlags,
}

/// Compilation output: for each configuration, which requirements each
/// resolved output satisfies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledViewDefinition {
    pub terminal_outputs: BTreeMap<String, BTreeMap<ValueSpecification, BTreeSet<ValueRequirement>>>,
}

impl CompiledViewDefinition {
    pub fn with_output(
        mut self,
        calc_conf: impl Into<String>,
        specification: ValueSpecification,
        requirement: ValueRequirement,
    ) -> Self {
        self.terminal_outputs
            .entry(calc_conf.into())
            .or_default()
            .entry(specification)
            .or_default()
            .insert(requirement);
        self
    }
}

/// Terminal outputs of one completed cycle, per configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleResult {
    pub valuation_date: NaiveDate,
    pub values: BTreeMap<String, Vec<(ValueSpecification, ComputedValue)>>,
}

impl CycleResult {
    pub fn new(valuation_date: NaiveDate) -> Self {
        Self {
            valuation_date,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(
        mut self,
        calc_conf: impl Into<String>,
        specification: ValueSpecification,
        value: impl Into<ComputedValue>,
    ) -> Self {
        self.values
            .entry(calc_conf.into())
            .or_default()
            .push((specification, value.into()));
        self
    }
}

/// Callbacks delivered by a view client.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    Compiled(CompiledViewDefinition),
    CycleStarted { valuation_date: NaiveDate },
    CycleFragmentCompleted { valuation_date: NaiveDate },
    CycleCompleted(CycleResult),
    CompilationFailed { message: String },
    CycleExecutionFailed {
        valuation_date: Option<NaiveDate>,
        message: String,
    },
    ProcessCompleted,
    ProcessTerminated { execution_interrupted: bool },
    ClientShutdown { message: Option<String> },
}

impl ViewEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Compiled(_) => "compiled",
            Self::CycleStarted { .. } => "cycle_started",
            Self::CycleFragmentCompleted { .. } => "cycle_fragment_completed",
            Self::CycleCompleted(_) => "cycle_completed",
            Self::CompilationFailed { .. } => "compilation_failed",
            Self::CycleExecutionFailed { .. } => "cycle_execution_failed",
            Self::ProcessCompleted => "process_completed",
            Self::ProcessTerminated { .. } => "process_terminated",
            Self::ClientShutdown { .. } => "client_shutdown",
        }
    }
}

pub trait ViewResultListener: Send + Sync {
    fn on_event(&self, event: ViewEvent);
}

/// A handle on the view processor bound to one user.
pub trait ViewClient: Send + Sync {
    /// Attach to a (possibly shared) process for the definition. With
    /// `deferred` set, nothing runs until the first trigger.
    fn attach_to_view_process(
        &self,
        definition_id: &ViewDefinitionId,
        options: ExecutionOptions,
        deferred: bool,
    ) -> anyhow::Result<()>;

    fn set_result_listener(&self, listener: Arc<dyn ViewResultListener>);

    fn trigger_cycle(&self) -> anyhow::Result<()>;

    fn shutdown(&self);
}

pub trait ViewProcessor: Send + Sync {
    fn create_client(&self, user: &str) -> anyhow::Result<Arc<dyn ViewClient>>;
}

/// A stored definition version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredViewDefinition {
    pub id: ViewDefinitionId,
    pub definition: ViewDefinition,
}

pub trait ConfigStore: Send + Sync {
    fn search_by_name(&self, name: &str) -> anyhow::Result<Vec<StoredViewDefinition>>;
    fn add(&self, definition: ViewDefinition) -> anyhow::Result<ViewDefinitionId>;
    fn remove_version(&self, id: &ViewDefinitionId) -> anyhow::Result<()>;
}
