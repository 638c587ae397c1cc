//! Riskflow evaluation engine
//!
//! Runs view definitions over sequences of valuation dates, folds the
//! per-cycle results into date series, merges equivalent evaluation jobs,
//! keeps a fleet of view processes consistent with a changing function
//! universe, and persists batch results so a restarted run only redoes
//! unfinished work.
//!
//! ```text
//! EvaluationTarget ──► ViewEvaluationFunction ──► ViewEvaluationResultBuilder ──► ViewEvaluationResult
//!        ▲                      │ (view client callbacks)
//!  TargetCollapser              ▼
//!                         ViewProcessor (external)
//!
//! ViewProcessorManager: suspend fleet ─► reinitialize repositories ─► rebuild watch set ─► resume
//! BatchResultWriter:    prune graph on restart ─► execute ─► commit results transactionally
//! ```

pub mod collapser;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod manager;
pub mod metrics;
pub mod process;
pub mod restart;
pub mod result_builder;
pub mod sequence;
pub mod target;
pub mod types;
pub mod watch;

pub use collapser::TargetCollapser;
pub use config::{EvaluationConfig, ManagerConfig};
pub use error::{EngineError, Result};
pub use evaluation::{EvaluationJob, JobPhase, ViewEvaluationFunction};
pub use manager::{
    ChangeListener, ChangeSource, FunctionRepository, ManagedViewProcess, ManagerState,
    ResumeCallback, SubscriptionId, SuspendFuture, ViewProcessorManager,
    ViewProcessorManagerBuilder,
};
pub use metrics::METRICS;
pub use process::{
    CompiledViewDefinition, ConfigStore, CycleResult, ExecutionFlags, ExecutionOptions,
    StoredViewDefinition, ViewClient, ViewEvent, ViewProcessor, ViewResultListener,
};
pub use restart::{
    BatchResultWriter, CalculationJobResult, CalculationJobResultItem, ComputationCache,
    DependencyGraph, DependencyNode, GraphExecutor, InvocationResult,
};
pub use result_builder::{DateSeries, SeriesBuilder, ViewEvaluationResult, ViewEvaluationResultBuilder};
pub use sequence::{ExecutionSequence, ValuationContext};
pub use target::{EvaluationTarget, TargetStore};
pub use types::*;
pub use watch::{CompositeWatchSetProvider, SchemeWatchSetProvider, WatchSetProvider};
