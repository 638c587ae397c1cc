//! Drives one evaluation target to completion on the external view processor.
//!
//! The job publishes its view definition, opens a client, and then reacts to
//! client callbacks. Callbacks may be concurrent; every one goes through
//! [`JobListener::transition`], and exactly one outcome is ever reported.

use crate::config::EvaluationConfig;
use crate::error::{EngineError, Result};
use crate::metrics::METRICS;
use crate::process::{
    ConfigStore, ExecutionFlags, ExecutionOptions, ViewClient, ViewEvent, ViewProcessor,
    ViewResultListener,
};
use crate::result_builder::{ViewEvaluationResult, ViewEvaluationResultBuilder};
use crate::target::EvaluationTarget;
use riskflow_ids::{JobId, ViewDefinitionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

type JobOutcome = std::result::Result<Arc<ViewEvaluationResult>, EngineError>;

/// Where a job is in its callback sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Initiated,
    Compiled,
    CycleStarted,
    CycleCompleted,
    Completed,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Runs evaluation targets against a view processor.
pub struct ViewEvaluationFunction {
    processor: Arc<dyn ViewProcessor>,
    config_store: Arc<dyn ConfigStore>,
    config: EvaluationConfig,
}

impl ViewEvaluationFunction {
    pub fn new(
        processor: Arc<dyn ViewProcessor>,
        config_store: Arc<dyn ConfigStore>,
        config: EvaluationConfig,
    ) -> Self {
        Self {
            processor,
            config_store,
            config,
        }
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Name a target's definition is stored under.
    pub fn definition_name(&self, target: &EvaluationTarget) -> String {
        format!("{} {}", self.config.definition_name_prefix, target.key())
    }

    /// Store the target's view definition under its content-addressed name.
    ///
    /// An identical stored version is reused; stale versions under the same
    /// name are removed before the new one is added.
    pub fn publish_view_definition(&self, target: &EvaluationTarget) -> Result<ViewDefinitionId> {
        let name = self.definition_name(target);
        let mut definition = target.view_definition.clone();
        definition.name = name.clone();

        let existing = self
            .config_store
            .search_by_name(&name)
            .map_err(EngineError::config_store)?;

        if let Some(stored) = existing.iter().find(|s| s.definition == definition) {
            debug!(name = %name, id = %stored.id, "Reusing stored view definition");
            return Ok(stored.id.clone());
        }
        for stale in &existing {
            info!(name = %name, id = %stale.id, "Removing stale view definition");
            self.config_store
                .remove_version(&stale.id)
                .map_err(EngineError::config_store)?;
        }
        let id = self
            .config_store
            .add(definition)
            .map_err(EngineError::config_store)?;
        debug!(name = %name, id = %id, "Published view definition");
        Ok(id)
    }

    fn execution_options(&self, target: &EvaluationTarget) -> ExecutionOptions {
        ExecutionOptions {
            contexts: target.contexts(),
            market_data_user: target.view_definition.market_data_user.clone(),
            correction: target.correction,
            flags: ExecutionFlags {
                wait_for_first_trigger: self.config.wait_for_first_trigger,
                run_as_fast_as_possible: self.config.run_as_fast_as_possible,
                skip_cycle_on_missing_market_data: self.config.skip_cycle_on_missing_market_data,
            },
        }
    }

    /// Start a job. The returned handle resolves once the job reaches a
    /// terminal state; errors here mean the job never started.
    pub fn execute(&self, target: Arc<EvaluationTarget>) -> Result<EvaluationJob> {
        let job_id = JobId::new();
        let definition_id = self.publish_view_definition(&target)?;
        let client = self.processor.create_client(&self.config.client_user)?;

        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(JobListener::new(
            job_id.clone(),
            &target,
            Arc::clone(&client),
            tx,
        ));

        let options = self.execution_options(&target);
        let cycles = options.contexts.len();
        if let Err(e) = client.attach_to_view_process(&definition_id, options, true) {
            client.shutdown();
            return Err(e.into());
        }
        client.set_result_listener(listener.clone());
        // Counted before triggering so a failed first trigger still balances.
        METRICS.inc_jobs_started();
        if let Err(e) = client.trigger_cycle() {
            // Claims the report slot so late callbacks are ignored.
            listener.fail(EngineError::Collaborator(e));
            return Err(EngineError::invalid_state(format!(
                "Job {} could not trigger its first cycle",
                job_id
            )));
        }

        info!(
            job_id = %job_id,
            target_key = %target.key().short(),
            definition_id = %definition_id,
            cycles,
            "Evaluation job started"
        );
        Ok(EvaluationJob {
            id: job_id,
            target,
            listener,
            outcome: rx,
        })
    }
}

/// Handle on a running job.
pub struct EvaluationJob {
    id: JobId,
    target: Arc<EvaluationTarget>,
    listener: Arc<JobListener>,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl std::fmt::Debug for EvaluationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationJob")
            .field("id", &self.id)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl EvaluationJob {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn target(&self) -> &Arc<EvaluationTarget> {
        &self.target
    }

    pub fn phase(&self) -> JobPhase {
        self.listener.phase()
    }

    /// Wait for the job's single outcome.
    pub async fn result(self) -> JobOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::ResultChannelClosed),
        }
    }
}

struct JobState {
    phase: JobPhase,
    builder: ViewEvaluationResultBuilder,
}

/// Receives client callbacks for one job.
struct JobListener {
    job_id: JobId,
    state: Mutex<JobState>,
    reported: AtomicBool,
    reply: Mutex<Option<oneshot::Sender<JobOutcome>>>,
    client: Mutex<Option<Arc<dyn ViewClient>>>,
}

impl JobListener {
    fn new(
        job_id: JobId,
        target: &EvaluationTarget,
        client: Arc<dyn ViewClient>,
        reply: oneshot::Sender<JobOutcome>,
    ) -> Self {
        Self {
            job_id,
            state: Mutex::new(JobState {
                phase: JobPhase::Initiated,
                builder: ViewEvaluationResultBuilder::new(&target.view_definition),
            }),
            reported: AtomicBool::new(false),
            reply: Mutex::new(Some(reply)),
            client: Mutex::new(Some(client)),
        }
    }

    fn phase(&self) -> JobPhase {
        self.lock_state().phase
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply one event; `Some` means the job reached an outcome.
    fn transition(&self, event: ViewEvent) -> Option<JobOutcome> {
        let mut state = self.lock_state();
        if state.phase.is_terminal() {
            debug!(job_id = %self.job_id, event = event.name(), "Ignoring event after completion");
            return None;
        }

        match event {
            ViewEvent::Compiled(compiled) => {
                state.builder.add_compiled(&compiled);
                state.phase = JobPhase::Compiled;
                debug!(job_id = %self.job_id, "View compiled");
                None
            }
            ViewEvent::CycleStarted { valuation_date } => {
                if state.phase == JobPhase::Initiated {
                    return Some(Err(out_of_order("cycle started", &self.job_id)));
                }
                state.phase = JobPhase::CycleStarted;
                debug!(job_id = %self.job_id, %valuation_date, "Cycle started");
                None
            }
            ViewEvent::CycleFragmentCompleted { valuation_date } => {
                debug!(job_id = %self.job_id, %valuation_date, "Cycle fragment completed");
                None
            }
            ViewEvent::CycleCompleted(cycle) => {
                if state.phase == JobPhase::Initiated {
                    return Some(Err(out_of_order("cycle completed", &self.job_id)));
                }
                state.phase = JobPhase::CycleCompleted;
                debug!(job_id = %self.job_id, valuation_date = %cycle.valuation_date, "Cycle completed");
                state.builder.add_cycle_results(&cycle).err().map(Err)
            }
            ViewEvent::CompilationFailed { message } => {
                Some(Err(EngineError::CompilationFailure { message }))
            }
            ViewEvent::CycleExecutionFailed {
                valuation_date,
                message,
            } => Some(Err(EngineError::CycleExecutionFailure {
                valuation_date,
                message,
            })),
            ViewEvent::ProcessCompleted => Some(Ok(state.builder.make_result())),
            ViewEvent::ProcessTerminated {
                execution_interrupted,
            } => Some(Err(EngineError::ProcessTerminated {
                interrupted: execution_interrupted,
            })),
            ViewEvent::ClientShutdown { message } => Some(Err(EngineError::ClientShutdown {
                message: message.unwrap_or_else(|| "no reason given".to_string()),
            })),
        }
    }

    fn fail(&self, error: EngineError) {
        self.report(Err(error));
    }

    /// Deliver the outcome once, then release the client.
    fn report(&self, outcome: JobOutcome) {
        if self
            .reported
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(job_id = %self.job_id, "Job outcome already reported; ignoring");
            METRICS.inc_duplicate_reports();
            return;
        }

        self.lock_state().phase = match outcome {
            Ok(_) => JobPhase::Completed,
            Err(_) => JobPhase::Failed,
        };
        match &outcome {
            Ok(result) => {
                METRICS.inc_jobs_succeeded();
                info!(job_id = %self.job_id, configs = result.series.len(), "Evaluation job completed");
            }
            Err(e) => {
                METRICS.inc_jobs_failed();
                error!(job_id = %self.job_id, kind = e.kind(), error = %e, "Evaluation job failed");
            }
        }

        let reply = self.reply.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reply) = reply {
            if reply.send(outcome).is_err() {
                debug!(job_id = %self.job_id, "Job handle dropped before outcome");
            }
        }

        self.release_client();
    }

    fn release_client(&self) {
        let client = self.client.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(client) = client {
            client.shutdown();
        }
    }
}

impl ViewResultListener for JobListener {
    fn on_event(&self, event: ViewEvent) {
        if let Some(outcome) = self.transition(event) {
            self.report(outcome);
        }
    }
}

fn out_of_order(what: &str, job_id: &JobId) -> EngineError {
    EngineError::invalid_state(format!("Job {}: {} before compilation", job_id, what))
}
