//! Restart-safe execution and persistence of one calculation configuration's
//! dependency graph.
//!
//! On a restarted run the writer prunes nodes whose position-level target
//! already succeeded and whose outputs are still cached. Every executed unit
//! is then committed as one result batch: values for targets where everything
//! succeeded, failure rows (with deduplicated compute-failure reasons) for
//! targets where anything failed, and the matching status entries.

use crate::error::Result;
use crate::metrics::METRICS;
use crate::types::{ComputedValue, OutputMode, ResultModelDefinition, TargetSpecification, ValueSpecification};
use async_trait::async_trait;
use riskflow_db::{
    BatchDb, BatchWriteSummary, ComputeFailureKey, FailureRow, ResultBatch, StartedBatch,
    StatusEntry, TargetStatus, ValueKey, ValueRow,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

// ============================================================================
// Dependency Graph
// ============================================================================

/// One function invocation on one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    pub target: TargetSpecification,
    pub function_id: String,
    pub inputs: BTreeSet<ValueSpecification>,
    pub outputs: BTreeSet<ValueSpecification>,
}

impl DependencyNode {
    pub fn new(target: TargetSpecification, function_id: impl Into<String>) -> Self {
        Self {
            target,
            function_id: function_id.into(),
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
        }
    }

    pub fn with_input(mut self, input: ValueSpecification) -> Self {
        self.inputs.insert(input);
        self
    }

    pub fn with_output(mut self, output: ValueSpecification) -> Self {
        self.outputs.insert(output);
        self
    }
}

/// Nodes of one calculation configuration. Edges are implied by inputs
/// matching other nodes' outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    calc_conf: String,
    nodes: Vec<DependencyNode>,
    terminal_outputs: BTreeSet<ValueSpecification>,
}

impl DependencyGraph {
    pub fn new(calc_conf: impl Into<String>) -> Self {
        Self {
            calc_conf: calc_conf.into(),
            nodes: Vec::new(),
            terminal_outputs: BTreeSet::new(),
        }
    }

    pub fn with_node(mut self, node: DependencyNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Mark an output as requested by the view (as opposed to intermediate).
    pub fn with_terminal_output(mut self, output: ValueSpecification) -> Self {
        self.terminal_outputs.insert(output);
        self
    }

    pub fn calc_conf(&self) -> &str {
        &self.calc_conf
    }

    pub fn nodes(&self) -> &[DependencyNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn targets(&self) -> BTreeSet<TargetSpecification> {
        self.nodes.iter().map(|n| n.target.clone()).collect()
    }

    pub fn is_terminal_output(&self, output: &ValueSpecification) -> bool {
        self.terminal_outputs.contains(output)
    }

    /// Node producing `output`, if it is in this graph.
    pub fn producer_of(&self, output: &ValueSpecification) -> Option<&DependencyNode> {
        self.nodes.iter().find(|n| n.outputs.contains(output))
    }

    /// Keep only nodes accepted by `keep`. Inputs produced by dropped nodes
    /// stay on the kept nodes and are served from the computation cache.
    pub fn sub_graph(&self, mut keep: impl FnMut(usize, &DependencyNode) -> bool) -> Self {
        let nodes: Vec<DependencyNode> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, node)| keep(*i, node))
            .map(|(_, node)| node.clone())
            .collect();
        let terminal_outputs = self
            .terminal_outputs
            .iter()
            .filter(|o| nodes.iter().any(|n| n.outputs.contains(*o)))
            .cloned()
            .collect();
        Self {
            calc_conf: self.calc_conf.clone(),
            nodes,
            terminal_outputs,
        }
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Shared computation cache, read-only here.
pub trait ComputationCache: Send + Sync {
    fn get(&self, output: &ValueSpecification) -> Option<ComputedValue>;
}

/// Executes a (sub-)graph and reports per-invocation outcomes.
#[async_trait]
pub trait GraphExecutor: Send + Sync {
    async fn execute(&self, graph: &DependencyGraph) -> anyhow::Result<CalculationJobResult>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationResult {
    Success,
    FunctionThrewException {
        exception_class: String,
        message: String,
        stack_trace: String,
    },
    MissingInputs {
        missing: Vec<ValueSpecification>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculationJobResultItem {
    pub target: TargetSpecification,
    pub function_id: String,
    pub outputs: Vec<ValueSpecification>,
    pub result: InvocationResult,
}

impl CalculationJobResultItem {
    pub fn for_node(node: &DependencyNode, result: InvocationResult) -> Self {
        Self {
            target: node.target.clone(),
            function_id: node.function_id.clone(),
            outputs: node.outputs.iter().cloned().collect(),
            result,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculationJobResult {
    pub calc_conf: String,
    pub items: Vec<CalculationJobResultItem>,
}

// ============================================================================
// Writer
// ============================================================================

/// Executes graphs for one run and persists what they produced.
pub struct BatchResultWriter {
    db: BatchDb,
    run_id: i64,
    restart: bool,
    cache: Arc<dyn ComputationCache>,
    executor: Arc<dyn GraphExecutor>,
    result_model: ResultModelDefinition,
    write_errors: bool,
    /// Memoised `(calc conf, target) -> status`.
    statuses: Mutex<HashMap<(String, TargetSpecification), TargetStatus>>,
    /// Compute failures behind each failed output, for inheritance by dependents.
    failure_causes: Mutex<HashMap<ValueSpecification, Vec<ComputeFailureKey>>>,
}

impl BatchResultWriter {
    pub fn new(
        db: BatchDb,
        started: &StartedBatch,
        cache: Arc<dyn ComputationCache>,
        executor: Arc<dyn GraphExecutor>,
        result_model: ResultModelDefinition,
    ) -> Self {
        Self {
            db,
            run_id: started.run.id,
            restart: started.is_restart(),
            cache,
            executor,
            result_model,
            write_errors: true,
            statuses: Mutex::new(HashMap::new()),
            failure_causes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_write_errors(mut self, write_errors: bool) -> Self {
        self.write_errors = write_errors;
        self
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn is_restart(&self) -> bool {
        self.restart
    }

    /// Execute the part of `graph` that still needs running, then persist it.
    pub async fn execute(&self, graph: &DependencyGraph) -> Result<BatchWriteSummary> {
        let sub_graph = self.graph_to_execute(graph).await?;
        if sub_graph.is_empty() {
            info!(run_id = self.run_id, calc_conf = %graph.calc_conf(), "Nothing left to execute");
            return Ok(BatchWriteSummary::default());
        }

        self.mark_running(&sub_graph).await?;
        let result = self.executor.execute(&sub_graph).await?;
        self.job_executed(&result, &sub_graph).await
    }

    /// Restart decision for one node.
    pub async fn should_execute(&self, graph: &DependencyGraph, node: &DependencyNode) -> Result<bool> {
        if !self.restart {
            return Ok(true);
        }
        if !node.target.kind.is_position_level() {
            return Ok(true);
        }
        let status = self.status(graph.calc_conf(), &node.target).await?;
        let execute = match status {
            TargetStatus::Success => !self.all_outputs_in_cache(node),
            TargetStatus::Failure | TargetStatus::Running | TargetStatus::NotRunning => true,
        };
        debug!(
            target = %node.target,
            function_id = %node.function_id,
            %status,
            execute,
            "Restart decision"
        );
        Ok(execute)
    }

    /// The sub-graph `execute` would hand to the executor.
    pub async fn graph_to_execute(&self, graph: &DependencyGraph) -> Result<DependencyGraph> {
        let mut keep = Vec::with_capacity(graph.len());
        for node in graph.nodes() {
            keep.push(self.should_execute(graph, node).await?);
        }
        let sub_graph = graph.sub_graph(|i, _| keep.get(i).copied().unwrap_or(true));
        let pruned = (graph.len() - sub_graph.len()) as u64;
        if pruned > 0 {
            METRICS.add_nodes_pruned(pruned);
            info!(
                run_id = self.run_id,
                calc_conf = %graph.calc_conf(),
                pruned,
                remaining = sub_graph.len(),
                "Pruned completed nodes from restarted graph"
            );
        }
        Ok(sub_graph)
    }

    /// Persist the outcome of an executed graph as one transaction.
    pub async fn job_executed(
        &self,
        result: &CalculationJobResult,
        graph: &DependencyGraph,
    ) -> Result<BatchWriteSummary> {
        if result.items.is_empty() {
            info!(run_id = self.run_id, calc_conf = %result.calc_conf, "Nothing to write");
            return Ok(BatchWriteSummary::default());
        }
        let calc_conf = result.calc_conf.as_str();

        for item in &result.items {
            self.record_failure_causes(item);
        }

        // A target succeeds only if every item on it succeeded with cached output.
        let mut succeeded = BTreeSet::new();
        let mut failed = BTreeSet::new();
        for item in &result.items {
            if self.result_model.output_mode(item.target.kind) == OutputMode::None {
                continue;
            }
            let ok = item.result == InvocationResult::Success
                && !failed.contains(&item.target)
                && self.outputs_writable(item);
            if ok {
                succeeded.insert(item.target.clone());
            } else {
                succeeded.remove(&item.target);
                failed.insert(item.target.clone());
            }
        }

        let mut batch = ResultBatch::new(self.run_id);
        for item in &result.items {
            let mode = self.result_model.output_mode(item.target.kind);
            if succeeded.contains(&item.target) {
                if self.status(calc_conf, &item.target).await? == TargetStatus::Success {
                    continue;
                }
                for output in &item.outputs {
                    if mode == OutputMode::TerminalOutputs && !graph.is_terminal_output(output) {
                        continue;
                    }
                    if let Some(value) = self.cache.get(output).and_then(|v| v.as_f64()) {
                        batch.values.push(ValueRow {
                            key: value_key(calc_conf, output),
                            value,
                        });
                    }
                }
            } else if failed.contains(&item.target) {
                if !self.write_errors {
                    continue;
                }
                for output in &item.outputs {
                    let causes = match item.result {
                        // Partial failure: this output is fine, a sibling failed.
                        InvocationResult::Success => Vec::new(),
                        _ => self.failure_causes_of(output),
                    };
                    batch.failures.push(FailureRow {
                        key: value_key(calc_conf, output),
                        reasons: causes.iter().map(ComputeFailureKey::content_hash).collect(),
                    });
                    batch.compute_failures.extend(causes);
                }
            } else {
                debug!(target = %item.target, "Output disabled for target kind; not writing");
            }
        }

        batch.statuses = succeeded
            .iter()
            .map(|t| StatusEntry::new(calc_conf, t.to_string(), TargetStatus::Success))
            .chain(
                failed
                    .iter()
                    .map(|t| StatusEntry::new(calc_conf, t.to_string(), TargetStatus::Failure)),
            )
            .collect();

        let summary = self.db.write_result_batch(&batch).await?;
        METRICS.add_rows_written(summary.values, summary.failures);

        let mut statuses = self.lock_statuses();
        for target in succeeded {
            statuses.insert((calc_conf.to_string(), target), TargetStatus::Success);
        }
        for target in failed {
            statuses.insert((calc_conf.to_string(), target), TargetStatus::Failure);
        }
        Ok(summary)
    }

    async fn mark_running(&self, graph: &DependencyGraph) -> Result<()> {
        let targets: Vec<TargetSpecification> = graph
            .targets()
            .into_iter()
            .filter(|t| self.result_model.output_mode(t.kind) != OutputMode::None)
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        let entries: Vec<StatusEntry> = targets
            .iter()
            .map(|t| StatusEntry::new(graph.calc_conf(), t.to_string(), TargetStatus::Running))
            .collect();
        self.db.upsert_status_entries(self.run_id, &entries).await?;

        let mut statuses = self.lock_statuses();
        for target in targets {
            statuses.insert((graph.calc_conf().to_string(), target), TargetStatus::Running);
        }
        Ok(())
    }

    /// Latest status, memoised; a missing entry reads as NOT_RUNNING.
    async fn status(&self, calc_conf: &str, target: &TargetSpecification) -> Result<TargetStatus> {
        let key = (calc_conf.to_string(), target.clone());
        let cached = self.lock_statuses().get(&key).copied();
        if let Some(status) = cached {
            return Ok(status);
        }
        let status = self
            .db
            .get_status(self.run_id, calc_conf, &target.to_string())
            .await?
            .unwrap_or(TargetStatus::NotRunning);
        self.lock_statuses().insert(key, status);
        Ok(status)
    }

    fn all_outputs_in_cache(&self, node: &DependencyNode) -> bool {
        node.outputs.iter().all(|o| self.cache.get(o).is_some())
    }

    fn outputs_writable(&self, item: &CalculationJobResultItem) -> bool {
        for output in &item.outputs {
            match self.cache.get(output) {
                None => {
                    error!(target = %item.target, output = %output, "Cache not populated for successful output");
                    return false;
                }
                Some(value) if value.as_f64().is_none() => {
                    error!(target = %item.target, output = %output, "Output is not numeric; cannot store it");
                    return false;
                }
                Some(_) => {}
            }
        }
        true
    }

    fn record_failure_causes(&self, item: &CalculationJobResultItem) {
        let mut known = self.failure_causes.lock().unwrap_or_else(|e| e.into_inner());
        let causes = match &item.result {
            InvocationResult::Success => return,
            InvocationResult::FunctionThrewException {
                exception_class,
                message,
                stack_trace,
            } => vec![ComputeFailureKey::new(
                item.function_id.as_str(),
                exception_class.as_str(),
                message.as_str(),
                stack_trace.as_str(),
            )],
            InvocationResult::MissingInputs { missing } => {
                let mut causes: Vec<ComputeFailureKey> = Vec::new();
                for input in missing {
                    match known.get(input) {
                        Some(inherited) => causes.extend(inherited.iter().cloned()),
                        None => causes.push(ComputeFailureKey::new(
                            input.function_id.as_str(),
                            "N/A",
                            format!("Missing input {}", input),
                            "N/A",
                        )),
                    }
                }
                causes.sort_by_key(ComputeFailureKey::content_hash);
                causes.dedup();
                causes
            }
        };
        for output in &item.outputs {
            known.insert(output.clone(), causes.clone());
        }
    }

    fn failure_causes_of(&self, output: &ValueSpecification) -> Vec<ComputeFailureKey> {
        let known = self.failure_causes.lock().unwrap_or_else(|e| e.into_inner());
        known.get(output).cloned().unwrap_or_default()
    }

    fn lock_statuses(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(String, TargetSpecification), TargetStatus>> {
        self.statuses.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn value_key(calc_conf: &str, output: &ValueSpecification) -> ValueKey {
    ValueKey {
        calc_conf: calc_conf.to_string(),
        value_name: output.value_name.clone(),
        properties: output.properties.canonical(),
        target: output.target.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(name: &str, target: &TargetSpecification) -> ValueSpecification {
        ValueSpecification::new(name, target.clone(), format!("{}-fn", name))
    }

    #[test]
    fn test_sub_graph_keeps_terminal_outputs_of_kept_nodes() {
        let t1 = TargetSpecification::position("Pos", "1");
        let t2 = TargetSpecification::position("Pos", "2");
        let pv1 = output("PV", &t1);
        let pv2 = output("PV", &t2);
        let graph = DependencyGraph::new("Default")
            .with_node(DependencyNode::new(t1.clone(), "PV-fn").with_output(pv1.clone()))
            .with_node(
                DependencyNode::new(t2.clone(), "PV-fn")
                    .with_input(pv1.clone())
                    .with_output(pv2.clone()),
            )
            .with_terminal_output(pv1.clone())
            .with_terminal_output(pv2.clone());

        let sub = graph.sub_graph(|_, node| node.target == t2);
        assert_eq!(sub.len(), 1);
        assert!(sub.is_terminal_output(&pv2));
        assert!(!sub.is_terminal_output(&pv1));
        assert!(sub.producer_of(&pv1).is_none());
        assert!(sub.nodes()[0].inputs.contains(&pv1));
        assert_eq!(graph.producer_of(&pv1).map(|n| &n.target), Some(&t1));
    }

    #[test]
    fn test_value_key_uses_canonical_properties() {
        let target = TargetSpecification::position("Pos", "1");
        let spec = ValueSpecification::new("PV", target, "pv")
            .with_properties(crate::types::ValueProperties::new().with("Currency", "USD"));
        let key = value_key("Default", &spec);
        assert_eq!(key.properties, "{Currency=[USD]}");
        assert_eq!(key.target, "POSITION:Pos~1");
    }
}
