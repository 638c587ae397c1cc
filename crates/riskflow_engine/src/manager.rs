//! Fleet supervisor keeping view processes consistent with a changing
//! function universe.
//!
//! Lifecycle: `start()` subscribes to change sources, initializes every
//! repository, builds the watch set and starts every process; `stop()` undoes
//! that in reverse. While running, a change to a watched identifier schedules
//! a single reinitialization: suspend all processes, reinitialize all
//! repositories, rebuild the watch set, resume. The whole sequence holds the
//! lifecycle lock, so no process resumes against a half-updated repository set.

use crate::config::ManagerConfig;
use crate::error::{EngineError, Result};
use crate::metrics::METRICS;
use crate::watch::WatchSetProvider;
use riskflow_ids::ObjectId;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Resumes a suspended process.
pub type ResumeCallback = Box<dyn FnOnce() + Send>;

/// Pending suspension of one process.
pub type SuspendFuture = Pin<Box<dyn Future<Output = anyhow::Result<ResumeCallback>> + Send>>;

pub type SubscriptionId = u64;

/// Source of the identifiers a view process depends on.
pub trait FunctionRepository: Send + Sync {
    fn name(&self) -> String;
    fn initialize(&self) -> anyhow::Result<HashSet<ObjectId>>;
    fn reinitialize(&self) -> anyhow::Result<HashSet<ObjectId>>;
}

/// A long-lived view process under management.
pub trait ManagedViewProcess: Send + Sync {
    fn name(&self) -> String;
    fn start(&self) -> anyhow::Result<()>;
    fn stop(&self) -> anyhow::Result<()>;
    /// Request suspension without blocking; the future resolves once the
    /// process is paused between cycles.
    fn suspend(&self) -> SuspendFuture;
}

pub trait ChangeListener: Send + Sync {
    fn object_changed(&self, id: &ObjectId);
}

pub trait ChangeSource: Send + Sync {
    fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> SubscriptionId;
    fn unsubscribe(&self, subscription: SubscriptionId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Stopped,
    Running,
}

struct Lifecycle {
    state: ManagerState,
    subscriptions: Vec<(usize, SubscriptionId)>,
}

#[derive(Default)]
struct PendingChanges {
    ids: HashSet<ObjectId>,
    scheduled: bool,
}

struct ManagerInner {
    config: ManagerConfig,
    repositories: Vec<Arc<dyn FunctionRepository>>,
    processes: Vec<Arc<dyn ManagedViewProcess>>,
    change_sources: Vec<Arc<dyn ChangeSource>>,
    watch_set_provider: Option<Arc<dyn WatchSetProvider>>,
    runtime: Handle,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    watch_set: RwLock<Arc<HashSet<ObjectId>>>,
    pending: Mutex<PendingChanges>,
    reinitializations: AtomicU64,
}

pub struct ViewProcessorManagerBuilder {
    config: ManagerConfig,
    repositories: Vec<Arc<dyn FunctionRepository>>,
    processes: Vec<Arc<dyn ManagedViewProcess>>,
    change_sources: Vec<Arc<dyn ChangeSource>>,
    watch_set_provider: Option<Arc<dyn WatchSetProvider>>,
}

impl ViewProcessorManagerBuilder {
    pub fn with_repository(mut self, repository: Arc<dyn FunctionRepository>) -> Self {
        self.repositories.push(repository);
        self
    }

    pub fn with_process(mut self, process: Arc<dyn ManagedViewProcess>) -> Self {
        self.processes.push(process);
        self
    }

    pub fn with_change_source(mut self, source: Arc<dyn ChangeSource>) -> Self {
        self.change_sources.push(source);
        self
    }

    pub fn with_watch_set_provider(mut self, provider: Arc<dyn WatchSetProvider>) -> Self {
        self.watch_set_provider = Some(provider);
        self
    }

    /// Reinitialization tasks are spawned on `runtime`.
    pub fn build(self, runtime: Handle) -> ViewProcessorManager {
        ViewProcessorManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                repositories: self.repositories,
                processes: self.processes,
                change_sources: self.change_sources,
                watch_set_provider: self.watch_set_provider,
                runtime,
                lifecycle: tokio::sync::Mutex::new(Lifecycle {
                    state: ManagerState::Stopped,
                    subscriptions: Vec::new(),
                }),
                watch_set: RwLock::new(Arc::new(HashSet::new())),
                pending: Mutex::new(PendingChanges::default()),
                reinitializations: AtomicU64::new(0),
            }),
        }
    }
}

#[derive(Clone)]
pub struct ViewProcessorManager {
    inner: Arc<ManagerInner>,
}

impl ViewProcessorManager {
    pub fn builder(config: ManagerConfig) -> ViewProcessorManagerBuilder {
        ViewProcessorManagerBuilder {
            config,
            repositories: Vec::new(),
            processes: Vec::new(),
            change_sources: Vec::new(),
            watch_set_provider: None,
        }
    }

    pub async fn state(&self) -> ManagerState {
        self.inner.lifecycle.lock().await.state
    }

    /// Copy of the current watch set.
    pub fn watch_set(&self) -> Arc<HashSet<ObjectId>> {
        self.inner.watch_set_snapshot()
    }

    /// Completed reinitializations since construction.
    pub fn reinitialization_count(&self) -> u64 {
        self.inner.reinitializations.load(Ordering::Acquire)
    }

    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.state == ManagerState::Running {
            return Err(EngineError::invalid_state("Manager already running"));
        }

        let listener: Arc<dyn ChangeListener> = Arc::new(ManagerListener {
            inner: Arc::downgrade(&self.inner),
        });
        lifecycle.subscriptions = self
            .inner
            .change_sources
            .iter()
            .enumerate()
            .map(|(i, source)| (i, source.subscribe(Arc::clone(&listener))))
            .collect();

        let mut ids = HashSet::new();
        for repository in &self.inner.repositories {
            match repository.initialize() {
                Ok(found) => ids.extend(found),
                Err(e) => {
                    METRICS.inc_repository_failures();
                    error!(repository = %repository.name(), error = %e, "Function repository failed to initialize");
                }
            }
        }
        self.inner.install_watch_set(ids);

        for process in &self.inner.processes {
            if let Err(e) = process.start() {
                error!(process = %process.name(), error = %e, "View process failed to start");
            }
        }

        lifecycle.state = ManagerState::Running;
        info!(
            repositories = self.inner.repositories.len(),
            processes = self.inner.processes.len(),
            watched = self.inner.watch_set_snapshot().len(),
            "View processor manager started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.state == ManagerState::Stopped {
            return Ok(());
        }

        for process in self.inner.processes.iter().rev() {
            if let Err(e) = process.stop() {
                error!(process = %process.name(), error = %e, "View process failed to stop");
            }
        }
        self.inner.replace_watch_set(HashSet::new());
        for (i, subscription) in lifecycle.subscriptions.drain(..).rev() {
            if let Some(source) = self.inner.change_sources.get(i) {
                source.unsubscribe(subscription);
            }
        }
        {
            let mut pending = self.inner.lock_pending();
            pending.ids.clear();
        }

        lifecycle.state = ManagerState::Stopped;
        info!("View processor manager stopped");
        Ok(())
    }

    /// Feed a change notification directly (what subscribed sources call).
    pub fn notify_changed(&self, id: &ObjectId) {
        self.inner.on_object_changed(id);
    }
}

struct ManagerListener {
    inner: Weak<ManagerInner>,
}

impl ChangeListener for ManagerListener {
    fn object_changed(&self, id: &ObjectId) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_object_changed(id);
        }
    }
}

impl ManagerInner {
    fn watch_set_snapshot(&self) -> Arc<HashSet<ObjectId>> {
        let guard = self.watch_set.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingChanges> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Watch set = repository ids, provider contributions, sentinels.
    fn install_watch_set(&self, repository_ids: HashSet<ObjectId>) {
        let mut watch = repository_ids;
        if let Some(provider) = &self.watch_set_provider {
            let extra = provider.additional_watch_set(&watch);
            watch.extend(extra);
        }
        watch.extend(self.config.sentinel_ids.iter().cloned());
        self.replace_watch_set(watch);
    }

    fn replace_watch_set(&self, watch: HashSet<ObjectId>) {
        let mut guard = self.watch_set.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(watch);
    }

    fn on_object_changed(self: &Arc<Self>, id: &ObjectId) {
        if !self.watch_set_snapshot().contains(id) {
            METRICS.inc_notifications_ignored();
            debug!(object_id = %id, "Ignoring change to unwatched object");
            return;
        }

        let schedule = {
            let mut pending = self.lock_pending();
            pending.ids.insert(id.clone());
            !std::mem::replace(&mut pending.scheduled, true)
        };
        METRICS.inc_notifications_accepted();
        if schedule {
            info!(object_id = %id, "Watched object changed; scheduling reinitialization");
            let inner = Arc::clone(self);
            self.runtime.spawn(async move {
                inner.reinitialize().await;
            });
        } else {
            debug!(object_id = %id, "Reinitialization already scheduled");
        }
    }

    async fn reinitialize(self: Arc<Self>) {
        let lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != ManagerState::Running {
            let mut pending = self.lock_pending();
            pending.ids.clear();
            pending.scheduled = false;
            debug!("Manager stopped before reinitialization ran");
            return;
        }

        let resumes = match self.suspend_all().await {
            Some(resumes) => resumes,
            None => {
                self.lock_pending().scheduled = false;
                METRICS.inc_reinitializations_abandoned();
                return;
            }
        };

        let changes = {
            let mut pending = self.lock_pending();
            pending.scheduled = false;
            std::mem::take(&mut pending.ids)
        };
        info!(changes = changes.len(), "Reinitializing function repositories");

        let mut ids = HashSet::new();
        for repository in &self.repositories {
            match repository.reinitialize() {
                Ok(found) => ids.extend(found),
                Err(e) => {
                    METRICS.inc_repository_failures();
                    let err = EngineError::Reinitialization {
                        repository: repository.name(),
                        message: e.to_string(),
                    };
                    error!(error = %err, "Repository contributes nothing to the watch set this cycle");
                }
            }
        }
        self.install_watch_set(ids);

        for resume in resumes {
            resume();
        }
        self.reinitializations.fetch_add(1, Ordering::AcqRel);
        METRICS.inc_reinitializations();
        info!(
            watched = self.watch_set_snapshot().len(),
            "Reinitialization complete; processes resumed"
        );
        drop(lifecycle);
    }

    /// Suspend every process. `None` means the round budget ran out; anything
    /// already suspended has been resumed again.
    async fn suspend_all(&self) -> Option<Vec<ResumeCallback>> {
        let mut outstanding: Vec<(String, SuspendFuture)> = self
            .processes
            .iter()
            .map(|p| (p.name(), p.suspend()))
            .collect();
        let mut resumes: Vec<ResumeCallback> = Vec::with_capacity(outstanding.len());
        let mut round: u32 = 0;

        while !outstanding.is_empty() {
            if let Some(max) = self.config.max_suspend_rounds {
                if round >= max {
                    warn!(
                        rounds = round,
                        unsuspended = outstanding.len(),
                        "Suspend budget exhausted; abandoning reinitialization"
                    );
                    for resume in resumes {
                        resume();
                    }
                    return None;
                }
            }
            round += 1;

            let mut still_running = Vec::new();
            for (name, mut suspension) in outstanding {
                match tokio::time::timeout(self.config.suspend_timeout, &mut suspension).await {
                    Ok(Ok(resume)) => resumes.push(resume),
                    Ok(Err(e)) => {
                        error!(process = %name, error = %e, "View process failed to suspend; continuing without it");
                    }
                    Err(_) => {
                        debug!(process = %name, round, "Process not yet suspended; retrying");
                        still_running.push((name, suspension));
                    }
                }
            }
            outstanding = still_running;
        }
        Some(resumes)
    }
}
