//! The per-agent execution engine.
//!
//! Composes the accountant, dependency engine, predictor, and the shared
//! device manager. State lives behind one `parking_lot::Mutex`; two condvars
//! wake dispatchers and terminal-state waiters. Dispatchers are dedicated OS
//! threads, each owning a single-threaded tokio runtime that drives the
//! (async) worker callback, so callbacks never execute under the state lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::core::accountant::ResourceAccountant;
use crate::core::deps::{DependencyEngine, RegisterOutcome, Resolution};
use crate::core::error::{FailureReason, SchedulerError};
use crate::core::predictor::LoadPredictor;
use crate::core::queue::{ReadyEntry, ReadyQueue};
use crate::core::task::{
    DependencyPattern, Priority, ResourceKind, ResourceRequirement, Task, TaskDependency, TaskId,
    TaskState,
};
use crate::core::worker::{AgentWorker, CancelToken, TaskContext};
use crate::device::driver::InMemoryDriver;
use crate::device::manager::DeviceManager;
use crate::metrics::{percentile, AgentMetrics, MetricsSink};
use crate::util::clock::now_ms;

/// Cap on retained latency samples and recent errors.
const STAT_CAP: usize = 4096;
const ERROR_CAP: usize = 64;

/// Completion notification registered at submit; invoked with the terminal
/// task record, outside every lock.
pub type CompletionCallback = Box<dyn FnOnce(&Task) + Send + 'static>;

/// One task submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    /// Human-readable description; also keys completion-time analytics.
    pub description: String,
    /// Opaque payload handed to the worker.
    pub payload: Vec<u8>,
    /// Explicit dependencies. Leave empty to let a registered pattern apply.
    pub dependencies: Vec<TaskDependency>,
    /// Priority; the configuration default applies when omitted.
    pub priority: Option<Priority>,
    /// Resource requirements; the configured baseline applies when omitted.
    pub requirements: Option<Vec<ResourceRequirement>>,
    /// Free-form metadata copied onto the task record.
    pub metadata: HashMap<String, String>,
}

impl SubmitRequest {
    /// Request with the given description and defaults elsewhere.
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Attach explicit dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<TaskDependency>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Override the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Override the resource requirements.
    #[must_use]
    pub fn with_requirements(mut self, requirements: Vec<ResourceRequirement>) -> Self {
        self.requirements = Some(requirements);
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    failed: u64,
    cancelled: u64,
    retries: u64,
    timeouts: u64,
    cycle_breaks: u64,
    errors_by_reason: HashMap<String, u64>,
}

struct State {
    tasks: HashMap<TaskId, Task>,
    ready: ReadyQueue,
    running: HashSet<TaskId>,
    /// Tasks in `Queued`, `WaitingOnDeps`, or `Ready`: the depth the
    /// `max_queue` ceiling applies to.
    pending: usize,
    cancel_tokens: HashMap<TaskId, CancelToken>,
    timed_out: HashSet<TaskId>,
    callbacks: HashMap<TaskId, CompletionCallback>,
    accountant: ResourceAccountant,
    deps: DependencyEngine,
    predictor: LoadPredictor,
    patterns: Vec<DependencyPattern>,
    bottlenecked: Vec<ResourceKind>,
    counters: Counters,
    processing_ms: VecDeque<f64>,
    wait_ms: VecDeque<f64>,
    recent_errors: VecDeque<String>,
    load_factor: f64,
}

impl State {
    fn push_recent_error(&mut self, message: String) {
        if self.recent_errors.len() >= ERROR_CAP {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(message);
    }
}

fn push_stat(series: &mut VecDeque<f64>, value: f64) {
    if series.len() >= STAT_CAP {
        series.pop_front();
    }
    series.push_back(value);
}

struct Inner {
    agent_id: Uuid,
    config: AgentConfig,
    worker: Arc<dyn AgentWorker>,
    devices: Arc<DeviceManager>,
    state: Mutex<State>,
    queue_cv: Condvar,
    done_cv: Condvar,
    shutdown: AtomicBool,
    started_at: Instant,
}

struct DispatchJob {
    id: TaskId,
    payload: Vec<u8>,
    token: CancelToken,
    gpu_bytes: u64,
}

type FiredCallbacks = Vec<(Task, CompletionCallback)>;

impl Inner {
    /// Pop the next dispatchable task, re-verifying admission. Refused tasks
    /// stay out of the heap until a rebalance tick revives them.
    fn next_job(&self, state: &mut State) -> Option<DispatchJob> {
        while let Some(entry) = state.ready.pop() {
            let Some(task) = state.tasks.get(&entry.id) else {
                continue;
            };
            if task.state != TaskState::Ready || task.blocked {
                continue;
            }
            if !state.accountant.admit(&task.requirements) {
                debug!(task = %entry.id, "admission drifted since submit, parking task");
                if let Some(task) = state.tasks.get_mut(&entry.id) {
                    task.blocked = true;
                }
                continue;
            }

            let now = Instant::now();
            let token = CancelToken::new();
            let (payload, requirements, wait_secs) = {
                let Some(task) = state.tasks.get_mut(&entry.id) else {
                    continue;
                };
                task.state = TaskState::Running;
                task.started_at = Some(now);
                (
                    task.payload.clone(),
                    task.requirements.clone(),
                    now.duration_since(task.created_at).as_secs_f64(),
                )
            };
            let gpu_bytes = requirements
                .iter()
                .find(|r| r.kind == ResourceKind::GpuMemory)
                .map_or(0, |r| r.amount);
            state.running.insert(entry.id);
            state.pending = state.pending.saturating_sub(1);
            state.cancel_tokens.insert(entry.id, token.clone());
            state.accountant.record_allocation(entry.id, &requirements);
            push_stat(&mut state.wait_ms, wait_secs * 1000.0);
            return Some(DispatchJob {
                id: entry.id,
                payload,
                token,
                gpu_bytes,
            });
        }
        None
    }

    /// Placement failed or the task was cancelled in the window between pop
    /// and placement: roll the dispatch back.
    fn undo_dispatch(&self, state: &mut State, job: &DispatchJob, fired: &mut FiredCallbacks) {
        state.running.remove(&job.id);
        state.cancel_tokens.remove(&job.id);
        state.accountant.record_release(job.id);
        state.pending += 1;
        if let Some(task) = state.tasks.get_mut(&job.id) {
            task.state = TaskState::Ready;
            task.blocked = true;
            task.started_at = None;
        }
        if job.token.is_cancelled() {
            Self::cancel_pending(state, job.id, fired);
        }
    }

    /// Mark a waiting task ready and queue it.
    fn mark_ready(state: &mut State, id: TaskId) -> bool {
        let Some(task) = state.tasks.get_mut(&id) else {
            return false;
        };
        if task.state != TaskState::WaitingOnDeps {
            return false;
        }
        task.state = TaskState::Ready;
        let entry = ReadyEntry {
            priority: task.priority,
            created_at: task.created_at,
            id,
        };
        state.ready.push(entry);
        true
    }

    /// Transition a non-running, non-terminal task to `Failed`.
    fn fail_task(state: &mut State, id: TaskId, reason: &FailureReason, fired: &mut FiredCallbacks) {
        let was_pending = {
            let Some(task) = state.tasks.get_mut(&id) else {
                return;
            };
            if task.state.is_terminal() || task.state == TaskState::Running {
                return;
            }
            task.state = TaskState::Failed;
            task.failure = Some(reason.clone());
            task.completed_at = Some(Instant::now());
            task.blocked = false;
            task.push_error(reason.to_string());
            true
        };
        if was_pending {
            state.pending = state.pending.saturating_sub(1);
        }
        state.counters.failed += 1;
        *state
            .counters
            .errors_by_reason
            .entry(reason.label().to_owned())
            .or_insert(0) += 1;
        state.push_recent_error(format!("{id}: {reason}"));
        if let Some(cb) = state.callbacks.remove(&id) {
            if let Some(task) = state.tasks.get(&id) {
                fired.push((task.clone(), cb));
            }
        }
    }

    /// Transition a non-running, non-terminal task to `Cancelled` and
    /// propagate to dependents.
    fn cancel_pending(state: &mut State, id: TaskId, fired: &mut FiredCallbacks) {
        {
            let Some(task) = state.tasks.get_mut(&id) else {
                return;
            };
            if task.state.is_terminal() || task.state == TaskState::Running {
                return;
            }
            task.state = TaskState::Cancelled;
            task.completed_at = Some(Instant::now());
            task.blocked = false;
        }
        state.pending = state.pending.saturating_sub(1);
        state.counters.cancelled += 1;
        if let Some(cb) = state.callbacks.remove(&id) {
            if let Some(task) = state.tasks.get(&id) {
                fired.push((task.clone(), cb));
            }
        }
        let resolution = state.deps.remove_task(id);
        Self::apply_resolution(state, resolution, fired);
    }

    /// Apply an engine resolution; returns true when any task became ready.
    fn apply_resolution(state: &mut State, resolution: Resolution, fired: &mut FiredCallbacks) -> bool {
        let mut readied_any = false;
        for (id, reason) in resolution.failed {
            Self::fail_task(state, id, &reason, fired);
        }
        for id in resolution.readied {
            readied_any |= Self::mark_ready(state, id);
        }
        readied_any
    }

    /// Record a finished worker invocation and propagate the outcome.
    fn finalize(&self, state: &mut State, job: &DispatchJob, result: Result<Vec<u8>, String>) -> FiredCallbacks {
        let mut fired = FiredCallbacks::new();
        state.running.remove(&job.id);
        state.cancel_tokens.remove(&job.id);
        state.accountant.record_release(job.id);
        let timed_out = state.timed_out.remove(&job.id);
        let now = Instant::now();

        enum Outcome {
            Completed(Vec<u8>),
            Failed(FailureReason),
            Cancelled,
        }
        let outcome = if timed_out {
            Outcome::Failed(FailureReason::TimedOut)
        } else if job.token.is_cancelled() {
            Outcome::Cancelled
        } else {
            match result {
                Ok(output) => Outcome::Completed(output),
                Err(reason) => Outcome::Failed(FailureReason::WorkerError(reason)),
            }
        };

        let (description, processing_secs) = {
            let Some(task) = state.tasks.get_mut(&job.id) else {
                return fired;
            };
            task.completed_at = Some(now);
            let processing = task
                .started_at
                .map_or(0.0, |s| now.duration_since(s).as_secs_f64());
            (task.description.clone(), processing)
        };
        push_stat(&mut state.processing_ms, processing_secs * 1000.0);

        match outcome {
            Outcome::Completed(output) => {
                if let Some(task) = state.tasks.get_mut(&job.id) {
                    task.state = TaskState::Completed;
                    task.output = Some(output);
                }
                state.counters.completed += 1;
                state
                    .predictor
                    .record_completion(&description, processing_secs);
                debug!(task = %job.id, "task completed");
                let readied = state.deps.on_complete(job.id);
                for id in readied {
                    Self::mark_ready(state, id);
                }
            }
            Outcome::Failed(reason) => {
                if reason == FailureReason::TimedOut {
                    state.counters.timeouts += 1;
                }
                warn!(task = %job.id, %reason, "task failed");
                {
                    let Some(task) = state.tasks.get_mut(&job.id) else {
                        return fired;
                    };
                    task.state = TaskState::Failed;
                    task.failure = Some(reason.clone());
                    task.push_error(reason.to_string());
                }
                state.counters.failed += 1;
                *state
                    .counters
                    .errors_by_reason
                    .entry(reason.label().to_owned())
                    .or_insert(0) += 1;
                state.push_recent_error(format!("{}: {reason}", job.id));
                let resolution = state.deps.on_failure(job.id);
                Self::apply_resolution(state, resolution, &mut fired);
            }
            Outcome::Cancelled => {
                if let Some(task) = state.tasks.get_mut(&job.id) {
                    task.state = TaskState::Cancelled;
                }
                state.counters.cancelled += 1;
                info!(task = %job.id, "task cancelled at worker return");
                let resolution = state.deps.remove_task(job.id);
                Self::apply_resolution(state, resolution, &mut fired);
            }
        }

        if let Some(cb) = state.callbacks.remove(&job.id) {
            if let Some(task) = state.tasks.get(&job.id) {
                fired.push((task.clone(), cb));
            }
        }
        fired
    }

    /// Dispatcher thread body: block for work, place it, run the callback on
    /// this thread's runtime, finalize.
    fn dispatch_loop(&self, worker_id: usize) {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!(worker_id, error = %e, "failed to create dispatcher runtime");
                return;
            }
        };
        debug!(worker_id, "dispatcher started");

        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    if let Some(job) = self.next_job(&mut state) {
                        break job;
                    }
                    self.queue_cv.wait(&mut state);
                }
            };

            // Device placement happens outside the agent lock; the manager
            // has its own.
            match self
                .devices
                .schedule(job.id, &self.config.model_name, job.gpu_bytes)
            {
                Ok(_) => self.devices.mark_running(job.id),
                Err(_) => {
                    let mut fired = FiredCallbacks::new();
                    {
                        let mut state = self.state.lock();
                        self.undo_dispatch(&mut state, &job, &mut fired);
                    }
                    self.done_cv.notify_all();
                    for (task, cb) in fired {
                        cb(&task);
                    }
                    continue;
                }
            }

            let ctx = TaskContext {
                task_id: job.id,
                cancel: job.token.clone(),
            };
            let result = rt.block_on(self.worker.execute(job.payload.clone(), ctx));
            self.devices.release(job.id);

            let fired = {
                let mut state = self.state.lock();
                self.finalize(&mut state, &job, result)
            };
            self.queue_cv.notify_all();
            self.done_cv.notify_all();
            for (task, cb) in fired {
                cb(&task);
            }
        }
    }

    /// One maintenance pass. Public behavior is documented on
    /// [`AgentScheduler::rebalance`].
    fn run_rebalance(&self) {
        self.devices.rebalance();

        let mut fired = FiredCallbacks::new();
        let mut readied_any = false;
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            let epoch = now_ms();
            let threshold = self.config.rebalance.overload_threshold;
            state.load_factor = state.accountant.load_factor();

            // Tighten ceilings on not-yet-running tasks touching overloaded
            // kinds. Ceilings only ever tighten.
            let overloaded = state.accountant.overloaded_kinds(threshold);
            if !overloaded.is_empty() {
                let touched: Vec<TaskId> = state
                    .tasks
                    .iter()
                    .filter(|(_, t)| {
                        matches!(
                            t.state,
                            TaskState::Queued | TaskState::WaitingOnDeps | TaskState::Ready
                        )
                    })
                    .filter(|(_, t)| {
                        t.requirements.iter().any(|r| overloaded.contains(&r.kind))
                    })
                    .map(|(&id, _)| id)
                    .collect();
                for id in touched {
                    if let Some(task) = state.tasks.get_mut(&id) {
                        for req in &mut task.requirements {
                            req.utilization_ceiling *= 0.8;
                        }
                        debug!(task = %id, "tightened ceilings for overloaded kinds");
                    }
                }
            }

            // Revive admission-blocked tasks whose demand now fits.
            let mut blocked: Vec<TaskId> = state
                .tasks
                .iter()
                .filter(|(_, t)| {
                    t.blocked && matches!(t.state, TaskState::Queued | TaskState::Ready)
                })
                .map(|(&id, _)| id)
                .collect();
            blocked.sort_unstable();
            for id in blocked {
                let admitted = state
                    .tasks
                    .get(&id)
                    .is_some_and(|t| state.accountant.admit(&t.requirements));
                if !admitted {
                    continue;
                }
                if let Some(task) = state.tasks.get_mut(&id) {
                    task.blocked = false;
                    task.state = TaskState::Ready;
                    let entry = ReadyEntry {
                        priority: task.priority,
                        created_at: task.created_at,
                        id,
                    };
                    state.ready.push(entry);
                    readied_any = true;
                    debug!(task = %id, "blocked task re-admitted");
                }
            }

            // Cycle detection and dependency timeouts.
            let (broken, readied) = state.deps.detect_and_break_cycles();
            state.counters.cycle_breaks += broken.len() as u64;
            for edge in &broken {
                state.push_recent_error(format!(
                    "cycle broken: {} no longer waits on {}",
                    edge.dependent, edge.upstream
                ));
            }
            for id in readied {
                readied_any |= Self::mark_ready(&mut state, id);
            }
            let resolution = state.deps.check_timeouts(now);
            readied_any |= Self::apply_resolution(&mut state, resolution, &mut fired);

            // Cooperative timeout of overdue running tasks.
            let timeout = self.config.task_timeout();
            let overdue: Vec<TaskId> = state
                .running
                .iter()
                .copied()
                .filter(|id| {
                    state
                        .tasks
                        .get(id)
                        .is_some_and(|t| now.duration_since(t.created_at) > timeout)
                })
                .collect();
            for id in overdue {
                if state.timed_out.insert(id) {
                    warn!(task = %id, "task overran its timeout, signalling cancel");
                    if let Some(token) = state.cancel_tokens.get(&id) {
                        token.cancel();
                    }
                }
            }

            // Accountant upkeep and predictor refresh.
            state.accountant.sample();
            state.accountant.adjust_limits();
            for kind in ResourceKind::ALL {
                let utilization = state.accountant.utilization(kind);
                state.predictor.record_sample(kind, utilization, epoch);
            }
            if state.predictor.refresh(now, epoch) {
                state.bottlenecked = state.predictor.bottlenecks();
            }
        }

        if readied_any {
            self.queue_cv.notify_all();
        }
        if !fired.is_empty() {
            self.done_cv.notify_all();
        }
        for (task, cb) in fired {
            cb(&task);
        }
    }

    fn maintenance_loop(&self, stop_rx: &Receiver<()>) {
        let interval = Duration::from_millis(self.config.rebalance.interval_ms);
        loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    self.run_rebalance();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

/// Builder for [`AgentScheduler`].
pub struct AgentSchedulerBuilder {
    config: AgentConfig,
    capacities: HashMap<ResourceKind, u64>,
    devices: Option<Arc<DeviceManager>>,
}

impl AgentSchedulerBuilder {
    /// Set the capacity of one resource kind. Memory kinds default to the
    /// configured `memory_budget` when not set explicitly.
    #[must_use]
    pub fn capacity(mut self, kind: ResourceKind, amount: u64) -> Self {
        self.capacities.insert(kind, amount);
        self
    }

    /// Share a device manager with other agents. Without one, the scheduler
    /// creates a private single-device in-memory manager sized to the
    /// memory budget.
    #[must_use]
    pub fn devices(mut self, devices: Arc<DeviceManager>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Validate the configuration, check the worker kind, and start the
    /// dispatcher and maintenance threads.
    ///
    /// # Errors
    /// [`SchedulerError::InvalidConfig`] on validation failure or when the
    /// worker's kind does not match the configuration.
    pub fn build(self, worker: Arc<dyn AgentWorker>) -> Result<AgentScheduler, SchedulerError> {
        let config = self.config;
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        if worker.kind() != config.kind {
            return Err(SchedulerError::InvalidConfig(format!(
                "worker kind {} does not match configured kind {}",
                worker.kind().as_str(),
                config.kind.as_str()
            )));
        }

        let mut capacities = self.capacities;
        capacities
            .entry(ResourceKind::GpuMemory)
            .or_insert(config.memory_budget);
        capacities
            .entry(ResourceKind::CpuMemory)
            .or_insert(config.memory_budget);

        let devices = self.devices.unwrap_or_else(|| {
            let driver = Arc::new(InMemoryDriver::new(1, config.memory_budget));
            Arc::new(DeviceManager::initialize(driver, 1, config.worker_concurrency.max(4)))
        });

        let history_cap = config.prediction.max_history;
        let predictor = LoadPredictor::new(
            history_cap,
            Duration::from_millis(config.prediction.refresh_interval_ms),
        );
        let inner = Arc::new(Inner {
            agent_id: Uuid::new_v4(),
            worker,
            devices,
            state: Mutex::new(State {
                tasks: HashMap::new(),
                ready: ReadyQueue::new(),
                running: HashSet::new(),
                pending: 0,
                cancel_tokens: HashMap::new(),
                timed_out: HashSet::new(),
                callbacks: HashMap::new(),
                accountant: ResourceAccountant::new(&capacities, history_cap),
                deps: DependencyEngine::new(),
                predictor,
                patterns: Vec::new(),
                bottlenecked: Vec::new(),
                counters: Counters::default(),
                processing_ms: VecDeque::new(),
                wait_ms: VecDeque::new(),
                recent_errors: VecDeque::new(),
                load_factor: 0.0,
            }),
            queue_cv: Condvar::new(),
            done_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            started_at: Instant::now(),
            config,
        });

        let mut threads = Vec::with_capacity(inner.config.worker_concurrency + 1);
        for worker_id in 0..inner.config.worker_concurrency {
            let inner_clone = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("dream-dispatch-{worker_id}"))
                .spawn(move || inner_clone.dispatch_loop(worker_id))
                .map_err(|e| SchedulerError::InvalidConfig(format!("spawn failed: {e}")))?;
            threads.push(handle);
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let inner_clone = Arc::clone(&inner);
        let maint = thread::Builder::new()
            .name("dream-maint".into())
            .spawn(move || inner_clone.maintenance_loop(&stop_rx))
            .map_err(|e| SchedulerError::InvalidConfig(format!("spawn failed: {e}")))?;
        threads.push(maint);

        info!(
            agent = %inner.agent_id,
            kind = inner.config.kind.as_str(),
            model = %inner.config.model_name,
            workers = inner.config.worker_concurrency,
            "agent scheduler started"
        );
        Ok(AgentScheduler {
            inner,
            stop_tx: Mutex::new(Some(stop_tx)),
            threads: Mutex::new(threads),
        })
    }
}

/// Per-agent task scheduler.
///
/// One instance per agent variant; the device manager may be shared across
/// instances. All public operations are callable from any thread.
pub struct AgentScheduler {
    inner: Arc<Inner>,
    stop_tx: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentScheduler {
    /// Start building a scheduler for the given configuration.
    #[must_use]
    pub fn builder(config: AgentConfig) -> AgentSchedulerBuilder {
        AgentSchedulerBuilder {
            config,
            capacities: HashMap::new(),
            devices: None,
        }
    }

    /// Scheduler instance identity.
    #[must_use]
    pub fn agent_id(&self) -> Uuid {
        self.inner.agent_id
    }

    /// Submit a task.
    ///
    /// Fails fast only when the queue is at capacity. Admission refusal does
    /// not fail the submit: the task is retained, marked blocked, and
    /// revisited by the next rebalance tick.
    ///
    /// # Errors
    /// [`SchedulerError::QueueFull`].
    pub fn submit(&self, request: SubmitRequest) -> Result<TaskId, SchedulerError> {
        self.submit_inner(request, None)
    }

    /// Submit a task with a completion callback, invoked once with the
    /// terminal task record, outside the scheduler lock.
    ///
    /// # Errors
    /// [`SchedulerError::QueueFull`].
    pub fn submit_with_callback(
        &self,
        request: SubmitRequest,
        callback: impl FnOnce(&Task) + Send + 'static,
    ) -> Result<TaskId, SchedulerError> {
        self.submit_inner(request, Some(Box::new(callback)))
    }

    fn submit_inner(
        &self,
        request: SubmitRequest,
        callback: Option<CompletionCallback>,
    ) -> Result<TaskId, SchedulerError> {
        let inner = &self.inner;
        let mut fired = FiredCallbacks::new();
        let mut notify_queue = false;
        let id = {
            let mut state = inner.state.lock();
            if state.pending >= inner.config.max_queue {
                return Err(SchedulerError::QueueFull);
            }
            let id = TaskId::next();
            let now = Instant::now();
            let priority = request.priority.unwrap_or(inner.config.priority_default);
            let mut requirements = request
                .requirements
                .unwrap_or_else(|| inner.config.declared_resource_requirements.clone());
            for req in &mut requirements {
                if state.bottlenecked.contains(&req.kind) {
                    req.utilization_ceiling *= 0.8;
                }
            }

            let mut dependencies = request.dependencies;
            if dependencies.is_empty() {
                let kinds: Vec<ResourceKind> = requirements.iter().map(|r| r.kind).collect();
                if let Some(pattern) =
                    DependencyEngine::matching_pattern(&kinds, &state.patterns)
                {
                    debug!(task = %id, pattern = %pattern.id, "applying dependency pattern");
                    dependencies = pattern.template_deps.clone();
                }
            }

            let admitted = state.accountant.admit(&requirements);
            let outcome = state.deps.register(id, priority, now, &dependencies, now);

            let mut task = Task {
                id,
                description: request.description,
                payload: request.payload,
                dependencies,
                priority,
                requirements,
                state: TaskState::Queued,
                blocked: false,
                created_at: now,
                started_at: None,
                completed_at: None,
                retry_count: 0,
                output: None,
                failure: None,
                error_messages: Vec::new(),
                metadata: request.metadata,
            };
            if let Some(cb) = callback {
                state.callbacks.insert(id, cb);
            }

            match outcome {
                RegisterOutcome::Failed(reason) => {
                    task.state = TaskState::Failed;
                    task.failure = Some(reason.clone());
                    task.completed_at = Some(now);
                    task.push_error(reason.to_string());
                    state.tasks.insert(id, task);
                    state.counters.failed += 1;
                    *state
                        .counters
                        .errors_by_reason
                        .entry(reason.label().to_owned())
                        .or_insert(0) += 1;
                    state.push_recent_error(format!("{id}: {reason}"));
                    if let Some(cb) = state.callbacks.remove(&id) {
                        if let Some(t) = state.tasks.get(&id) {
                            fired.push((t.clone(), cb));
                        }
                    }
                    warn!(task = %id, "submitted against a failed upstream");
                }
                RegisterOutcome::Waiting => {
                    task.state = TaskState::WaitingOnDeps;
                    state.tasks.insert(id, task);
                    state.pending += 1;
                    debug!(task = %id, "task waiting on dependencies");
                }
                RegisterOutcome::Ready => {
                    state.pending += 1;
                    if admitted {
                        task.state = TaskState::Ready;
                        let entry = ReadyEntry {
                            priority,
                            created_at: now,
                            id,
                        };
                        state.tasks.insert(id, task);
                        state.ready.push(entry);
                        notify_queue = true;
                    } else {
                        task.blocked = true;
                        state.tasks.insert(id, task);
                        warn!(task = %id, "insufficient resources at submit, task blocked");
                    }
                }
            }
            debug!(task = %id, ?priority, "task submitted");
            id
        };
        if notify_queue {
            self.inner.queue_cv.notify_one();
        }
        if !fired.is_empty() {
            self.inner.done_cv.notify_all();
            for (task, cb) in fired {
                cb(&task);
            }
        }
        Ok(id)
    }

    /// Cancel a task. Pending tasks cancel synchronously; running tasks get
    /// the cooperative flag and reach `Cancelled` when the worker returns.
    ///
    /// # Errors
    /// [`SchedulerError::UnknownTask`]; [`SchedulerError::InvalidTransition`]
    /// on an already-terminal task.
    pub fn cancel(&self, id: TaskId) -> Result<(), SchedulerError> {
        let mut fired = FiredCallbacks::new();
        {
            let mut state = self.inner.state.lock();
            let Some(current) = state.tasks.get(&id).map(|t| t.state) else {
                return Err(SchedulerError::UnknownTask(id));
            };
            if current.is_terminal() {
                return Err(SchedulerError::InvalidTransition {
                    task: id,
                    state: current,
                    operation: "cancel",
                });
            }
            if current == TaskState::Running {
                if let Some(token) = state.cancel_tokens.get(&id) {
                    token.cancel();
                }
                info!(task = %id, "cancellation requested for running task");
                return Ok(());
            }
            Inner::cancel_pending(&mut state, id, &mut fired);
            info!(task = %id, "task cancelled");
        }
        self.inner.done_cv.notify_all();
        self.inner.queue_cv.notify_all();
        for (task, cb) in fired {
            cb(&task);
        }
        Ok(())
    }

    /// Re-queue a failed task. Clears timestamps and the failure record,
    /// increments the retry counter.
    ///
    /// # Errors
    /// [`SchedulerError::UnknownTask`]; [`SchedulerError::InvalidTransition`]
    /// unless the task is `Failed`.
    pub fn retry(&self, id: TaskId) -> Result<(), SchedulerError> {
        {
            let mut state = self.inner.state.lock();
            let Some(current) = state.tasks.get(&id).map(|t| t.state) else {
                return Err(SchedulerError::UnknownTask(id));
            };
            if current != TaskState::Failed {
                return Err(SchedulerError::InvalidTransition {
                    task: id,
                    state: current,
                    operation: "retry",
                });
            }
            state.deps.reopen(id);
            state.timed_out.remove(&id);
            let entry = {
                let Some(task) = state.tasks.get_mut(&id) else {
                    return Err(SchedulerError::UnknownTask(id));
                };
                task.state = TaskState::Ready;
                task.blocked = false;
                task.started_at = None;
                task.completed_at = None;
                task.failure = None;
                task.retry_count += 1;
                ReadyEntry {
                    priority: task.priority,
                    created_at: task.created_at,
                    id,
                }
            };
            state.pending += 1;
            state.counters.retries += 1;
            state.ready.push(entry);
            info!(task = %id, "task retried");
        }
        self.inner.queue_cv.notify_one();
        Ok(())
    }

    /// Has the task completed successfully?
    ///
    /// # Errors
    /// [`SchedulerError::UnknownTask`].
    pub fn is_completed(&self, id: TaskId) -> Result<bool, SchedulerError> {
        let state = self.inner.state.lock();
        state
            .tasks
            .get(&id)
            .map(|t| t.state == TaskState::Completed)
            .ok_or(SchedulerError::UnknownTask(id))
    }

    /// Snapshot of a task record.
    ///
    /// # Errors
    /// [`SchedulerError::UnknownTask`].
    pub fn task(&self, id: TaskId) -> Result<Task, SchedulerError> {
        let state = self.inner.state.lock();
        state
            .tasks
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::UnknownTask(id))
    }

    /// Block until the task reaches a terminal state.
    ///
    /// # Errors
    /// [`SchedulerError::UnknownTask`].
    pub fn wait(&self, id: TaskId) -> Result<TaskState, SchedulerError> {
        let mut state = self.inner.state.lock();
        loop {
            let Some(current) = state.tasks.get(&id).map(|t| t.state) else {
                return Err(SchedulerError::UnknownTask(id));
            };
            if current.is_terminal() {
                return Ok(current);
            }
            self.inner.done_cv.wait(&mut state);
        }
    }

    /// Block until the task is terminal or the timeout elapses. `None` on
    /// timeout.
    ///
    /// # Errors
    /// [`SchedulerError::UnknownTask`].
    pub fn wait_timeout(
        &self,
        id: TaskId,
        timeout: Duration,
    ) -> Result<Option<TaskState>, SchedulerError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            let Some(current) = state.tasks.get(&id).map(|t| t.state) else {
                return Err(SchedulerError::UnknownTask(id));
            };
            if current.is_terminal() {
                return Ok(Some(current));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let result = self
                .inner
                .done_cv
                .wait_for(&mut state, deadline.duration_since(now));
            if result.timed_out() {
                // Re-check once; the state may have flipped right at the
                // deadline.
                let Some(current) = state.tasks.get(&id).map(|t| t.state) else {
                    return Err(SchedulerError::UnknownTask(id));
                };
                return Ok(current.is_terminal().then_some(current));
            }
        }
    }

    /// Register a dependency pattern for future zero-dependency submissions.
    pub fn register_pattern(&self, pattern: DependencyPattern) {
        let mut state = self.inner.state.lock();
        state.patterns.push(pattern);
    }

    /// Run one maintenance pass now: device rebalance, overload
    /// redistribution, blocked-task revival, cycle breakage, dependency and
    /// task timeouts, accountant sampling and limit adjustment, predictor
    /// refresh. The background maintenance thread calls this on its tick;
    /// tests may call it directly for determinism.
    pub fn rebalance(&self) {
        self.inner.run_rebalance();
    }

    /// Assemble a metrics snapshot.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn metrics(&self) -> AgentMetrics {
        let state = self.inner.state.lock();
        let mut processing: Vec<f64> = state.processing_ms.iter().copied().collect();
        processing.sort_by(f64::total_cmp);
        let mean = |series: &VecDeque<f64>| {
            if series.is_empty() {
                0.0
            } else {
                series.iter().sum::<f64>() / series.len() as f64
            }
        };

        let mut queued = 0u64;
        let mut waiting = 0u64;
        let mut blocked = 0u64;
        for task in state.tasks.values() {
            match task.state {
                TaskState::Queued | TaskState::Ready => queued += 1,
                TaskState::WaitingOnDeps => waiting += 1,
                _ => {}
            }
            if task.blocked && !task.state.is_terminal() {
                blocked += 1;
            }
        }

        let attempts = state.counters.completed + state.counters.failed;
        let success_rate = if attempts == 0 {
            1.0
        } else {
            state.counters.completed as f64 / attempts as f64
        };
        let elapsed = self.inner.started_at.elapsed().as_secs_f64().max(1e-9);

        AgentMetrics {
            agent_id: self.inner.agent_id,
            kind: self.inner.config.kind,
            model_name: self.inner.config.model_name.clone(),
            active_tasks: state.running.len() as u64,
            completed_tasks: state.counters.completed,
            failed_tasks: state.counters.failed,
            cancelled_tasks: state.counters.cancelled,
            queued_tasks: queued,
            waiting_tasks: waiting,
            blocked_tasks: blocked,
            retries: state.counters.retries,
            timeouts: state.counters.timeouts,
            cycle_breaks: state.counters.cycle_breaks,
            errors_by_reason: state.counters.errors_by_reason.clone(),
            task_success_rate: success_rate,
            mean_processing_ms: mean(&state.processing_ms),
            p95_processing_ms: percentile(&processing, 0.95),
            p99_processing_ms: percentile(&processing, 0.99),
            mean_wait_ms: mean(&state.wait_ms),
            throughput_per_sec: state.counters.completed as f64 / elapsed,
            load_factor: state.load_factor,
            peak_memory_bytes: state.accountant.peak_memory_bytes(),
            resources: state.accountant.snapshots(),
            pending_dependencies: state.deps.pending_count(),
            recent_errors: state.recent_errors.iter().cloned().collect(),
            snapshot_at_ms: now_ms(),
        }
    }

    /// Push the current snapshot into a sink. The sink has no influence on
    /// scheduling.
    pub fn report_to(&self, sink: &mut dyn MetricsSink) {
        sink.record(self.metrics());
    }

    /// Latest load predictions and completion analytics, exposed for
    /// operators.
    #[must_use]
    pub fn recommendations(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        state.predictor.recommendations()
    }

    /// Resource kinds the predictor currently flags as bottlenecks.
    #[must_use]
    pub fn predicted_bottlenecks(&self) -> Vec<ResourceKind> {
        let state = self.inner.state.lock();
        state.bottlenecked.clone()
    }

    /// Gracefully stop dispatchers and the maintenance thread. Running
    /// workers get the cooperative cancel flag; threads that do not exit
    /// within the join timeout are detached.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(agent = %self.inner.agent_id, "shutting down agent scheduler");
        {
            let state = self.inner.state.lock();
            for token in state.cancel_tokens.values() {
                token.cancel();
            }
        }
        {
            let mut tx = self.stop_tx.lock();
            *tx = None;
        }
        self.inner.queue_cv.notify_all();
        self.inner.done_cv.notify_all();

        let mut threads = self.threads.lock();
        for handle in threads.drain(..) {
            let name = handle.thread().name().unwrap_or("dream-thread").to_owned();
            let (tx, rx) = std::sync::mpsc::channel();
            let joiner = thread::spawn(move || {
                let ok = handle.join().is_ok();
                let _ = tx.send(ok);
            });
            match rx.recv_timeout(Duration::from_secs(2)) {
                Ok(true) => {
                    debug!(thread = %name, "thread joined");
                    let _ = joiner.join();
                }
                Ok(false) => {
                    warn!(thread = %name, "thread panicked");
                    let _ = joiner.join();
                }
                Err(_) => {
                    warn!(thread = %name, "thread did not exit within timeout, detaching");
                }
            }
        }
        info!(agent = %self.inner.agent_id, "agent scheduler shut down");
    }
}

impl Drop for AgentScheduler {
    fn drop(&mut self) {
        if !self.inner.shutdown.swap(true, Ordering::AcqRel) {
            let mut tx = self.stop_tx.lock();
            *tx = None;
            drop(tx);
            self.inner.queue_cv.notify_all();
            self.inner.done_cv.notify_all();
            debug!("scheduler dropped without explicit shutdown, threads detached");
        }
    }
}
