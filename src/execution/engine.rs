//! Main execution engine - runs builders and the builds they trigger

use crate::{
    core::{
        builder::Builder,
        config::Settings,
        master::Master,
        properties::PropertyBag,
        schedulers::{Scheduler, SchedulerKind, SchedulerMatcher, TriggerEvent},
        state::{BuildRecord, BuildResult, StepRecord},
        step::Step,
    },
    execution::{
        executor::{ExecutionResult, StepExecutor, TriggerRequest},
        locks::{LockManager, LockTimeout},
        scheduler::{StepDecision, StepScheduler},
    },
    worker::{WorkerError, WorkerLease, WorkerPool},
};
use async_recursion::async_recursion;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that can occur while builds run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    BuildStarted {
        execution_id: Uuid,
        builder: String,
        build_number: u64,
        worker: String,
        parent: Option<Uuid>,
    },
    StepStarted {
        execution_id: Uuid,
        builder: String,
        step: String,
    },
    StepFinished {
        execution_id: Uuid,
        builder: String,
        step: String,
        result: BuildResult,
        reason: Option<String>,
    },
    StepSkipped {
        execution_id: Uuid,
        builder: String,
        step: String,
        reason: String,
    },
    BuildTriggered {
        parent: Uuid,
        step: String,
        scheduler: String,
        builder: String,
        child: Uuid,
        wait_for_finish: bool,
    },
    LocksAcquired {
        execution_id: Uuid,
        keys: Vec<String>,
    },
    LocksReleased {
        execution_id: Uuid,
        keys: Vec<String>,
    },
    BuildFinished {
        execution_id: Uuid,
        builder: String,
        build_number: u64,
        status: BuildResult,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Errors of the engine's entry points and of builds that cannot start
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown builder '{0}'")]
    UnknownBuilder(String),

    #[error("unknown scheduler '{0}'")]
    UnknownScheduler(String),

    #[error("scheduler '{0}' cannot be forced")]
    NotForceable(String),

    #[error("scheduler '{scheduler}' requires properties: {}", missing.join(", "))]
    MissingProperties {
        scheduler: String,
        missing: Vec<String>,
    },

    #[error("trigger depth limit of {0} exceeded")]
    TriggerDepth(usize),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Lock(#[from] LockTimeout),

    #[error("build task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Where a build sits in its call tree
struct RunContext {
    execution_id: Uuid,
    parent: Option<Uuid>,
    depth: usize,
    /// Scheduler that started the build
    scheduler: Option<String>,
    /// Worker of the waiting caller
    lease: Option<Arc<WorkerLease>>,
    /// Locks held by waiting callers
    held_locks: BTreeSet<String>,
    /// Cleanup builds started after cancellation run to completion
    cancellable: bool,
}

impl RunContext {
    fn root(scheduler: Option<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            parent: None,
            depth: 0,
            scheduler,
            lease: None,
            held_locks: BTreeSet::new(),
            cancellable: true,
        }
    }
}

/// What a trigger step produced
struct TriggerOutcome {
    result: BuildResult,
    reason: Option<String>,
    triggered: Vec<Uuid>,
    children: Vec<BuildRecord>,
    detached: Vec<Uuid>,
}

impl TriggerOutcome {
    fn new() -> Self {
        Self {
            result: BuildResult::Success,
            reason: None,
            triggered: Vec::new(),
            children: Vec::new(),
            detached: Vec::new(),
        }
    }
}

struct EngineInner {
    master: Master,
    settings: Arc<Settings>,
    pool: WorkerPool,
    locks: LockManager,
    executor: StepExecutor,
    matcher: SchedulerMatcher,
    build_numbers: Mutex<HashMap<String, u64>>,
    event_handlers: Mutex<Vec<EventHandler>>,
    cancel_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<BuildRecord>>>,
}

/// Pipeline graph executor
///
/// Cheap to clone; clones share builds, locks, workers and handlers.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

/// Resolves when the engine is cancelled; never for non-cancellable builds
async fn cancelled(rx: &mut watch::Receiver<bool>, cancellable: bool) {
    if cancellable && rx.wait_for(|c| *c).await.is_ok() {
        return;
    }
    std::future::pending::<()>().await
}

impl ExecutionEngine {
    pub fn new(master: Master, pool: WorkerPool) -> Self {
        let settings = Arc::new(master.settings.clone());
        let (cancel_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(EngineInner {
                executor: StepExecutor::new(settings.clone()),
                settings,
                master,
                pool,
                locks: LockManager::new(),
                matcher: SchedulerMatcher::new(),
                build_numbers: Mutex::new(HashMap::new()),
                event_handlers: Mutex::new(Vec::new()),
                cancel_tx,
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn master(&self) -> &Master {
        &self.inner.master
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.inner.event_handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    async fn emit_event(&self, event: ExecutionEvent) {
        let handlers = self.inner.event_handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Run a builder with the given properties and wait for it
    pub async fn invoke(&self, builder: &str, properties: PropertyBag) -> Result<BuildRecord, EngineError> {
        if self.inner.master.builder(builder).is_none() {
            return Err(EngineError::UnknownBuilder(builder.to_string()));
        }
        Ok(self.run_build(builder, properties, RunContext::root(None)).await)
    }

    /// Fire a force scheduler; caller properties override the scheduler's
    pub async fn force(&self, scheduler: &str, properties: PropertyBag) -> Result<Vec<BuildRecord>, EngineError> {
        let found = self
            .inner
            .master
            .scheduler(scheduler)
            .ok_or_else(|| EngineError::UnknownScheduler(scheduler.to_string()))?;
        if !matches!(found.kind, SchedulerKind::Force { .. }) {
            return Err(EngineError::NotForceable(scheduler.to_string()));
        }

        let event = TriggerEvent::Force {
            scheduler: scheduler.to_string(),
        };
        let mut requested = found.properties_for(Some(&event));
        requested.merge(&properties);
        Self::check_required(found, &requested)?;

        self.start_builds(Self::starts(found, &requested)).await
    }

    /// Run every builder of every scheduler matching an event, concurrently
    pub async fn dispatch(&self, event: &TriggerEvent) -> Result<Vec<BuildRecord>, EngineError> {
        let mut starts = Vec::new();
        for scheduler in self.inner.matcher.select(&self.inner.master.schedulers, event) {
            let requested = scheduler.properties_for(Some(event));
            Self::check_required(scheduler, &requested)?;
            starts.extend(Self::starts(scheduler, &requested));
        }
        if starts.is_empty() {
            info!(?event, "No scheduler matched");
        }
        self.start_builds(starts).await
    }

    /// Cancel every running build
    ///
    /// Interrupts running commands and skips the remaining steps except
    /// always-run ones. Cancellation is permanent for this engine.
    pub fn cancel(&self) {
        warn!("Cancelling all builds");
        self.inner.cancel_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancel_tx.borrow()
    }

    /// Wait for fire-and-forget builds, including those they start
    pub async fn wait_background(&self) -> Vec<BuildRecord> {
        let mut records = Vec::new();
        loop {
            let handles = std::mem::take(&mut *self.inner.background.lock().await);
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                match handle.await {
                    Ok(record) => records.push(record),
                    Err(e) => error!("Background build task failed: {}", e),
                }
            }
        }
        records
    }

    fn check_required(scheduler: &Scheduler, requested: &PropertyBag) -> Result<(), EngineError> {
        let missing = scheduler.missing_properties(requested);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EngineError::MissingProperties {
                scheduler: scheduler.name.clone(),
                missing,
            })
        }
    }

    fn starts(scheduler: &Scheduler, requested: &PropertyBag) -> Vec<(String, String, PropertyBag)> {
        scheduler
            .builders
            .iter()
            .map(|b| (scheduler.name.clone(), b.clone(), requested.clone()))
            .collect()
    }

    async fn start_builds(&self, starts: Vec<(String, String, PropertyBag)>) -> Result<Vec<BuildRecord>, EngineError> {
        let handles: Vec<_> = starts
            .into_iter()
            .map(|(scheduler, builder, properties)| {
                let engine = self.clone();
                tokio::spawn(async move {
                    engine
                        .run_build(&builder, properties, RunContext::root(Some(scheduler)))
                        .await
                })
            })
            .collect();

        let mut records = Vec::with_capacity(handles.len());
        for handle in handles {
            records.push(handle.await?);
        }
        Ok(records)
    }

    async fn next_build_number(&self, builder: &str) -> u64 {
        let mut numbers = self.inner.build_numbers.lock().await;
        let number = numbers.entry(builder.to_string()).or_insert(0);
        *number += 1;
        *number
    }

    /// Finish a build that could not run its steps
    async fn abort(
        &self,
        mut record: BuildRecord,
        properties: PropertyBag,
        status: BuildResult,
        reason: String,
    ) -> BuildRecord {
        error!(builder = %record.builder, execution_id = %record.execution_id, "Build aborted: {}", reason);
        record.status = status;
        record.error = Some(reason);
        record.properties = properties;
        record.completed_at = Utc::now();
        self.emit_event(ExecutionEvent::BuildFinished {
            execution_id: record.execution_id,
            builder: record.builder.clone(),
            build_number: record.build_number,
            status,
        })
        .await;
        record
    }

    /// Run one build to a terminal status
    #[async_recursion]
    async fn run_build(&self, builder_name: &str, requested: PropertyBag, ctx: RunContext) -> BuildRecord {
        let execution_id = ctx.execution_id;
        let mut record = BuildRecord::start(execution_id, builder_name, ctx.parent);

        let Some(builder) = self.inner.master.builder(builder_name) else {
            let reason = EngineError::UnknownBuilder(builder_name.to_string()).to_string();
            return self.abort(record, requested, BuildResult::Exception, reason).await;
        };
        if ctx.depth > self.inner.settings.max_trigger_depth {
            let reason = EngineError::TriggerDepth(self.inner.settings.max_trigger_depth).to_string();
            return self.abort(record, requested, BuildResult::Exception, reason).await;
        }

        record.build_number = self.next_build_number(builder_name).await;
        let mut bag = builder.seed_properties(&requested);
        let mut cancel = self.inner.cancel_tx.subscribe();

        // Worker
        let wait = Duration::from_secs(self.inner.settings.worker_wait_secs);
        let lease = tokio::select! {
            biased;
            lease = self.inner.pool.assign(builder, ctx.lease.as_deref(), wait) => lease,
            _ = cancelled(&mut cancel, ctx.cancellable) => {
                let reason = "cancelled while waiting for a worker".to_string();
                return self.abort(record, bag, BuildResult::Cancelled, reason).await;
            }
        };
        let lease = match lease {
            Ok(lease) => Arc::new(lease),
            Err(e) => {
                let reason = EngineError::from(e).to_string();
                return self.abort(record, bag, BuildResult::Exception, reason).await;
            }
        };

        let worker = lease.name().to_string();
        let builddir: PathBuf = self.inner.settings.basedir.join(&worker).join(&builder.name);
        bag.set("buildername", builder.name.as_str(), "Build");
        bag.set("buildnumber", record.build_number as i64, "Build");
        bag.set("builddir", builddir.display().to_string(), "Build");
        bag.set("workername", worker.as_str(), "Worker");
        if let Some(scheduler) = &ctx.scheduler {
            bag.set("scheduler", scheduler.as_str(), "Scheduler");
        }
        record.worker = Some(worker.clone());

        info!(
            builder = %builder.name,
            build_number = record.build_number,
            worker = %worker,
            execution_id = %execution_id,
            "Build started"
        );
        self.emit_event(ExecutionEvent::BuildStarted {
            execution_id,
            builder: builder.name.clone(),
            build_number: record.build_number,
            worker: worker.clone(),
            parent: ctx.parent,
        })
        .await;

        // Locks
        let keys = match builder.render_locks(&bag) {
            Ok(keys) => keys,
            Err(e) => return self.abort(record, bag, BuildResult::Exception, e.to_string()).await,
        };
        let lock_wait = Duration::from_secs(self.inner.settings.lock_wait_secs);
        let guard = tokio::select! {
            biased;
            guard = self.inner.locks.acquire(&keys, &ctx.held_locks, lock_wait) => guard,
            _ = cancelled(&mut cancel, ctx.cancellable) => {
                let reason = "cancelled while waiting for locks".to_string();
                return self.abort(record, bag, BuildResult::Cancelled, reason).await;
            }
        };
        let guard = match guard {
            Ok(guard) => guard,
            Err(e) => {
                let reason = EngineError::from(e).to_string();
                return self.abort(record, bag, BuildResult::Exception, reason).await;
            }
        };
        if !guard.keys().is_empty() {
            self.emit_event(ExecutionEvent::LocksAcquired {
                execution_id,
                keys: guard.keys().to_vec(),
            })
            .await;
        }
        let mut held_locks = ctx.held_locks.clone();
        held_locks.extend(keys.iter().cloned());

        // Steps
        let mut scheduler = StepScheduler::new();
        for step in &builder.steps {
            if ctx.cancellable && *cancel.borrow() && !scheduler.is_cancelled() {
                warn!(builder = %builder.name, execution_id = %execution_id, "Build cancelled");
                scheduler.cancel();
            }

            if let StepDecision::Skip(reason) = scheduler.decide(&step.policy) {
                debug!(builder = %builder.name, step = %step.name, %reason, "Skipping step");
                self.emit_event(ExecutionEvent::StepSkipped {
                    execution_id,
                    builder: builder.name.clone(),
                    step: step.name.clone(),
                    reason: reason.to_string(),
                })
                .await;
                record.steps.push(StepRecord::skipped(&step.name, reason.to_string()));
                continue;
            }

            self.emit_event(ExecutionEvent::StepStarted {
                execution_id,
                builder: builder.name.clone(),
                step: step.name.clone(),
            })
            .await;

            let mut step_record = StepRecord {
                started_at: Some(Utc::now()),
                result: BuildResult::Success,
                reason: None,
                ..StepRecord::skipped(&step.name, "")
            };

            // Steps that run after cancellation are cleanup and are not interrupted
            let interruptible = ctx.cancellable && !scheduler.is_cancelled();
            let executor = lease.executor();
            let execution = self
                .inner
                .executor
                .execute(builder, step, &bag, executor.as_ref(), &builddir);
            let result = tokio::select! {
                biased;
                result = execution => Some(result),
                _ = cancelled(&mut cancel, interruptible) => None,
            };

            match result {
                None => {
                    step_record.result = BuildResult::Cancelled;
                    step_record.reason = Some("interrupted by cancellation".to_string());
                }
                Some(ExecutionResult::Completed(report)) => {
                    for (key, value) in report.updates {
                        bag.set(key, value, &step.name);
                    }
                    step_record.result = report.result;
                    step_record.reason = report.reason;
                    step_record.output = report.output;
                    step_record.exit_code = report.exit_code;
                }
                Some(ExecutionResult::Trigger(request)) => {
                    let child_cancellable = ctx.cancellable && !scheduler.is_cancelled();
                    let outcome = self
                        .run_trigger(step, request, &ctx, &lease, &held_locks, child_cancellable)
                        .await;
                    step_record.result = outcome.result;
                    step_record.reason = outcome.reason;
                    step_record.triggered = outcome.triggered;
                    record.children.extend(outcome.children);
                    record.detached.extend(outcome.detached);
                }
            }

            step_record.finished_at = Some(Utc::now());
            scheduler.record(&step.policy, step_record.result);
            self.emit_event(ExecutionEvent::StepFinished {
                execution_id,
                builder: builder.name.clone(),
                step: step.name.clone(),
                result: step_record.result,
                reason: step_record.reason.clone(),
            })
            .await;
            record.steps.push(step_record);
        }

        // Release
        let released = guard.keys().to_vec();
        drop(guard);
        if !released.is_empty() {
            self.emit_event(ExecutionEvent::LocksReleased {
                execution_id,
                keys: released,
            })
            .await;
        }
        drop(lease);

        record.status = scheduler.status();
        record.properties = bag;
        record.completed_at = Utc::now();

        info!(
            builder = %builder.name,
            build_number = record.build_number,
            status = %record.status,
            "Build finished"
        );
        self.emit_event(ExecutionEvent::BuildFinished {
            execution_id,
            builder: builder.name.clone(),
            build_number: record.build_number,
            status: record.status,
        })
        .await;

        record
    }

    /// Start the builds of a trigger step
    ///
    /// Waiting triggers run their children one after another, on the
    /// caller's worker when it is in the child's pool, and take the worst
    /// child status. Other triggers spawn the children and succeed.
    async fn run_trigger(
        &self,
        step: &Step,
        request: TriggerRequest,
        ctx: &RunContext,
        lease: &Arc<WorkerLease>,
        held_locks: &BTreeSet<String>,
        cancellable: bool,
    ) -> TriggerOutcome {
        let mut outcome = TriggerOutcome::new();

        let mut starts = Vec::new();
        for name in &request.schedulers {
            let Some(scheduler) = self.inner.master.scheduler(name) else {
                outcome.result = BuildResult::Exception;
                outcome.reason = Some(EngineError::UnknownScheduler(name.clone()).to_string());
                return outcome;
            };
            for target in &scheduler.builders {
                let mut properties = scheduler.properties_for(None);
                properties.merge(&request.properties);
                starts.push((scheduler.name.clone(), target.clone(), properties));
            }
        }

        let mut unsuccessful = Vec::new();
        for (scheduler, target, properties) in starts {
            let child = Uuid::new_v4();
            outcome.triggered.push(child);
            self.emit_event(ExecutionEvent::BuildTriggered {
                parent: ctx.execution_id,
                step: step.name.clone(),
                scheduler: scheduler.clone(),
                builder: target.clone(),
                child,
                wait_for_finish: request.wait_for_finish,
            })
            .await;

            let mut child_ctx = RunContext {
                execution_id: child,
                parent: Some(ctx.execution_id),
                depth: ctx.depth + 1,
                scheduler: Some(scheduler),
                lease: None,
                held_locks: BTreeSet::new(),
                cancellable,
            };

            if request.wait_for_finish {
                child_ctx.lease = Some(lease.clone());
                child_ctx.held_locks = held_locks.clone();
                let record = self.run_build(&target, properties, child_ctx).await;
                outcome.result = outcome.result.worst(record.status);
                if !record.status.is_success() {
                    unsuccessful.push(format!("{} ({})", record.builder, record.status));
                }
                outcome.children.push(record);
            } else {
                let engine = self.clone();
                let handle =
                    tokio::spawn(async move { engine.run_build(&target, properties, child_ctx).await });
                self.inner.background.lock().await.push(handle);
                outcome.detached.push(child);
            }
        }

        if !unsuccessful.is_empty() {
            outcome.reason = Some(format!(
                "triggered builds did not succeed: {}",
                unsuccessful.join(", ")
            ));
        }
        outcome
    }
}
