//! Concurrent scheduler.
//!
//! A single coordinator owns admission. It keeps a ready queue ordered by
//! (topological layer, identifier), starts workers on a [`JoinSet`] while
//! fewer than `concurrency` are in flight, and after every completion
//! records the terminal state before re-evaluating pending modules.
//!
//! Workers own the attempt loop for one module: execute through the
//! router, classify failures, back off and retry, and report the final
//! outcome back to the coordinator.

use crate::backend::{ExecutionJob, Router};
use crate::context::RunContext;
use crate::error::{ExecutionError, StateError};
use crate::graph::ExecutionGraph;
use crate::models::{ExecutionResult, ModuleDescriptor, ModuleState, RunSnapshot, RunStatus};
use crate::recovery::{RecoveryAction, RecoveryController};
use crate::state::RunStateTracker;
use futures::FutureExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Abort reason recorded when the operator cancels.
pub const OPERATOR_CANCELLED: &str = "cancelled by operator";

/// Bounded worker pool driving an [`ExecutionGraph`] to completion.
pub struct Scheduler {
    concurrency: usize,
    router: Arc<Router>,
    recovery: Arc<RecoveryController>,
}

impl Scheduler {
    pub fn new(concurrency: usize, router: Router, recovery: RecoveryController) -> Self {
        Self {
            concurrency: concurrency.max(1),
            router: Arc::new(router),
            recovery: Arc::new(recovery),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every module in `graph` and return the final snapshot.
    ///
    /// `cancel` is the operator token. Cancelling it aborts the run: running
    /// modules are interrupted and recorded as failed, modules that never
    /// started are skipped, completed results are kept.
    pub async fn run(
        &self,
        graph: Arc<ExecutionGraph>,
        ctx: Arc<RunContext>,
        cancel: CancellationToken,
    ) -> Result<RunSnapshot, StateError> {
        let tracker = Arc::clone(ctx.tracker());
        tracker.begin_run()?;
        info!(
            "Starting run {} with {} module(s), concurrency {}, up to {} attempt(s) per module",
            ctx.run_id(),
            graph.len(),
            self.concurrency,
            self.recovery.policy().max_attempts
        );

        let mut coordinator = Coordinator::new(self, graph, ctx, cancel);

        let outcome = coordinator.drive().await;
        if let Err(ref e) = outcome {
            error!("Run state error: {}", e);
            coordinator.run_token.cancel();
            while coordinator.in_flight.join_next().await.is_some() {}
        }

        let (status, reason) = match outcome {
            Ok(()) if coordinator.abort_reason.is_none() => (RunStatus::Completed, None),
            Ok(()) => (RunStatus::Aborted, coordinator.abort_reason.take()),
            Err(e) => {
                // Best effort: the lock may be the thing that failed.
                let _ = tracker.finish_run(RunStatus::Aborted, Some(e.to_string()));
                return Err(e);
            }
        };
        tracker.finish_run(status, reason)?;
        tracker.snapshot()
    }
}

/// Final outcome of one module as reported by its worker.
enum WorkerOutcome {
    Succeeded(ExecutionResult),
    Failed {
        error: ExecutionError,
        action: RecoveryAction,
    },
}

struct WorkerReport {
    module: String,
    outcome: Result<WorkerOutcome, StateError>,
}

struct Coordinator<'s> {
    scheduler: &'s Scheduler,
    operator: CancellationToken,
    run_token: CancellationToken,
    graph: Arc<ExecutionGraph>,
    ctx: Arc<RunContext>,
    tracker: Arc<RunStateTracker>,
    queue: BTreeSet<(usize, String)>,
    in_flight: JoinSet<WorkerReport>,
    /// Module owning each in-flight task.
    task_modules: HashMap<tokio::task::Id, String>,
    /// Exclusive-mount module currently in flight, if any.
    exclusive_holder: Option<String>,
    abort_reason: Option<String>,
}

impl<'s> Coordinator<'s> {
    fn new(
        scheduler: &'s Scheduler,
        graph: Arc<ExecutionGraph>,
        ctx: Arc<RunContext>,
        operator: CancellationToken,
    ) -> Self {
        let tracker = Arc::clone(ctx.tracker());
        Self {
            scheduler,
            run_token: operator.child_token(),
            operator,
            graph,
            ctx,
            tracker,
            queue: BTreeSet::new(),
            in_flight: JoinSet::new(),
            task_modules: HashMap::new(),
            exclusive_holder: None,
            abort_reason: None,
        }
    }

    async fn drive(&mut self) -> Result<(), StateError> {
        self.promote()?;

        loop {
            if self.abort_reason.is_none() && self.operator.is_cancelled() {
                self.abort(OPERATOR_CANCELLED.to_string())?;
            }
            if self.abort_reason.is_none() {
                self.admit()?;
            }
            if self.in_flight.is_empty() {
                break;
            }

            let operator = self.operator.clone();
            let aborting = self.abort_reason.is_some();
            let joined = tokio::select! {
                joined = self.in_flight.join_next_with_id() => joined,
                _ = operator.cancelled(), if !aborting => continue,
            };

            match joined {
                Some(Ok((task, report))) => {
                    self.task_modules.remove(&task);
                    self.handle(report)?;
                }
                Some(Err(e)) => self.lost_worker(e)?,
                None => {}
            }
        }

        self.sweep()
    }

    fn is_exclusive(&self, id: &str) -> bool {
        self.graph
            .descriptor(id)
            .is_some_and(|d| d.hints.exclusive_mount)
    }

    /// Start ready modules while worker slots are free.
    fn admit(&mut self) -> Result<(), StateError> {
        while self.in_flight.len() < self.scheduler.concurrency {
            let exclusive_busy = self.exclusive_holder.is_some();
            let next = self
                .queue
                .iter()
                .find(|(_, id)| !(exclusive_busy && self.is_exclusive(id)))
                .cloned();
            let Some(key) = next else {
                break;
            };
            self.queue.remove(&key);
            let id = key.1;

            let graph = Arc::clone(&self.graph);
            let spec = graph
                .spec(&id)
                .ok_or_else(|| StateError::UnknownModule(id.clone()))?;

            self.tracker.transition(&id, ModuleState::Running)?;
            if spec.descriptor.hints.exclusive_mount {
                self.exclusive_holder = Some(id.clone());
            }

            let prior = Arc::new(self.tracker.snapshot()?);
            info!(
                module = %id,
                backend = %spec.descriptor.backend,
                "🚀 Admitting {} ({})",
                spec.descriptor.name,
                spec.descriptor.phase
            );

            let worker = Worker {
                job: self.ctx.job(spec, prior),
                descriptor: spec.descriptor.clone(),
                router: Arc::clone(&self.scheduler.router),
                recovery: Arc::clone(&self.scheduler.recovery),
                tracker: Arc::clone(&self.tracker),
                token: self.run_token.child_token(),
            };
            let task = self.in_flight.spawn(worker.run());
            self.task_modules.insert(task.id(), id);
        }
        Ok(())
    }

    /// Record a worker task that died without reporting.
    fn lost_worker(&mut self, e: JoinError) -> Result<(), StateError> {
        let Some(id) = self.task_modules.remove(&e.id()) else {
            error!("Worker task failed: {}", e);
            return Ok(());
        };
        error!(module = %id, "Worker task failed: {}", e);

        let critical = self.graph.descriptor(&id).is_some_and(|d| d.critical);
        let error = ExecutionError::Fault {
            module: id.clone(),
            reason: "worker task failed".to_string(),
            status: None,
        };
        self.handle(WorkerReport {
            module: id,
            outcome: Ok(WorkerOutcome::Failed {
                error,
                action: if critical {
                    RecoveryAction::AbortRun
                } else {
                    RecoveryAction::SkipDependents
                },
            }),
        })
    }

    /// Record a worker's final outcome, then re-evaluate pending modules.
    fn handle(&mut self, report: WorkerReport) -> Result<(), StateError> {
        let id = report.module;
        if self.exclusive_holder.as_deref() == Some(id.as_str()) {
            self.exclusive_holder = None;
        }

        match report.outcome? {
            WorkerOutcome::Succeeded(result) => {
                info!(module = %id, "✅ {} succeeded", id);
                self.tracker.complete(&id, result)?;
            }
            WorkerOutcome::Failed { error, action } => {
                self.tracker.fail(&id, &error)?;
                match action {
                    RecoveryAction::AbortRun => {
                        let reason = if self.operator.is_cancelled() {
                            OPERATOR_CANCELLED.to_string()
                        } else {
                            format!("critical module {} failed: {}", id, error)
                        };
                        error!(module = %id, "❌ {}", error);
                        self.abort(reason)?;
                    }
                    RecoveryAction::SkipDependents | RecoveryAction::Retry { .. } => {
                        warn!(module = %id, "❌ {}; dependents will be skipped", error);
                    }
                }
            }
        }

        if self.abort_reason.is_none() {
            self.promote()?;
        }
        Ok(())
    }

    /// Move pending modules to `Ready` or `Skipped` until nothing changes.
    fn promote(&mut self) -> Result<(), StateError> {
        let graph = Arc::clone(&self.graph);
        let mut states = self.tracker.states()?;

        loop {
            let mut skipped_any = false;

            for id in graph.ids() {
                if states.get(id) != Some(&ModuleState::Pending) {
                    continue;
                }
                let Some(d) = graph.descriptor(id) else {
                    continue;
                };

                if let Some(reason) = failed_dependency(d, &states) {
                    info!(module = %id, "⏭️ Skipping {}: {}", id, reason);
                    self.tracker.skip(id, &reason)?;
                    states.insert(id.to_string(), ModuleState::Skipped);
                    skipped_any = true;
                    continue;
                }

                let terminal = |dep: &str| states.get(dep).is_some_and(|s| s.is_terminal());
                let hard = d
                    .depends_on
                    .iter()
                    .all(|dep| states.get(dep) == Some(&ModuleState::Succeeded));
                let soft = d.soft_depends_on.iter().all(|dep| terminal(dep.as_str()));
                let gate = graph.earlier_phase_modules(d.phase).all(terminal);

                if hard && soft && gate {
                    self.tracker.transition(id, ModuleState::Ready)?;
                    states.insert(id.to_string(), ModuleState::Ready);
                    let layer = graph.layer_of(id).unwrap_or(usize::MAX);
                    self.queue.insert((layer, id.to_string()));
                    debug!(module = %id, "Ready");
                }
            }

            // A skip can satisfy soft dependencies and phase gates.
            if !skipped_any {
                break;
            }
        }
        Ok(())
    }

    /// Cancel running work and skip everything that has not started.
    fn abort(&mut self, reason: String) -> Result<(), StateError> {
        if self.abort_reason.is_some() {
            return Ok(());
        }
        warn!("🛑 Aborting run: {}", reason);
        self.run_token.cancel();

        let skip_reason = format!("run aborted: {}", reason);
        for (_, id) in std::mem::take(&mut self.queue) {
            self.tracker.skip(&id, &skip_reason)?;
        }
        for (id, state) in self.tracker.states()? {
            if state == ModuleState::Pending {
                self.tracker.skip(&id, &skip_reason)?;
            }
        }

        self.abort_reason = Some(reason);
        Ok(())
    }

    /// Settle modules left non-terminal once no worker is in flight.
    fn sweep(&mut self) -> Result<(), StateError> {
        for (id, state) in self.tracker.states()? {
            match state {
                ModuleState::Pending | ModuleState::Ready => {
                    warn!(module = %id, "Module never became runnable");
                    self.tracker.skip(&id, "dependencies never satisfied")?;
                }
                ModuleState::Running | ModuleState::Retrying => {
                    let lost = ExecutionError::Fault {
                        module: id.clone(),
                        reason: "worker lost".to_string(),
                        status: None,
                    };
                    self.tracker.fail(&id, &lost)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// First hard dependency that failed or was skipped, as a skip reason.
fn failed_dependency(
    descriptor: &ModuleDescriptor,
    states: &BTreeMap<String, ModuleState>,
) -> Option<String> {
    descriptor.depends_on.iter().find_map(|dep| match states.get(dep) {
        Some(state @ (ModuleState::Failed | ModuleState::Skipped)) => {
            Some(format!("dependency {} {}", dep, state))
        }
        _ => None,
    })
}

/// Attempt loop for one admitted module.
struct Worker {
    job: ExecutionJob,
    descriptor: ModuleDescriptor,
    router: Arc<Router>,
    recovery: Arc<RecoveryController>,
    tracker: Arc<RunStateTracker>,
    token: CancellationToken,
}

impl Worker {
    async fn run(self) -> WorkerReport {
        let module = self.job.module.clone();
        let critical = self.descriptor.critical;

        let outcome = match AssertUnwindSafe(self.attempts()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Ok(WorkerOutcome::Failed {
                error: ExecutionError::Fault {
                    module: module.clone(),
                    reason: "worker panicked".to_string(),
                    status: None,
                },
                action: if critical {
                    RecoveryAction::AbortRun
                } else {
                    RecoveryAction::SkipDependents
                },
            }),
        };

        WorkerReport { module, outcome }
    }

    async fn attempts(mut self) -> Result<WorkerOutcome, StateError> {
        let id = self.job.module.clone();
        let mut attempt = 1;

        loop {
            self.job.attempt = attempt;
            self.tracker.start_attempt(&id, attempt)?;
            debug!(module = %id, attempt, "Attempt started");

            let started = Instant::now();
            let result = self.router.execute(&self.job, &self.token).await;
            let elapsed = started.elapsed();

            let error = match result {
                Ok(result) => {
                    self.tracker
                        .finish_attempt(&id, attempt, elapsed, "succeeded")?;
                    debug!(module = %id, attempt, "Attempt succeeded in {:.2}s", elapsed.as_secs_f64());
                    return Ok(WorkerOutcome::Succeeded(result));
                }
                Err(error) => error,
            };

            self.tracker
                .finish_attempt(&id, attempt, elapsed, error.kind())?;
            let action = self.recovery.classify(&error, attempt, &self.descriptor);
            let RecoveryAction::Retry { delay } = action else {
                return Ok(WorkerOutcome::Failed { error, action });
            };

            warn!(
                module = %id,
                attempt,
                "🔄 {}; retrying in {}ms",
                error,
                delay.as_millis()
            );
            self.tracker.transition(&id, ModuleState::Retrying)?;
            tokio::select! {
                _ = self.token.cancelled() => {
                    return Ok(WorkerOutcome::Failed {
                        error: ExecutionError::Cancelled { module: id },
                        action: RecoveryAction::AbortRun,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            self.tracker.transition(&id, ModuleState::Running)?;
            attempt += 1;
        }
    }
}
