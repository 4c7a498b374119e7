//! Run state tracker.
//!
//! Single source of truth for module states, attempts and results. Every
//! mutation takes the same mutex, so readers always see a consistent
//! snapshot and transitions are validated against one table.

use crate::error::{ExecutionError, StateError};
use crate::models::{
    AttemptRecord, ExecutionResult, ModuleDescriptor, ModuleRecord, ModuleState, RunSnapshot,
    RunStatus,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

struct Inner {
    status: RunStatus,
    abort_reason: Option<String>,
    started_at: Option<chrono::DateTime<Utc>>,
    finished_at: Option<chrono::DateTime<Utc>>,
    records: BTreeMap<String, ModuleRecord>,
    admission_order: Vec<String>,
    admitted_at: HashMap<String, Instant>,
    running: usize,
    peak_running: usize,
}

/// Thread-safe tracker shared by the scheduler, its workers and observers.
pub struct RunStateTracker {
    inner: Mutex<Inner>,
}

impl RunStateTracker {
    /// Create a tracker with every module `Pending`.
    pub fn new<'a>(descriptors: impl IntoIterator<Item = &'a ModuleDescriptor>) -> Self {
        let records = descriptors
            .into_iter()
            .map(|d| (d.id.clone(), ModuleRecord::new(d)))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                status: RunStatus::Init,
                abort_reason: None,
                started_at: None,
                finished_at: None,
                records,
                admission_order: Vec::new(),
                admitted_at: HashMap::new(),
                running: 0,
                peak_running: 0,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StateError> {
        self.inner.lock().map_err(|_| StateError::Poisoned)
    }

    /// INIT -> RUNNING.
    pub fn begin_run(&self) -> Result<(), StateError> {
        let mut inner = self.lock()?;
        inner.status = RunStatus::Running;
        inner.started_at = Some(Utc::now());
        Ok(())
    }

    /// RUNNING -> COMPLETED or ABORTED. The first abort reason wins.
    pub fn finish_run(&self, status: RunStatus, reason: Option<String>) -> Result<(), StateError> {
        let mut inner = self.lock()?;
        inner.status = status;
        if inner.abort_reason.is_none() {
            inner.abort_reason = reason;
        }
        inner.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Move a module to a new state, returning the previous one.
    pub fn transition(&self, id: &str, to: ModuleState) -> Result<ModuleState, StateError> {
        let mut inner = self.lock()?;
        transition_locked(&mut inner, id, to)
    }

    pub fn state(&self, id: &str) -> Result<ModuleState, StateError> {
        let inner = self.lock()?;
        inner
            .records
            .get(id)
            .map(|r| r.state)
            .ok_or_else(|| StateError::UnknownModule(id.to_string()))
    }

    /// Current state of every module.
    pub fn states(&self) -> Result<BTreeMap<String, ModuleState>, StateError> {
        let inner = self.lock()?;
        Ok(inner
            .records
            .iter()
            .map(|(id, r)| (id.clone(), r.state))
            .collect())
    }

    /// Number of modules currently `Running`.
    pub fn running(&self) -> Result<usize, StateError> {
        Ok(self.lock()?.running)
    }

    pub fn start_attempt(&self, id: &str, number: u32) -> Result<(), StateError> {
        let mut inner = self.lock()?;
        let record = record_mut(&mut inner, id)?;
        record.attempts.push(AttemptRecord {
            number,
            started_at: Utc::now(),
            elapsed_secs: None,
            outcome: None,
        });
        Ok(())
    }

    pub fn finish_attempt(
        &self,
        id: &str,
        number: u32,
        elapsed: Duration,
        outcome: &str,
    ) -> Result<(), StateError> {
        let mut inner = self.lock()?;
        let record = record_mut(&mut inner, id)?;
        if let Some(attempt) = record.attempts.iter_mut().rev().find(|a| a.number == number) {
            attempt.elapsed_secs = Some(elapsed.as_secs_f64());
            attempt.outcome = Some(outcome.to_string());
        }
        Ok(())
    }

    /// Record success and move to `Succeeded`.
    pub fn complete(&self, id: &str, result: ExecutionResult) -> Result<(), StateError> {
        let mut inner = self.lock()?;
        transition_locked(&mut inner, id, ModuleState::Succeeded)?;
        let record = record_mut(&mut inner, id)?;
        record.status_code = Some(result.status);
        record.result = Some(result);
        Ok(())
    }

    /// Record a failure and move to `Failed`.
    pub fn fail(&self, id: &str, error: &ExecutionError) -> Result<(), StateError> {
        let mut inner = self.lock()?;
        transition_locked(&mut inner, id, ModuleState::Failed)?;
        let record = record_mut(&mut inner, id)?;
        record.status_code = Some(error.status_code());
        record.error = Some(error.to_string());
        Ok(())
    }

    /// Move a module that never ran to `Skipped`.
    pub fn skip(&self, id: &str, reason: &str) -> Result<(), StateError> {
        let mut inner = self.lock()?;
        transition_locked(&mut inner, id, ModuleState::Skipped)?;
        let record = record_mut(&mut inner, id)?;
        record.error = Some(reason.to_string());
        Ok(())
    }

    /// Consistent deep copy of the whole run.
    pub fn snapshot(&self) -> Result<RunSnapshot, StateError> {
        let inner = self.lock()?;
        Ok(RunSnapshot {
            status: inner.status,
            abort_reason: inner.abort_reason.clone(),
            started_at: inner.started_at,
            finished_at: inner.finished_at,
            modules: inner.records.clone(),
            admission_order: inner.admission_order.clone(),
            peak_running: inner.peak_running,
        })
    }
}

fn record_mut<'a>(inner: &'a mut Inner, id: &str) -> Result<&'a mut ModuleRecord, StateError> {
    inner
        .records
        .get_mut(id)
        .ok_or_else(|| StateError::UnknownModule(id.to_string()))
}

fn transition_locked(inner: &mut Inner, id: &str, to: ModuleState) -> Result<ModuleState, StateError> {
    let from = record_mut(inner, id)?.state;
    if !from.can_transition_to(to) {
        return Err(StateError::InvalidTransition {
            module: id.to_string(),
            from,
            to,
        });
    }

    if to == ModuleState::Running {
        inner.running += 1;
        inner.peak_running = inner.peak_running.max(inner.running);
        if !inner.admitted_at.contains_key(id) {
            inner.admitted_at.insert(id.to_string(), Instant::now());
            inner.admission_order.push(id.to_string());
        }
    }
    if from == ModuleState::Running {
        inner.running = inner.running.saturating_sub(1);
    }

    let elapsed = if to.is_terminal() {
        inner.admitted_at.get(id).map(|t| t.elapsed().as_secs_f64())
    } else {
        None
    };

    let record = record_mut(inner, id)?;
    record.state = to;
    if elapsed.is_some() {
        record.elapsed_secs = elapsed;
    }

    debug!(module = %id, "{} -> {}", from, to);
    Ok(from)
}
