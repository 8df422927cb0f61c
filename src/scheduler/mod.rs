// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Scheduler: admission control and worker supervision.
//!
//! Owns the FIFO wait queue and the set of active workers, bounded by
//! `max_concurrent`. `pump` is the only path from `Queued` to `Running`;
//! every caller that frees a slot or adds work calls it, and calling it
//! with nothing to do is a no-op. A task id is never in the wait queue and
//! the active set at the same time; both structures are mutated under one
//! lock, which is never held across an await point.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Instant};

use crate::config::Config;
use crate::events::TaskEvent;
use crate::task::{StoreError, TaskRecord, TaskStatus, TaskStore};
use crate::worker::{
    run_worker, ErrorSignature, FailureKind, Invocation, WorkerContext, WorkerOutcome,
    WorkerSignal,
};

/// Poll interval while draining workers during shutdown.
const DRAIN_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task `{0}` not found")]
    NotFound(String),
    #[error("task `{id}` is {status} and cannot be {action}")]
    InvalidState {
        id: String,
        status: &'static str,
        action: &'static str,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct State {
    max_concurrent: usize,
    /// Running workers, keyed by task id; the value is the control signal.
    active: HashMap<String, watch::Sender<WorkerSignal>>,
    /// FIFO admission order, disjoint from `active`.
    wait_queue: VecDeque<String>,
    shutting_down: bool,
}

struct Inner {
    store: Arc<TaskStore>,
    invocation: Arc<dyn Invocation>,
    events: broadcast::Sender<TaskEvent>,
    signatures: Arc<Vec<ErrorSignature>>,
    cancel_grace: Duration,
    persist_interval: Duration,
    default_max_retries: u32,
    state: Mutex<State>,
}

/// Handle to the scheduler; cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        invocation: Arc<dyn Invocation>,
        config: &Config,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                invocation,
                events,
                signatures: Arc::new(config.signature_table()),
                cancel_grace: config.cancel_grace(),
                persist_interval: config.persist_interval(),
                default_max_retries: config.max_retries,
                state: Mutex::new(State {
                    max_concurrent: config.max_concurrent.max(1),
                    active: HashMap::new(),
                    wait_queue: VecDeque::new(),
                    shutting_down: false,
                }),
            }),
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.inner.store
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.inner.events.send(event);
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().expect("scheduler lock")
    }

    /// Create a new task, persist it as `Queued`, and try to admit it.
    /// Returns the new id and whether it started immediately (false means
    /// it is waiting in the queue).
    pub fn submit(&self, mut record: TaskRecord) -> Result<(String, bool), SchedulerError> {
        record.max_retries = self.inner.default_max_retries;
        let id = self.inner.store.create(record)?;
        self.emit(TaskEvent::StatusChanged {
            id: id.clone(),
            status: TaskStatus::Queued,
        });
        self.state().wait_queue.push_back(id.clone());
        tracing::info!(task = %id, "task submitted");
        self.pump();
        let started = self.state().active.contains_key(&id);
        Ok((id, started))
    }

    /// Put an existing record back on the wait queue. The record must
    /// already be persisted as `Queued`.
    fn enqueue(&self, id: &str) {
        let mut state = self.state();
        if !state.wait_queue.iter().any(|q| q == id) && !state.active.contains_key(id) {
            state.wait_queue.push_back(id.to_string());
        }
    }

    /// Admit waiting tasks while slots are free. Idempotent; the sole path
    /// from `Queued` to `Running`.
    pub fn pump(&self) {
        loop {
            let launch = {
                let mut state = self.state();
                if state.shutting_down || state.active.len() >= state.max_concurrent {
                    None
                } else {
                    match state.wait_queue.pop_front() {
                        Some(id) => {
                            let (tx, rx) = watch::channel(WorkerSignal::Run);
                            state.active.insert(id.clone(), tx);
                            Some((id, rx))
                        }
                        None => None,
                    }
                }
            };
            let Some((id, signal_rx)) = launch else { break };

            // Only a still-queued record may start; anything else was
            // mutated behind the queue's back and is skipped.
            let record = match self.inner.store.get(&id) {
                Some(r) if r.status == TaskStatus::Queued => r,
                _ => {
                    self.state().active.remove(&id);
                    continue;
                }
            };

            // Persist Running before the process exists. A crash after this
            // write leaves a record the resume coordinator demotes to Paused.
            if let Err(e) = self.inner.store.update(&id, |t| {
                t.set_status(TaskStatus::Running);
                t.error = None;
            }) {
                tracing::error!(task = %id, "failed to persist running status: {}", e);
                self.state().active.remove(&id);
                continue;
            }
            self.emit(TaskEvent::StatusChanged {
                id: id.clone(),
                status: TaskStatus::Running,
            });

            let (program, args) = self.inner.invocation.build(&record);
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.supervise(record.id, program, args, signal_rx).await;
            });
        }
    }

    /// Run one worker to completion, apply retry policy, free the slot.
    async fn supervise(
        &self,
        id: String,
        program: String,
        args: Vec<String>,
        signal_rx: watch::Receiver<WorkerSignal>,
    ) {
        let ctx = WorkerContext {
            store: Arc::clone(&self.inner.store),
            events: self.inner.events.clone(),
            signatures: Arc::clone(&self.inner.signatures),
            cancel_grace: self.inner.cancel_grace,
            persist_interval: self.inner.persist_interval,
        };
        let outcome = run_worker(ctx, id.clone(), program, args, signal_rx).await;

        // The child has exited: release the slot first, so a retry requeue
        // below finds the id absent from the active set. The queue and the
        // active set stay disjoint throughout.
        self.on_worker_terminal(&id);

        match outcome {
            // The worker already persisted and announced these.
            WorkerOutcome::Completed | WorkerOutcome::Paused | WorkerOutcome::Cancelled => {}
            WorkerOutcome::LaunchFailed(message) => {
                let _ = self.inner.store.update(&id, |t| t.mark_failed(&message));
                self.emit(TaskEvent::StatusChanged {
                    id: id.clone(),
                    status: TaskStatus::Failed,
                });
            }
            WorkerOutcome::Failed(class) => {
                let retryable = class.kind == FailureKind::Retryable
                    && self
                        .inner
                        .store
                        .get(&id)
                        .map(|t| t.can_retry())
                        .unwrap_or(false);
                if retryable {
                    let updated = self.inner.store.update(&id, |t| {
                        t.retry_count += 1;
                        t.error = Some(class.message.clone());
                        t.reset_for_retry();
                    });
                    match updated {
                        Ok(record) => {
                            self.emit(TaskEvent::StatusChanged {
                                id: id.clone(),
                                status: TaskStatus::Queued,
                            });
                            self.emit(TaskEvent::MessageLogged {
                                id: id.clone(),
                                message: format!(
                                    "retrying ({}/{}) after: {}",
                                    record.retry_count, record.max_retries, class.message
                                ),
                            });
                            tracing::info!(
                                task = %id,
                                attempt = record.retry_count,
                                "requeueing after retryable failure"
                            );
                            self.enqueue(&id);
                            self.pump();
                        }
                        Err(e) => {
                            tracing::warn!(task = %id, "requeue persist failed: {}", e);
                        }
                    }
                } else {
                    let _ = self.inner.store.update(&id, |t| t.mark_failed(&class.message));
                    self.emit(TaskEvent::StatusChanged {
                        id: id.clone(),
                        status: TaskStatus::Failed,
                    });
                    tracing::warn!(task = %id, "task failed terminally: {}", class.message);
                }
            }
        }
    }

    /// A worker reached a terminal outcome: free its slot, admit the next.
    fn on_worker_terminal(&self, id: &str) {
        self.state().active.remove(id);
        self.pump();
    }

    /// Pause a running or queued task.
    pub fn pause(&self, id: &str) -> Result<(), SchedulerError> {
        {
            let mut state = self.state();
            if let Some(signal) = state.active.get(id) {
                let _ = signal.send(WorkerSignal::Pause);
                return Ok(());
            }
            if let Some(pos) = state.wait_queue.iter().position(|q| q == id) {
                state.wait_queue.remove(pos);
            }
        }
        let record = self
            .inner
            .store
            .get(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        match record.status {
            TaskStatus::Queued => {
                self.inner.store.update(id, |t| t.mark_paused())?;
                self.emit(TaskEvent::StatusChanged {
                    id: id.to_string(),
                    status: TaskStatus::Paused,
                });
                Ok(())
            }
            TaskStatus::Paused => Ok(()),
            status => Err(SchedulerError::InvalidState {
                id: id.to_string(),
                status: status.as_str(),
                action: "paused",
            }),
        }
    }

    /// Resume a paused task: back to the end of the wait queue. A failed
    /// task with retry budget remaining may also re-enter admission here,
    /// keeping its consumed budget.
    pub fn resume(&self, id: &str) -> Result<(), SchedulerError> {
        let record = self
            .inner
            .store
            .get(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        let resumable = record.status == TaskStatus::Paused
            || (record.status == TaskStatus::Failed && record.can_retry());
        if !resumable {
            return Err(SchedulerError::InvalidState {
                id: id.to_string(),
                status: record.status.as_str(),
                action: "resumed",
            });
        }
        self.inner.store.update(id, |t| t.set_status(TaskStatus::Queued))?;
        self.emit(TaskEvent::StatusChanged {
            id: id.to_string(),
            status: TaskStatus::Queued,
        });
        self.enqueue(id);
        self.pump();
        Ok(())
    }

    /// Cancel a task in any non-terminal state. Partial output is left in
    /// place on disk.
    pub fn cancel(&self, id: &str) -> Result<(), SchedulerError> {
        {
            let mut state = self.state();
            if let Some(signal) = state.active.get(id) {
                let _ = signal.send(WorkerSignal::Cancel);
                return Ok(());
            }
            if let Some(pos) = state.wait_queue.iter().position(|q| q == id) {
                state.wait_queue.remove(pos);
            }
        }
        let record = self
            .inner
            .store
            .get(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if record.status.is_terminal() {
            return Err(SchedulerError::InvalidState {
                id: id.to_string(),
                status: record.status.as_str(),
                action: "cancelled",
            });
        }
        self.inner.store.update(id, |t| t.mark_cancelled())?;
        self.emit(TaskEvent::StatusChanged {
            id: id.to_string(),
            status: TaskStatus::Cancelled,
        });
        Ok(())
    }

    /// Manually retry a failed task. Resets the automatic retry budget.
    pub fn retry(&self, id: &str) -> Result<(), SchedulerError> {
        let record = self
            .inner
            .store
            .get(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if record.status != TaskStatus::Failed {
            return Err(SchedulerError::InvalidState {
                id: id.to_string(),
                status: record.status.as_str(),
                action: "retried",
            });
        }
        self.inner.store.update(id, |t| {
            t.retry_count = 0;
            t.error = None;
            t.reset_for_retry();
        })?;
        self.emit(TaskEvent::StatusChanged {
            id: id.to_string(),
            status: TaskStatus::Queued,
        });
        self.enqueue(id);
        self.pump();
        Ok(())
    }

    /// Retry every failed task. Returns how many were requeued.
    pub fn retry_all_failed(&self) -> Result<usize, SchedulerError> {
        let failed = self.inner.store.by_status(TaskStatus::Failed);
        for task in &failed {
            self.retry(&task.id)?;
        }
        Ok(failed.len())
    }

    /// Remove a task's record. A running task is cancelled first; partial
    /// output stays on disk. The slot stays occupied until the worker's
    /// child has actually exited, keeping running children within the
    /// concurrency bound during the kill window.
    pub fn delete(&self, id: &str) -> Result<TaskRecord, SchedulerError> {
        {
            let mut state = self.state();
            if let Some(signal) = state.active.get(id) {
                let _ = signal.send(WorkerSignal::Cancel);
            }
            if let Some(pos) = state.wait_queue.iter().position(|q| q == id) {
                state.wait_queue.remove(pos);
            }
        }
        let removed = self.inner.store.remove(id)?;
        Ok(removed)
    }

    /// Raise or lower the concurrency bound. Lowering never stops running
    /// workers; the bound applies to new admissions only.
    pub fn set_max_concurrent(&self, n: usize) {
        self.state().max_concurrent = n.max(1);
        self.pump();
    }

    pub fn active_count(&self) -> usize {
        self.state().active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state().wait_queue.len()
    }

    /// Stop admissions, pause every running worker, and wait up to `grace`
    /// for them to drain. Returns true if everything stopped in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        {
            let mut state = self.state();
            state.shutting_down = true;
            for signal in state.active.values() {
                let _ = signal.send(WorkerSignal::Pause);
            }
        }
        let deadline = Instant::now() + grace;
        loop {
            if self.active_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    remaining = self.active_count(),
                    "shutdown grace expired with workers still running"
                );
                return false;
            }
            sleep(DRAIN_POLL).await;
        }
    }
}
