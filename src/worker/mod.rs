// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Worker: the execution unit driving one task's external child process.
//!
//! A worker owns exactly one child process at a time; the process lifetime
//! is strictly nested inside the worker's. It funnels the child's stdout and
//! stderr line-by-line through the output parser, writes throttled progress
//! into the task store, forwards events toward the UI boundary, and reacts
//! to pause/cancel signals cooperatively (terminate, bounded grace period,
//! then force kill).

pub mod invocation;
pub mod parser;
pub mod signatures;

pub use invocation::{Invocation, YtDlpInvocation};
pub use parser::{parse_line, ParsedLine, ProgressUpdate, PROGRESS_PREFIX};
pub use signatures::{classify, default_signatures, ErrorSignature, FailureClass, FailureKind};

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{timeout, Instant};

use crate::events::TaskEvent;
use crate::task::{TaskStatus, TaskStore};

/// Number of recent output lines retained for failure classification.
const TAIL_LINES: usize = 120;

/// Control signal delivered to a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Keep going
    Run,
    /// Stop the child, keep partial output, mark paused
    Pause,
    /// Stop the child, mark cancelled
    Cancel,
}

/// Terminal result of one worker run, reported to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Completed,
    Paused,
    Cancelled,
    /// Non-zero exit or fatal output signature; the scheduler decides
    /// between requeue and terminal failure.
    Failed(FailureClass),
    /// The child process could not start at all. Never retried.
    LaunchFailed(String),
}

/// Shared collaborators a worker needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<TaskStore>,
    pub events: broadcast::Sender<TaskEvent>,
    pub signatures: Arc<Vec<ErrorSignature>>,
    /// Terminate-to-kill escalation window
    pub cancel_grace: Duration,
    /// Minimum interval between persisted progress writes
    pub persist_interval: Duration,
}

impl WorkerContext {
    fn emit(&self, event: TaskEvent) {
        // Nobody listening is fine; events are best-effort toward the UI.
        let _ = self.events.send(event);
    }
}

/// Run one task's child process to a terminal outcome.
///
/// Status writes go through the task store (persisted before anything acts
/// on them); this function itself only ever sets `Paused`, `Cancelled` and
/// `Completed` — failure statuses are the scheduler's call because they
/// involve the retry budget and the wait queue.
pub async fn run_worker(
    ctx: WorkerContext,
    task_id: String,
    program: String,
    args: Vec<String>,
    mut signal_rx: watch::Receiver<WorkerSignal>,
) -> WorkerOutcome {
    tracing::debug!(task = %task_id, %program, "starting worker");

    let mut child = match Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let message = format!("failed to start {}: {}", program, e);
            tracing::error!(task = %task_id, "{}", message);
            return WorkerOutcome::LaunchFailed(message);
        }
    };

    // Funnel stdout and stderr into one line channel; yt-dlp writes progress
    // to either depending on flags, and failure text usually lands on stderr.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, line_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, line_tx.clone());
    }
    drop(line_tx);

    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
    let mut last_percent: f64 = 0.0;
    let mut last_persisted_percent: f64 = -1.0;
    let mut last_persist = Instant::now();
    let mut stop_requested: Option<WorkerSignal> = None;

    loop {
        tokio::select! {
            maybe_line = line_rx.recv() => {
                let Some(line) = maybe_line else { break };

                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.clone());

                match parse_line(&line) {
                    ParsedLine::Progress(update) => {
                        // Monotonic within a run: a second stream restarting
                        // at zero must not walk the bar backwards.
                        let percent = update.percent.unwrap_or(last_percent).max(last_percent);
                        last_percent = percent;

                        ctx.emit(TaskEvent::ProgressUpdated {
                            id: task_id.clone(),
                            percent,
                            speed_bps: update.speed_bps,
                            eta_seconds: update.eta_seconds,
                        });

                        let crossed_bucket = percent.floor() > last_persisted_percent.floor();
                        let interval_elapsed = last_persist.elapsed() >= ctx.persist_interval;
                        if crossed_bucket || interval_elapsed {
                            let result = ctx.store.update(&task_id, |t| {
                                t.progress = percent;
                                t.speed_bps = update.speed_bps;
                                t.eta_seconds = update.eta_seconds;
                            });
                            if let Err(e) = result {
                                tracing::warn!(task = %task_id, "progress persist failed: {}", e);
                            }
                            last_persisted_percent = percent;
                            last_persist = Instant::now();
                        }
                    }
                    ParsedLine::Destination(path) => {
                        let _ = ctx.store.update(&task_id, |t| {
                            // A merged/final path, once seen, wins over
                            // intermediate fragment destinations.
                            if t.output_path.is_none() {
                                t.output_path = Some(path.clone());
                            }
                        });
                    }
                    ParsedLine::Merge(path) => {
                        ctx.emit(TaskEvent::MessageLogged {
                            id: task_id.clone(),
                            message: format!("merging into {}", path.display()),
                        });
                        let _ = ctx.store.update(&task_id, |t| {
                            t.output_path = Some(path.clone());
                        });
                    }
                    ParsedLine::PostProcess { message, .. } => {
                        ctx.emit(TaskEvent::MessageLogged {
                            id: task_id.clone(),
                            message,
                        });
                    }
                    ParsedLine::Status(message) => {
                        ctx.emit(TaskEvent::MessageLogged {
                            id: task_id.clone(),
                            message,
                        });
                    }
                    ParsedLine::Unknown => {}
                }
            }
            changed = signal_rx.changed() => {
                if changed.is_err() {
                    // Scheduler dropped the sender; treat as cancellation.
                    stop_requested = Some(WorkerSignal::Cancel);
                    break;
                }
                let signal = *signal_rx.borrow();
                if signal != WorkerSignal::Run {
                    stop_requested = Some(signal);
                    break;
                }
            }
        }
    }

    if let Some(signal) = stop_requested {
        stop_child(&mut child, ctx.cancel_grace).await;
        // Drain remaining reader output, but only for a bounded window: a
        // surviving descendant (ffmpeg, a shell's subprocess) can hold the
        // pipe write ends open past the kill, and the stop must still be
        // reported on time.
        let _ = timeout(ctx.cancel_grace, async {
            while line_rx.recv().await.is_some() {}
        })
        .await;

        let (status, outcome) = match signal {
            WorkerSignal::Pause => (TaskStatus::Paused, WorkerOutcome::Paused),
            _ => (TaskStatus::Cancelled, WorkerOutcome::Cancelled),
        };
        let persisted = ctx.store.update(&task_id, |t| match status {
            TaskStatus::Paused => t.mark_paused(),
            _ => t.mark_cancelled(),
        });
        if let Err(e) = persisted {
            tracing::warn!(task = %task_id, "status persist failed: {}", e);
        }
        ctx.emit(TaskEvent::StatusChanged {
            id: task_id.clone(),
            status,
        });
        tracing::info!(task = %task_id, status = status.as_str(), "worker stopped by request");
        return outcome;
    }

    // Output closed naturally; collect the exit status.
    let exit = match child.wait().await {
        Ok(status) => status,
        Err(e) => {
            let class = FailureClass {
                kind: FailureKind::Retryable,
                message: format!("failed to collect downloader exit status: {}", e),
            };
            return WorkerOutcome::Failed(class);
        }
    };

    if exit.success() {
        let persisted = ctx.store.update(&task_id, |t| t.mark_completed());
        if let Err(e) = persisted {
            tracing::warn!(task = %task_id, "completion persist failed: {}", e);
        }
        ctx.emit(TaskEvent::StatusChanged {
            id: task_id.clone(),
            status: TaskStatus::Completed,
        });
        tracing::info!(task = %task_id, "download completed");
        return WorkerOutcome::Completed;
    }

    let tail_text: String = tail.iter().cloned().collect::<Vec<_>>().join("\n");
    let class = classify(&tail_text, exit.code(), &ctx.signatures);
    tracing::warn!(
        task = %task_id,
        exit = ?exit.code(),
        kind = ?class.kind,
        "download failed: {}",
        class.message
    );
    WorkerOutcome::Failed(class)
}

/// Terminate the child cooperatively, wait out the grace period, escalate
/// to a kill. The worker is reported stopped regardless of whether the
/// child obliged.
async fn stop_child(child: &mut Child, grace: Duration) {
    terminate(child);
    match timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            tracing::warn!("child ignored terminate for {:?}, killing", grace);
            let _ = child.kill().await;
        }
    }
}

/// Ask the child to exit. SIGTERM on unix so the downloader can flush its
/// partial-output state; the grace window in [`stop_child`] only means
/// something if this first step is catchable.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    match child.id() {
        Some(pid) => unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        },
        None => {}
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!("terminate failed (already exited?): {}", e);
    }
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRecord;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> (WorkerContext, broadcast::Receiver<TaskEvent>) {
        let store = Arc::new(TaskStore::open(dir.path().join("tasks.json")).unwrap());
        let (events, rx) = crate::events::channel();
        let ctx = WorkerContext {
            store,
            events,
            signatures: Arc::new(default_signatures()),
            cancel_grace: Duration::from_millis(500),
            persist_interval: Duration::from_millis(10),
        };
        (ctx, rx)
    }

    fn seed_task(ctx: &WorkerContext) -> String {
        let mut task = TaskRecord::new("https://example.com/v", "/tmp/out");
        task.set_status(TaskStatus::Running);
        ctx.store.create(task).unwrap()
    }

    fn run_signal() -> watch::Receiver<WorkerSignal> {
        let (tx, rx) = watch::channel(WorkerSignal::Run);
        // Keep the sender alive for the duration of the test process.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_successful_run_marks_completed() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = context(&dir);
        let id = seed_task(&ctx);

        let outcome = run_worker(
            ctx.clone(),
            id.clone(),
            "sh".into(),
            vec!["-c".into(), "echo '[download] 100% of 1.00MiB at 1.00MiB/s ETA 00:00'".into()],
            run_signal(),
        )
        .await;

        assert_eq!(outcome, WorkerOutcome::Completed);
        let record = ctx.store.get(&id).unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.progress, 100.0);
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = context(&dir);
        let id = seed_task(&ctx);

        let outcome = run_worker(
            ctx,
            id,
            "/nonexistent/binary/definitely-missing".into(),
            vec![],
            run_signal(),
        )
        .await;

        assert!(matches!(outcome, WorkerOutcome::LaunchFailed(_)));
    }

    #[tokio::test]
    async fn test_permanent_failure_classified_from_stderr() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = context(&dir);
        let id = seed_task(&ctx);

        let outcome = run_worker(
            ctx,
            id,
            "sh".into(),
            vec![
                "-c".into(),
                "echo 'ERROR: [youtube] x: Private video' >&2; exit 1".into(),
            ],
            run_signal(),
        )
        .await;

        match outcome {
            WorkerOutcome::Failed(class) => {
                assert_eq!(class.kind, FailureKind::Permanent);
                assert_eq!(class.message, "Private video");
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_terminates_child() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = context(&dir);
        let id = seed_task(&ctx);

        // The background sleep survives the shell's death holding the
        // output pipes open, so the stop must not wait for pipe EOF.
        let (signal_tx, signal_rx) = watch::channel(WorkerSignal::Run);
        let handle = tokio::spawn(run_worker(
            ctx.clone(),
            id.clone(),
            "sh".into(),
            vec!["-c".into(), "sleep 30 & wait $!".into()],
            signal_rx,
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        signal_tx.send(WorkerSignal::Cancel).unwrap();

        let outcome = timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop well within the grace window")
            .unwrap();
        assert_eq!(outcome, WorkerOutcome::Cancelled);
        assert_eq!(ctx.store.get(&id).unwrap().status, TaskStatus::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_is_cooperative_before_kill() {
        let dir = TempDir::new().unwrap();
        let (ctx, _rx) = context(&dir);
        let id = seed_task(&ctx);

        // A child that handles the termination request cleanly leaves a
        // marker; a straight kill could never run the trap.
        let marker = dir.path().join("clean-exit");
        let script = format!(
            "trap 'touch {m:?}; exit 0' TERM; sleep 30 & wait $!",
            m = marker
        );
        let (signal_tx, signal_rx) = watch::channel(WorkerSignal::Run);
        let handle = tokio::spawn(run_worker(
            ctx.clone(),
            id.clone(),
            "sh".into(),
            vec!["-c".into(), script],
            signal_rx,
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        signal_tx.send(WorkerSignal::Pause).unwrap();

        let outcome = timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop within the grace window")
            .unwrap();
        assert_eq!(outcome, WorkerOutcome::Paused);
        assert_eq!(ctx.store.get(&id).unwrap().status, TaskStatus::Paused);
        assert!(marker.exists(), "child never saw a catchable terminate");
    }

    #[tokio::test]
    async fn test_progress_persisted_and_forwarded() {
        let dir = TempDir::new().unwrap();
        let (ctx, mut rx) = context(&dir);
        let id = seed_task(&ctx);

        let script = r#"
            echo 'FETCHQ|download|2500000|10000000|1000000|7|h264|aac|mp4|v.mp4'
            echo 'FETCHQ|download|5000000|10000000|1000000|5|h264|aac|mp4|v.mp4'
        "#;
        let outcome = run_worker(
            ctx.clone(),
            id.clone(),
            "sh".into(),
            vec!["-c".into(), script.into()],
            run_signal(),
        )
        .await;
        assert_eq!(outcome, WorkerOutcome::Completed);

        let mut saw_progress = false;
        while let Ok(ev) = rx.try_recv() {
            if let TaskEvent::ProgressUpdated { id: ev_id, percent, .. } = ev {
                assert_eq!(ev_id, id);
                assert!(percent > 0.0);
                saw_progress = true;
            }
        }
        assert!(saw_progress, "expected at least one progress event");
    }
}
