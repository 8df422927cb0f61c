// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end scheduler behavior driven by real child processes.
//!
//! Tasks carry their own shell script in the `source` field via a test
//! invocation, so each scenario controls exactly what its "downloader"
//! prints and how it exits.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::{sleep, Instant};

use fetchq::{
    Config, Invocation, Scheduler, TaskRecord, TaskStatus, TaskStore,
};

/// Runs the task's `source` field as a shell script.
struct ScriptInvocation;

impl Invocation for ScriptInvocation {
    fn build(&self, task: &TaskRecord) -> (String, Vec<String>) {
        ("sh".into(), vec!["-c".into(), task.source.clone()])
    }
}

fn make_scheduler(dir: &TempDir, max_concurrent: usize) -> Scheduler {
    let store = Arc::new(TaskStore::open(dir.path().join("tasks.json")).unwrap());
    let mut config = Config::default();
    config.max_concurrent = max_concurrent;
    config.max_retries = 3;
    config.cancel_grace_ms = 500;
    config.persist_interval_ms = 10;
    let (events, _rx) = fetchq::events::channel();
    Scheduler::new(store, Arc::new(ScriptInvocation), &config, events)
}

fn script_task(script: impl Into<String>, dir: &TempDir) -> TaskRecord {
    TaskRecord::new(script, dir.path())
}

async fn wait_until<F: Fn() -> bool>(pred: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(20)).await;
    }
}

fn status_of(sched: &Scheduler, id: &str) -> TaskStatus {
    sched.store().get(id).unwrap().status
}

#[tokio::test]
async fn fifo_admission_within_concurrency_bound() {
    let dir = TempDir::new().unwrap();
    let sched = make_scheduler(&dir, 2);
    let order = dir.path().join("order");

    let slow = format!("echo first >> {:?}; sleep 0.4", order);
    let (t1, started1) = sched.submit(script_task(&slow, &dir)).unwrap();
    let (t2, started2) = sched.submit(script_task(&slow, &dir)).unwrap();
    let (t3, started3) = sched
        .submit(script_task(
            format!("echo third >> {:?}", order),
            &dir,
        ))
        .unwrap();

    // Two slots filled, the third waits its turn.
    assert!(started1 && started2 && !started3);
    assert_eq!(sched.active_count(), 2);
    assert_eq!(sched.queued_count(), 1);
    assert_eq!(status_of(&sched, &t3), TaskStatus::Queued);

    wait_until(
        || {
            [&t1, &t2, &t3]
                .iter()
                .all(|id| status_of(&sched, id) == TaskStatus::Completed)
        },
        "all three tasks to complete",
    )
    .await;

    let recorded = std::fs::read_to_string(&order).unwrap();
    let lines: Vec<&str> = recorded.lines().collect();
    assert_eq!(lines.len(), 3);
    // Both slow tasks started before the waiting one ran.
    assert_eq!(lines[2], "third");
}

#[tokio::test]
async fn cancel_frees_slot_for_waiting_task() {
    let dir = TempDir::new().unwrap();
    let sched = make_scheduler(&dir, 1);

    let (running, _) = sched.submit(script_task("sleep 30", &dir)).unwrap();
    let (waiting, _) = sched.submit(script_task("true", &dir)).unwrap();
    wait_until(|| status_of(&sched, &running) == TaskStatus::Running, "first task running").await;
    assert_eq!(status_of(&sched, &waiting), TaskStatus::Queued);

    sched.cancel(&running).unwrap();
    wait_until(
        || status_of(&sched, &running) == TaskStatus::Cancelled,
        "cancelled status",
    )
    .await;
    wait_until(
        || status_of(&sched, &waiting) == TaskStatus::Completed,
        "waiting task to take the freed slot",
    )
    .await;
}

#[tokio::test]
async fn retryable_failure_requeues_until_success() {
    let dir = TempDir::new().unwrap();
    let sched = make_scheduler(&dir, 1);
    let counter = dir.path().join("attempts");

    // Fails with a network-class error on the first two attempts.
    let script = format!(
        "n=$(cat {c:?} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {c:?}; \
         if [ $n -le 2 ]; then echo 'ERROR: Connection reset by peer' >&2; exit 1; fi",
        c = counter
    );
    let (id, _) = sched.submit(script_task(script, &dir)).unwrap();

    wait_until(
        || status_of(&sched, &id) == TaskStatus::Completed,
        "task to succeed after retries",
    )
    .await;
    let record = sched.store().get(&id).unwrap();
    assert_eq!(record.retry_count, 2);
    assert_eq!(std::fs::read_to_string(&counter).unwrap().trim(), "3");
}

#[tokio::test]
async fn retry_budget_exhaustion_is_terminal() {
    let dir = TempDir::new().unwrap();
    let sched = make_scheduler(&dir, 1);

    let (id, _) = sched
        .submit(script_task("echo 'ERROR: timed out' >&2; exit 1", &dir))
        .unwrap();
    wait_until(|| status_of(&sched, &id) == TaskStatus::Failed, "terminal failure").await;

    let record = sched.store().get(&id).unwrap();
    assert_eq!(record.retry_count, record.max_retries);
    assert_eq!(record.error.as_deref(), Some("Network timeout"));
}

#[tokio::test]
async fn permanent_failure_never_retries() {
    let dir = TempDir::new().unwrap();
    let sched = make_scheduler(&dir, 1);

    let (id, _) = sched
        .submit(script_task(
            "echo 'ERROR: [youtube] x: Private video' >&2; exit 1",
            &dir,
        ))
        .unwrap();
    wait_until(|| status_of(&sched, &id) == TaskStatus::Failed, "terminal failure").await;

    let record = sched.store().get(&id).unwrap();
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.error.as_deref(), Some("Private video"));
}

#[tokio::test]
async fn pause_and_resume_round_trip() {
    let dir = TempDir::new().unwrap();
    let sched = make_scheduler(&dir, 1);

    let (id, _) = sched.submit(script_task("sleep 30", &dir)).unwrap();
    wait_until(|| status_of(&sched, &id) == TaskStatus::Running, "running").await;

    sched.pause(&id).unwrap();
    wait_until(|| status_of(&sched, &id) == TaskStatus::Paused, "paused").await;
    assert_eq!(sched.active_count(), 0);

    // Swap the script so the resumed run finishes.
    sched
        .store()
        .update(&id, |t| t.source = "true".into())
        .unwrap();
    sched.resume(&id).unwrap();
    wait_until(|| status_of(&sched, &id) == TaskStatus::Completed, "completed after resume").await;
}

#[tokio::test]
async fn restart_recovers_interrupted_work() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tasks.json");

    // Previous session: one task persisted mid-run, one still waiting.
    let (running_id, queued_id) = {
        let store = TaskStore::open(&path).unwrap();
        let mut running = TaskRecord::new("sleep 30", dir.path());
        running.set_status(TaskStatus::Running);
        running.progress = 62.5;
        let r = store.create(running).unwrap();
        let q = store
            .create(TaskRecord::new("true", dir.path()))
            .unwrap();
        (r, q)
    };

    // New session: recovery demotes both; nothing is silently completed.
    let store = Arc::new(TaskStore::open(&path).unwrap());
    let mut config = Config::default();
    config.max_concurrent = 2;
    let (events, _rx) = fetchq::events::channel();
    let sched = Scheduler::new(Arc::clone(&store), Arc::new(ScriptInvocation), &config, events);

    // Without the auto-resume setting the recovered work stays paused and
    // no slot is taken.
    let demoted = fetchq::recover_and_resume(&sched, false).unwrap();
    assert_eq!(demoted, vec![running_id.clone(), queued_id.clone()]);
    assert_eq!(store.get(&running_id).unwrap().status, TaskStatus::Paused);
    assert_eq!(store.get(&running_id).unwrap().progress, 62.5);
    assert_eq!(store.get(&queued_id).unwrap().status, TaskStatus::Paused);
    assert_eq!(sched.active_count(), 0);
    assert_eq!(sched.queued_count(), 0);

    // With it, both re-enter admission.
    fetchq::recover_and_resume(&sched, true).unwrap();
    wait_until(
        || store.get(&queued_id).unwrap().status == TaskStatus::Completed,
        "recovered queued task to complete",
    )
    .await;
}

#[tokio::test]
async fn delete_running_task_stops_and_forgets_it() {
    let dir = TempDir::new().unwrap();
    let sched = make_scheduler(&dir, 1);

    let (id, _) = sched.submit(script_task("sleep 30", &dir)).unwrap();
    let (waiting, _) = sched.submit(script_task("true", &dir)).unwrap();
    wait_until(|| status_of(&sched, &id) == TaskStatus::Running, "running").await;

    let removed = sched.delete(&id).unwrap();
    assert_eq!(removed.id, id);
    assert!(sched.store().get(&id).is_none());
    // The slot is reclaimed only once the cancelled child has exited, then
    // the waiting task takes it.
    wait_until(
        || status_of(&sched, &waiting) == TaskStatus::Completed,
        "waiting task to run after the delete",
    )
    .await;
    wait_until(|| sched.active_count() == 0, "slot to free").await;
}

#[tokio::test]
async fn pump_never_exceeds_capacity() {
    let dir = TempDir::new().unwrap();
    let sched = make_scheduler(&dir, 3);

    for _ in 0..10 {
        sched.submit(script_task("sleep 0.2", &dir)).unwrap();
    }
    // Redundant pumps must not over-admit.
    for _ in 0..5 {
        sched.pump();
        assert!(sched.active_count() <= 3);
    }

    wait_until(
        || sched.store().by_status(TaskStatus::Completed).len() == 10,
        "all tasks to finish",
    )
    .await;
    assert_eq!(sched.active_count(), 0);
    assert_eq!(sched.queued_count(), 0);
}
