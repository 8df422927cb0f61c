// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Startup recovery.
//!
//! The durable store is the source of truth across restarts, but a record
//! saying `running` after a restart is a lie: the process that owned that
//! worker is gone. Recovery demotes every `running` and `queued` record to
//! `paused` so nothing starts spontaneously; the owner (or the
//! auto-resume setting) decides what continues.

use crate::scheduler::{Scheduler, SchedulerError};
use crate::task::{StoreError, TaskStatus, TaskStore};

/// Demote interrupted work to `Paused`. Returns the demoted task ids in
/// store order, oldest first, so callers can resume them in the original
/// admission order.
pub fn recover(store: &TaskStore) -> Result<Vec<String>, StoreError> {
    let mut demoted = Vec::new();
    for task in store.load_all() {
        if matches!(task.status, TaskStatus::Running | TaskStatus::Queued) {
            store.update(&task.id, |t| t.mark_paused())?;
            tracing::info!(
                task = %task.id,
                was = task.status.as_str(),
                "demoted interrupted task to paused"
            );
            demoted.push(task.id);
        }
    }
    Ok(demoted)
}

/// Full startup pass: demote interrupted work, then re-submit paused
/// records through the scheduler only when `auto_resume` says so. The
/// conservative default leaves everything paused awaiting user action.
/// Returns the demoted ids either way.
pub fn recover_and_resume(
    scheduler: &Scheduler,
    auto_resume: bool,
) -> Result<Vec<String>, SchedulerError> {
    let demoted = recover(scheduler.store())?;
    if auto_resume {
        for task in scheduler.store().by_status(TaskStatus::Paused) {
            scheduler.resume(&task.id)?;
        }
    }
    Ok(demoted)
}
