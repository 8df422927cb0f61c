// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! fetchq - download queue library
//!
//! Queue, schedule and supervise yt-dlp download jobs. Survives restarts.
//!
//! Tasks are durable records in a JSON store; a bounded scheduler admits
//! them FIFO into worker slots, each worker driving one external downloader
//! process and reporting parsed progress. Every status change is persisted
//! before anything acts on it, so a crash at any point is recoverable at
//! the next startup.
//!
//! # Core Modules
//!
//! - [`task`] - Task records, statuses, and the durable store
//! - [`scheduler`] - Admission control, wait queue, and worker supervision
//! - [`worker`] - Child process execution, output parsing, failure classification
//! - [`resume`] - Startup recovery of interrupted work
//! - [`events`] - Broadcast stream of status and progress events
//! - [`config`] - Owner configuration and policy knobs

pub mod config;
pub mod events;
pub mod resume;
pub mod scheduler;
pub mod task;
pub mod worker;

// Re-export the types most callers need
pub use config::Config;
pub use events::TaskEvent;
pub use resume::{recover, recover_and_resume};
pub use scheduler::{Scheduler, SchedulerError};
pub use task::{new_task_id, StoreError, TaskOptions, TaskRecord, TaskStatus, TaskStore};
pub use worker::{
    classify, default_signatures, parse_line, ErrorSignature, FailureClass, FailureKind,
    Invocation, ParsedLine, ProgressUpdate, WorkerOutcome, WorkerSignal, YtDlpInvocation,
};
