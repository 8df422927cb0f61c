// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task types for the download queue.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Status of a download task.
///
/// Transitions: `Queued -> Running -> {Paused, Completed, Failed, Cancelled}`,
/// `Paused -> Running | Cancelled`, `Failed -> Running` (manual retry while
/// budget remains). `Completed` and `Cancelled` are always terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a free execution slot
    Queued,
    /// Child process is running
    Running,
    /// Stopped by the user or the resume coordinator; can continue later
    Paused,
    /// Child process exited successfully
    Completed,
    /// Terminal failure (budget exhausted or permanent error)
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl TaskStatus {
    /// Returns true if no further automatic transition occurs.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Returns true if the task currently occupies an execution slot.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Options blob passed through to the child process invocation.
///
/// The scheduler never interprets these beyond presence checks; the
/// [`Invocation`](crate::worker::Invocation) turns them into CLI arguments.
/// `version` exists so persisted blobs can be migrated later.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskOptions {
    /// Blob schema version
    #[serde(default = "default_options_version")]
    pub version: u32,
    /// Format selector string (e.g. "bv*+ba/b")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Output filename template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_template: Option<String>,
    /// Cookies file injected by the credential collaborator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies_file: Option<PathBuf>,
    /// Bandwidth cap (e.g. "2M")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<String>,
    /// Raw pass-through arguments appended verbatim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

fn default_options_version() -> u32 {
    1
}

impl TaskOptions {
    pub fn new() -> Self {
        Self {
            version: 1,
            ..Default::default()
        }
    }
}

/// Durable description of one download job and its current status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier, immutable after creation
    pub id: String,
    /// Source locator (URL)
    pub source: String,
    /// Directory the child process writes into
    pub output_dir: PathBuf,
    /// Opaque options blob, passed through to the worker
    #[serde(default)]
    pub options: TaskOptions,
    /// Current status
    pub status: TaskStatus,
    /// Progress percentage, 0-100, monotonic within a run
    #[serde(default)]
    pub progress: f64,
    /// Last observed transfer rate in bytes per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_bps: Option<u64>,
    /// Last observed estimated time remaining in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    /// Number of automatic retries consumed
    #[serde(default)]
    pub retry_count: u32,
    /// Retry budget; once exhausted the task fails terminally
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Human-readable message from the last recognized failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Best-effort output file path captured from child output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    /// Best-effort media title
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// When the record was last updated
    pub updated_at: DateTime<Utc>,
}

fn default_max_retries() -> u32 {
    3
}

impl TaskRecord {
    /// Create a new record in the `Queued` state with a fresh id.
    pub fn new(source: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: new_task_id(),
            source: source.into(),
            output_dir: output_dir.into(),
            options: TaskOptions::new(),
            status: TaskStatus::Queued,
            progress: 0.0,
            speed_bps: None,
            eta_seconds: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            error: None,
            output_path: None,
            title: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    /// Update the status and bump the timestamp.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Whether a failed task may be requeued automatically.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn mark_completed(&mut self) {
        self.progress = 100.0;
        self.speed_bps = None;
        self.eta_seconds = None;
        self.error = None;
        self.set_status(TaskStatus::Completed);
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.speed_bps = None;
        self.eta_seconds = None;
        self.set_status(TaskStatus::Failed);
    }

    pub fn mark_cancelled(&mut self) {
        self.speed_bps = None;
        self.eta_seconds = None;
        self.set_status(TaskStatus::Cancelled);
    }

    pub fn mark_paused(&mut self) {
        self.speed_bps = None;
        self.eta_seconds = None;
        self.set_status(TaskStatus::Paused);
    }

    /// Reset run-scoped fields before another attempt.
    pub fn reset_for_retry(&mut self) {
        self.progress = 0.0;
        self.speed_bps = None;
        self.eta_seconds = None;
        self.set_status(TaskStatus::Queued);
    }
}

/// Generate a short opaque task id (8 hex chars).
pub fn new_task_id() -> String {
    let mut rng = rand::thread_rng();
    let n: u32 = rng.gen();
    format!("{:08x}", n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_defaults() {
        let task = TaskRecord::new("https://example.com/v", "/tmp/out");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.progress, 0.0);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.id.len(), 8);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn test_retry_budget() {
        let mut task = TaskRecord::new("https://example.com/v", "/tmp/out");
        assert!(task.can_retry());
        task.retry_count = 3;
        assert!(!task.can_retry());
    }

    #[test]
    fn test_mark_failed_records_message() {
        let mut task = TaskRecord::new("https://example.com/v", "/tmp/out");
        task.mark_failed("Private video");
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Private video"));
    }

    #[test]
    fn test_reset_for_retry_clears_run_state() {
        let mut task = TaskRecord::new("https://example.com/v", "/tmp/out");
        task.progress = 55.0;
        task.speed_bps = Some(1024);
        task.mark_failed("Connection reset by peer");
        task.reset_for_retry();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.progress, 0.0);
        assert!(task.speed_bps.is_none());
    }

    #[test]
    fn test_options_roundtrip() {
        let mut opts = TaskOptions::new();
        opts.format = Some("bv*+ba/b".into());
        opts.extra_args = vec!["--embed-subs".into()];
        let json = serde_json::to_string(&opts).unwrap();
        let back: TaskOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(opts, back);
    }
}
