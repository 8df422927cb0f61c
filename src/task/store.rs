// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable task store.
//!
//! Mirrors the in-memory task map to a single JSON document so the queue
//! survives restarts. Every status-changing operation persists before the
//! caller acts on the new status: a crash between write and action re-runs
//! the action at next startup, a crash before the write leaves the prior
//! durable status for the resume coordinator to re-evaluate.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{TaskRecord, TaskStatus};

/// Default timeout for acquiring the state file lock
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval while waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Structural errors surfaced synchronously to the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task `{0}` already exists")]
    DuplicateId(String),
    #[error("task `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

/// On-disk document shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreDocument {
    /// Version for future migrations
    version: u32,
    /// All task records keyed by id, insertion-ordered
    tasks: IndexMap<String, TaskRecord>,
    /// When the document was last saved
    last_saved: Option<DateTime<Utc>>,
}

impl StoreDocument {
    fn new() -> Self {
        Self {
            version: 1,
            tasks: IndexMap::new(),
            last_saved: None,
        }
    }
}

/// Persistent store for [`TaskRecord`]s.
///
/// All mutation funnels through one lock; `update` persists the full map
/// atomically (write temp file, rename over) before returning.
pub struct TaskStore {
    path: PathBuf,
    inner: Mutex<StoreDocument>,
}

impl TaskStore {
    /// Default state file location (`~/.fetchq/tasks.json`).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".fetchq").join("tasks.json"))
            .unwrap_or_else(|| PathBuf::from(".fetchq/tasks.json"))
    }

    /// Open the store at `path`, loading any existing document.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let doc = Self::load_document(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(doc),
        })
    }

    fn lock_path(path: &Path) -> PathBuf {
        path.with_extension("lock")
    }

    /// Acquire an exclusive lock on the sibling lock file, with timeout.
    fn acquire_exclusive_lock(lock_path: &Path, timeout: Duration) -> Result<File> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .with_context(|| format!("Failed to open lock file: {:?}", lock_path))?;

        let start = Instant::now();
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for exclusive lock on {:?} after {:?}. \
                             Another instance may be writing to the task file.",
                            lock_path,
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to acquire exclusive lock on {:?}", lock_path));
                }
            }
        }
    }

    fn load_document(path: &Path) -> Result<StoreDocument> {
        if !path.exists() {
            return Ok(StoreDocument::new());
        }

        let _guard = Self::acquire_exclusive_lock(&Self::lock_path(path), LOCK_TIMEOUT)?;

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read task file: {:?}", path))?;
        let doc: StoreDocument =
            serde_json::from_str(&content).with_context(|| "Failed to parse task file")?;
        Ok(doc)
    }

    /// Write the full document atomically: serialize, write temp file,
    /// fsync, rename over the previous file. The lock is held across the
    /// rename so concurrent instances serialize.
    fn persist_locked(path: &Path, doc: &mut StoreDocument) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let _guard = Self::acquire_exclusive_lock(&Self::lock_path(path), LOCK_TIMEOUT)?;

        doc.last_saved = Some(Utc::now());
        let content =
            serde_json::to_string_pretty(doc).with_context(|| "Failed to serialize task file")?;

        let temp_path = path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write to temp file")?;
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, path).with_context(|| {
            format!("Failed to rename temp file over task file: {:?} -> {:?}", temp_path, path)
        })?;

        Ok(())
    }

    /// Insert a new record. Rejects duplicate ids.
    pub fn create(&self, record: TaskRecord) -> Result<String, StoreError> {
        let mut doc = self.inner.lock().expect("store lock");
        if doc.tasks.contains_key(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }
        let id = record.id.clone();
        doc.tasks.insert(id.clone(), record);
        Self::persist_locked(&self.path, &mut doc)?;
        Ok(id)
    }

    /// Atomic read-modify-write. Persists before returning the updated
    /// record.
    pub fn update<F>(&self, id: &str, mutator: F) -> Result<TaskRecord, StoreError>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut doc = self.inner.lock().expect("store lock");
        let record = doc
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        mutator(record);
        record.updated_at = Utc::now();
        let updated = record.clone();
        Self::persist_locked(&self.path, &mut doc)?;
        Ok(updated)
    }

    /// Get a snapshot of one record.
    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        let doc = self.inner.lock().expect("store lock");
        doc.tasks.get(id).cloned()
    }

    /// Remove a record. Persists before returning.
    pub fn remove(&self, id: &str) -> Result<TaskRecord, StoreError> {
        let mut doc = self.inner.lock().expect("store lock");
        let removed = doc
            .tasks
            .shift_remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Self::persist_locked(&self.path, &mut doc)?;
        Ok(removed)
    }

    /// Snapshot of all records, in insertion order. Used once at startup by
    /// the resume coordinator and by `list`-style callers.
    pub fn load_all(&self) -> Vec<TaskRecord> {
        let doc = self.inner.lock().expect("store lock");
        doc.tasks.values().cloned().collect()
    }

    /// Snapshot of records with the given status.
    pub fn by_status(&self, status: TaskStatus) -> Vec<TaskRecord> {
        let doc = self.inner.lock().expect("store lock");
        doc.tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    /// Remove all completed records. Returns how many were cleared.
    pub fn clear_completed(&self) -> Result<usize, StoreError> {
        let mut doc = self.inner.lock().expect("store lock");
        let before = doc.tasks.len();
        doc.tasks.retain(|_, t| t.status != TaskStatus::Completed);
        let cleared = before - doc.tasks.len();
        if cleared > 0 {
            Self::persist_locked(&self.path, &mut doc)?;
        }
        Ok(cleared)
    }

    /// Count of tasks per status.
    pub fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let doc = self.inner.lock().expect("store lock");
        let mut counts = HashMap::new();
        for task in doc.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock").tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force a persist of the current in-memory map.
    pub fn persist(&self) -> Result<(), StoreError> {
        let mut doc = self.inner.lock().expect("store lock");
        Self::persist_locked(&self.path, &mut doc)?;
        Ok(())
    }
}
