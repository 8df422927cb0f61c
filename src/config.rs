// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Owner configuration.
//!
//! All policy knobs the scheduler and workers consult live here: concurrency
//! bound, retry budget, resume-on-launch behavior, throttle and grace
//! intervals, and owner-supplied error signatures. Loaded from
//! `~/.fetchq/config.json`; missing file means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::worker::signatures::ErrorSignature;

/// Default bound on concurrently running workers.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default retry budget per task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bound on concurrently running workers (>= 1)
    pub max_concurrent: usize,
    /// Retry budget applied to newly created tasks
    pub max_retries: u32,
    /// Re-admit unfinished work at startup instead of leaving it paused
    pub auto_resume_on_launch: bool,
    /// Downloader binary name or path
    pub downloader_program: String,
    /// Default output directory for new tasks
    pub output_dir: PathBuf,
    /// Grace period between terminate and kill on cancellation, milliseconds
    pub cancel_grace_ms: u64,
    /// Minimum interval between persisted progress updates, milliseconds
    pub persist_interval_ms: u64,
    /// Owner-supplied error signatures, consulted before the built-in table
    pub extra_signatures: Vec<ErrorSignature>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_retries: DEFAULT_MAX_RETRIES,
            auto_resume_on_launch: false,
            downloader_program: "yt-dlp".to_string(),
            output_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            cancel_grace_ms: 3_000,
            persist_interval_ms: 1_000,
            extra_signatures: Vec::new(),
        }
    }
}

impl Config {
    /// Default config file location (`~/.fetchq/config.json`).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".fetchq").join("config.json"))
            .unwrap_or_else(|| PathBuf::from(".fetchq/config.json"))
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let mut config: Config =
            serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;
        config.max_concurrent = config.max_concurrent.max(1);
        Ok(config)
    }

    /// Write the config to `path`, creating parent directories.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let content =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize config")?;
        fs::write(path, content).with_context(|| format!("Failed to write config: {:?}", path))?;
        Ok(())
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    /// Full signature table: owner-supplied matchers first, then built-ins.
    pub fn signature_table(&self) -> Vec<ErrorSignature> {
        let mut table = self.extra_signatures.clone();
        table.extend(crate::worker::signatures::default_signatures());
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::signatures::FailureKind;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.max_retries, 3);
        assert!(!config.auto_resume_on_launch);
        assert_eq!(config.downloader_program, "yt-dlp");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.max_concurrent, DEFAULT_MAX_CONCURRENT);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.max_concurrent = 5;
        config.auto_resume_on_launch = true;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.max_concurrent, 5);
        assert!(loaded.auto_resume_on_launch);
    }

    #[test]
    fn test_concurrency_clamped_to_one() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"max_concurrent": 0}"#).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.max_concurrent, 1);
    }

    #[test]
    fn test_extra_signatures_precede_builtins() {
        let mut config = Config::default();
        config.extra_signatures.push(ErrorSignature::new(
            "Private video",
            FailureKind::Retryable,
            "Owner override",
        ));
        let table = config.signature_table();
        assert_eq!(table[0].title, "Owner override");
    }
}
