// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Child-process invocation seam.
//!
//! The scheduler never builds command lines itself; it asks an [`Invocation`]
//! for the program and arguments to run for a task. Production uses
//! [`YtDlpInvocation`]; tests substitute shell scripts.

use crate::task::TaskRecord;
use crate::worker::parser::PROGRESS_PREFIX;

/// Builds the external command for one task.
pub trait Invocation: Send + Sync {
    /// Program to execute and its full argument list.
    fn build(&self, task: &TaskRecord) -> (String, Vec<String>);
}

/// Default invocation targeting a yt-dlp-compatible binary.
///
/// Requests quiet single-line progress plus a machine-readable
/// progress-template line per update, and passes the options blob through
/// without interpreting it.
pub struct YtDlpInvocation {
    program: String,
}

impl YtDlpInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for YtDlpInvocation {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl Invocation for YtDlpInvocation {
    fn build(&self, task: &TaskRecord) -> (String, Vec<String>) {
        let mut args: Vec<String> = vec![
            "--ignore-config".into(),
            "--no-warnings".into(),
            "--no-color".into(),
            "--newline".into(),
            "--progress".into(),
            "-q".into(),
            // Partial output stays resumable after pause/cancel.
            "--continue".into(),
            "--progress-template".into(),
            format!(
                "download:{}download|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.speed)s|%(progress.eta)s|%(info.vcodec)s|%(info.acodec)s|%(info.ext)s|%(progress.filename)s",
                PROGRESS_PREFIX
            ),
            "--progress-template".into(),
            format!(
                "postprocess:{}postprocess|%(progress.status)s|%(progress.postprocessor)s",
                PROGRESS_PREFIX
            ),
            "--paths".into(),
            task.output_dir.display().to_string(),
        ];

        let opts = &task.options;
        if let Some(format) = &opts.format {
            args.push("-f".into());
            args.push(format.clone());
        }
        if let Some(template) = &opts.output_template {
            args.push("-o".into());
            args.push(template.clone());
        }
        if let Some(cookies) = &opts.cookies_file {
            args.push("--cookies".into());
            args.push(cookies.display().to_string());
        }
        if let Some(limit) = &opts.rate_limit {
            args.push("--limit-rate".into());
            args.push(limit.clone());
        }
        args.extend(opts.extra_args.iter().cloned());

        args.push(task.source.clone());
        (self.program.clone(), args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskOptions, TaskRecord};
    use std::path::PathBuf;

    #[test]
    fn test_default_invocation_shape() {
        let task = TaskRecord::new("https://example.com/v", "/media/out");
        let (program, args) = YtDlpInvocation::default().build(&task);
        assert_eq!(program, "yt-dlp");
        assert_eq!(args.last().map(String::as_str), Some("https://example.com/v"));
        assert!(args.iter().any(|a| a == "--newline"));
        assert!(args.iter().any(|a| a == "--continue"));
        assert!(args.iter().any(|a| a.starts_with(&format!("download:{}", PROGRESS_PREFIX))));
        let paths_idx = args.iter().position(|a| a == "--paths").unwrap();
        assert_eq!(args[paths_idx + 1], "/media/out");
    }

    #[test]
    fn test_options_pass_through() {
        let mut opts = TaskOptions::new();
        opts.format = Some("bv*+ba/b".into());
        opts.cookies_file = Some(PathBuf::from("/tmp/cookies.txt"));
        opts.rate_limit = Some("2M".into());
        opts.extra_args = vec!["--embed-subs".into()];
        let task = TaskRecord::new("https://example.com/v", "/media/out").with_options(opts);

        let (_, args) = YtDlpInvocation::default().build(&task);
        let f_idx = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[f_idx + 1], "bv*+ba/b");
        let c_idx = args.iter().position(|a| a == "--cookies").unwrap();
        assert_eq!(args[c_idx + 1], "/tmp/cookies.txt");
        assert!(args.iter().any(|a| a == "--embed-subs"));
    }
}
