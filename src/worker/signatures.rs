// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Failure classification from child-process output.
//!
//! Exit code alone cannot distinguish a transient network fault from a
//! permanently unavailable video, so the last lines of output are matched
//! against a set of known error signatures. Permanent failures never
//! auto-retry regardless of remaining budget; unrecognized non-zero exits
//! are treated conservatively as retryable up to the budget.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Whether a recognized failure is worth retrying automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Transient (network-class); auto-requeued while budget remains
    Retryable,
    /// Content/environment fault; retrying is futile
    Permanent,
}

/// One known error signature: a case-insensitive substring and the
/// human-readable title recorded on the task when it matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSignature {
    pub needle: String,
    pub kind: FailureKind,
    pub title: String,
}

impl ErrorSignature {
    pub fn new(needle: &str, kind: FailureKind, title: &str) -> Self {
        Self {
            needle: needle.to_string(),
            kind,
            title: title.to_string(),
        }
    }

    fn matches(&self, haystack_lower: &str) -> bool {
        haystack_lower.contains(&self.needle.to_lowercase())
    }
}

/// Classification result attached to a failed run.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureClass {
    pub kind: FailureKind,
    /// Human-readable "why" for the UI
    pub message: String,
}

/// Built-in signature table for yt-dlp-style output.
pub fn default_signatures() -> Vec<ErrorSignature> {
    use FailureKind::*;
    vec![
        // Permanent: authentication / availability / environment
        ErrorSignature::new(
            "Sign in to confirm",
            Permanent,
            "Authentication required (missing or expired cookies)",
        ),
        ErrorSignature::new(
            "This video is only available to registered users",
            Permanent,
            "Authentication required (missing or expired cookies)",
        ),
        ErrorSignature::new("Private video", Permanent, "Private video"),
        ErrorSignature::new("Video unavailable", Permanent, "Video unavailable"),
        ErrorSignature::new("Members only", Permanent, "Members-only content"),
        ErrorSignature::new("Geo-restricted", Permanent, "Region-restricted content"),
        ErrorSignature::new(
            "unavailable in your country",
            Permanent,
            "Region-restricted content",
        ),
        ErrorSignature::new(
            "Requested format is not available",
            Permanent,
            "Requested format is not available",
        ),
        ErrorSignature::new(
            "ffprobe/ffmpeg not found",
            Permanent,
            "FFmpeg is missing",
        ),
        ErrorSignature::new("ffmpeg isn't installed", Permanent, "FFmpeg is missing"),
        ErrorSignature::new(
            "No space left on device",
            Permanent,
            "Disk full in the output directory",
        ),
        ErrorSignature::new("HTTP Error 401", Permanent, "Access denied (HTTP 401)"),
        ErrorSignature::new("HTTP Error 403", Permanent, "Access denied (HTTP 403)"),
        ErrorSignature::new("HTTP Error 404", Permanent, "Content not found (HTTP 404)"),
        // Retryable: network-class faults
        ErrorSignature::new(
            "Connection reset by peer",
            Retryable,
            "Network connection reset",
        ),
        ErrorSignature::new("Connection refused", Retryable, "Connection refused"),
        ErrorSignature::new("timed out", Retryable, "Network timeout"),
        ErrorSignature::new("Timeout", Retryable, "Network timeout"),
        ErrorSignature::new(
            "Temporary failure in name resolution",
            Retryable,
            "DNS resolution failed",
        ),
        ErrorSignature::new(
            "EOF occurred in violation of protocol",
            Retryable,
            "TLS connection dropped",
        ),
        ErrorSignature::new("SSLError", Retryable, "TLS connection dropped"),
        ErrorSignature::new("HTTP Error 500", Retryable, "Server error (HTTP 500)"),
        ErrorSignature::new("HTTP Error 502", Retryable, "Server error (HTTP 502)"),
        ErrorSignature::new("HTTP Error 503", Retryable, "Server error (HTTP 503)"),
    ]
}

// ERROR: <message> — used to derive a message for unrecognized failures
static RE_ERROR_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^.*?ERROR:\s*(?P<msg>.+?)\s*$").expect("error-line regex"));

/// Classify a failed run from its output tail and exit code.
///
/// Returns the first matching signature in table order; otherwise an
/// unclassified (retryable) failure whose message is extracted from the
/// last `ERROR:` line, falling back to the exit code.
pub fn classify(tail: &str, exit_code: Option<i32>, signatures: &[ErrorSignature]) -> FailureClass {
    let haystack = tail.to_lowercase();
    for sig in signatures {
        if sig.matches(&haystack) {
            return FailureClass {
                kind: sig.kind,
                message: sig.title.clone(),
            };
        }
    }

    let message = RE_ERROR_LINE
        .captures_iter(tail)
        .last()
        .map(|c| truncate(c["msg"].trim(), 160))
        .unwrap_or_else(|| match exit_code {
            Some(code) => format!("downloader exited with status {}", code),
            None => "downloader terminated by signal".to_string(),
        });

    FailureClass {
        kind: FailureKind::Retryable,
        message,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
