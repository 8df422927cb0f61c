// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Line parser for child-process output.
//!
//! Turns the interleaved text output of the extraction tool into structured
//! progress and status data. Two progress sources are understood:
//!
//! - the machine-readable template line this crate asks for
//!   (`FETCHQ|download|downloaded|total|speed|eta|...`), and
//! - the classic human-readable form
//!   (`[download]  95.0% of ~15.30MiB at 2.50MiB/s ETA 00:03`).
//!
//! An unparsable line is never an error; it comes back as
//! [`ParsedLine::Unknown`] and the worker ignores it.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;

/// Prefix of the structured progress-template lines requested via
/// `--progress-template`.
pub const PROGRESS_PREFIX: &str = "FETCHQ|";

/// Normalized download progress extracted from one output line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    /// Transfer rate in bytes per second
    pub speed_bps: Option<u64>,
    /// Estimated time remaining in seconds
    pub eta_seconds: Option<u64>,
    /// 0-100 if derivable
    pub percent: Option<f64>,
    pub filename: Option<String>,
}

/// Result of parsing a single output line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// Download progress
    Progress(ProgressUpdate),
    /// Output destination announced by the tool
    Destination(PathBuf),
    /// Final merged/extracted output path
    Merge(PathBuf),
    /// Post-processing stage notification
    PostProcess { name: String, message: String },
    /// Informative status text worth surfacing to the UI
    Status(String),
    /// Anything else; ignored by the worker
    Unknown,
}

// [download] 95.0% of ~15.30MiB at 2.50MiB/s ETA 00:03
static RE_PROGRESS_FULL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\[download\]\s+(?P<pct>\d+(?:\.\d+)?)%\s+of\s+~?(?P<total>[\d.]+)(?P<tunit>[KMGTPE]i?B)\s+at\s+(?P<speed>[\d.]+)(?P<sunit>[KMGTPE]i?B)/s\s+ETA\s+(?P<eta>\d{1,2}:\d{2}(?::\d{2})?)",
    )
    .expect("progress regex")
});

// [download] 15.30MiB at 2.50MiB/s ETA 00:03 (total unknown)
static RE_PROGRESS_PARTIAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\[download\]\s+(?P<done>[\d.]+)(?P<unit>[KMGTPE]i?B)\s+at\s+(?P<speed>[\d.]+)(?P<sunit>[KMGTPE]i?B)/s\s+ETA\s+(?P<eta>\d{1,2}:\d{2}(?::\d{2})?)",
    )
    .expect("partial progress regex")
});

// [download] Destination: path/to/file.mp4
static RE_DEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[download\]\s+Destination:\s+(?P<path>.+)$").expect("dest regex"));

// [Merger] Merging formats into "path/to/file.mp4"
static RE_MERGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\[Merger\]\s+Merging formats into\s+"?(?P<path>[^"]+)"?$"#).expect("merge regex")
});

// [ExtractAudio] Destination: path/to/file.mp3
static RE_EXTRACT_AUDIO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[ExtractAudio\]\s+Destination:\s+(?P<path>.+)$").expect("extract regex")
});

/// Parse one output line.
pub fn parse_line(line: &str) -> ParsedLine {
    let line = line.trim_end();
    if line.is_empty() {
        return ParsedLine::Unknown;
    }

    if let Some(rest) = line.strip_prefix(PROGRESS_PREFIX) {
        return parse_structured(rest);
    }

    if line.contains("Writing video subtitles to:") {
        let path = line.splitn(2, ':').nth(1).map(str::trim).unwrap_or("");
        if !path.is_empty() {
            return ParsedLine::Destination(PathBuf::from(path));
        }
        return ParsedLine::Status(line.to_string());
    }

    if line.starts_with("[Merger]") || line.starts_with("[ExtractAudio]") {
        if let Some(caps) = RE_MERGE.captures(line) {
            return ParsedLine::Merge(PathBuf::from(caps["path"].trim()));
        }
        if let Some(caps) = RE_EXTRACT_AUDIO.captures(line) {
            return ParsedLine::Merge(PathBuf::from(caps["path"].trim()));
        }
        return ParsedLine::Status(line.to_string());
    }

    if let Some(caps) = RE_DEST.captures(line) {
        return ParsedLine::Destination(PathBuf::from(caps["path"].trim()));
    }

    if line.starts_with("[download]") {
        return parse_download_line(line);
    }

    ParsedLine::Unknown
}

/// `FETCHQ|download|downloaded|total|speed|eta|vcodec|acodec|ext|filename`
/// or `FETCHQ|postprocess|status|postprocessor`
fn parse_structured(rest: &str) -> ParsedLine {
    let parts: Vec<&str> = rest.split('|').collect();

    match parts.first().copied() {
        Some("download") if parts.len() >= 2 => {
            let field = |i: usize| parts.get(i).copied().unwrap_or("");
            let downloaded = parse_num(field(1));
            let total = parse_num(field(2));
            let speed = parse_num(field(3));
            let eta = parse_eta(field(4));
            let filename = match field(8) {
                "" | "NA" => None,
                f => Some(f.to_string()),
            };
            let percent = match total {
                Some(t) if t > 0 => downloaded.map(|d| (d as f64 / t as f64) * 100.0),
                _ => None,
            };
            ParsedLine::Progress(ProgressUpdate {
                downloaded_bytes: downloaded.unwrap_or(0),
                total_bytes: total.filter(|t| *t > 0),
                speed_bps: speed.filter(|s| *s > 0),
                eta_seconds: eta,
                percent,
                filename,
            })
        }
        Some("postprocess") if parts.len() >= 2 => {
            let stage = parts.get(1).copied().unwrap_or("");
            let name = parts.get(2).copied().unwrap_or("");
            let message = if name.is_empty() {
                "post-processing".to_string()
            } else if stage.is_empty() {
                format!("post-processing: {}", name)
            } else {
                format!("post-processing: {} ({})", name, stage)
            };
            ParsedLine::PostProcess {
                name: name.to_string(),
                message,
            }
        }
        _ => ParsedLine::Unknown,
    }
}

fn parse_download_line(line: &str) -> ParsedLine {
    if let Some(caps) = RE_PROGRESS_FULL.captures(line) {
        let pct: f64 = caps["pct"].parse().unwrap_or(0.0);
        let total = size_to_bytes(&caps["total"], &caps["tunit"]);
        let speed = size_to_bytes(&caps["speed"], &caps["sunit"]);
        let eta = parse_eta_hms(&caps["eta"]);
        let downloaded = if total > 0 {
            (total as f64 * pct / 100.0) as u64
        } else {
            0
        };
        return ParsedLine::Progress(ProgressUpdate {
            downloaded_bytes: downloaded,
            total_bytes: (total > 0).then_some(total),
            speed_bps: (speed > 0).then_some(speed),
            eta_seconds: eta,
            percent: Some(pct),
            filename: None,
        });
    }

    if let Some(caps) = RE_PROGRESS_PARTIAL.captures(line) {
        let downloaded = size_to_bytes(&caps["done"], &caps["unit"]);
        let speed = size_to_bytes(&caps["speed"], &caps["sunit"]);
        let eta = parse_eta_hms(&caps["eta"]);
        return ParsedLine::Progress(ProgressUpdate {
            downloaded_bytes: downloaded,
            total_bytes: None,
            speed_bps: (speed > 0).then_some(speed),
            eta_seconds: eta,
            percent: None,
            filename: None,
        });
    }

    ParsedLine::Status(line.to_string())
}

/// "15.3" + "MiB" -> bytes. Decimal units (KB/MB) occur in some contexts.
fn size_to_bytes(value: &str, unit: &str) -> u64 {
    let n: f64 = match value.parse() {
        Ok(n) => n,
        Err(_) => return 0,
    };
    let scale: u64 = match unit.to_ascii_uppercase().as_str() {
        "B" => 1,
        "KIB" => 1 << 10,
        "MIB" => 1 << 20,
        "GIB" => 1 << 30,
        "TIB" => 1u64 << 40,
        "PIB" => 1u64 << 50,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "TB" => 1_000_000_000_000,
        _ => 0,
    };
    (n * scale as f64) as u64
}

/// Numeric field of a structured line; "NA" and empty are absent.
fn parse_num(s: &str) -> Option<u64> {
    if s.is_empty() || s == "NA" {
        return None;
    }
    s.parse::<f64>().ok().map(|n| n as u64)
}

/// ETA field of a structured line: plain seconds or HH:MM:SS.
fn parse_eta(s: &str) -> Option<u64> {
    if s.is_empty() || s == "NA" {
        return None;
    }
    if s.contains(':') {
        return parse_eta_hms(s);
    }
    s.parse::<f64>().ok().map(|n| n as u64)
}

/// "HH:MM:SS" or "MM:SS" -> seconds.
fn parse_eta_hms(eta: &str) -> Option<u64> {
    let parts: Vec<u64> = eta
        .split(':')
        .map(|p| p.parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;
    match parts.as_slice() {
        [h, m, s] => Some(h * 3600 + m * 60 + s),
        [m, s] => Some(m * 60 + s),
        [s] => Some(*s),
        _ => None,
    }
}
