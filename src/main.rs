// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use fetchq::{
    recover_and_resume, Config, Scheduler, TaskEvent, TaskOptions, TaskRecord, TaskStatus,
    TaskStore, YtDlpInvocation,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often the run loop checks whether the queue has drained
const DRAIN_CHECK: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "fetchq")]
#[command(version = VERSION)]
#[command(about = "Queue, schedule and supervise yt-dlp download jobs. Survives restarts.")]
#[command(long_about = "fetchq - durable download queue\n\n\
    Add a download:      fetchq add \"https://example.com/watch?v=...\"\n\
    Process the queue:   fetchq run\n\
    See what's queued:   fetchq list")]
struct Cli {
    /// Task file path (default: ~/.fetchq/tasks.json)
    #[arg(long, global = true)]
    tasks_file: Option<PathBuf>,

    /// Config file path (default: ~/.fetchq/config.json)
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a download to the queue
    ///
    /// Examples:
    ///   fetchq add "https://example.com/watch?v=abc"
    ///   fetchq add "https://example.com/watch?v=abc" -f "bv*+ba/b" --dir ~/Videos
    Add {
        /// Source URL
        url: String,
        /// Output directory (default: configured output_dir)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Format selector passed to the downloader
        #[arg(short, long)]
        format: Option<String>,
        /// Output filename template
        #[arg(short, long)]
        output: Option<String>,
        /// Cookies file for authenticated downloads
        #[arg(long)]
        cookies: Option<PathBuf>,
        /// Bandwidth cap, e.g. "2M"
        #[arg(long)]
        limit_rate: Option<String>,
        /// Extra arguments appended to the downloader invocation verbatim
        #[arg(long = "arg", value_name = "ARG")]
        extra_args: Vec<String>,
    },

    /// List tasks and their statuses
    List {
        /// Only show tasks with this status (queued, running, paused,
        /// completed, failed, cancelled)
        #[arg(long)]
        status: Option<String>,
    },

    /// Process the queue until it drains or Ctrl-C
    ///
    /// Work interrupted in a previous session is recovered as paused; it is
    /// resumed only with --all or the auto_resume_on_launch setting.
    Run {
        /// Resume all paused tasks, including recovered ones
        #[arg(long)]
        all: bool,
        /// Override the configured concurrency bound for this session
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },

    /// Pause a queued task (running tasks are paused by Ctrl-C during run)
    Pause { id: String },

    /// Mark a paused or failed task ready to run again
    Resume { id: String },

    /// Cancel a task; partial output stays on disk
    Cancel { id: String },

    /// Remove a task's record entirely
    Delete { id: String },

    /// Retry a failed task with a fresh retry budget
    Retry { id: String },

    /// Retry every failed task
    RetryFailed,

    /// Remove all completed task records
    ClearCompleted,

    /// Set the concurrency bound in the config file
    SetConcurrency { n: usize },

    /// Show a one-line status summary
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fetchq=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config_file.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    let tasks_path = cli.tasks_file.clone().unwrap_or_else(TaskStore::default_path);
    let store = Arc::new(TaskStore::open(&tasks_path)?);

    match cli.command {
        Commands::Add {
            url,
            dir,
            format,
            output,
            cookies,
            limit_rate,
            extra_args,
        } => {
            let mut options = TaskOptions::new();
            options.format = format;
            options.output_template = output;
            options.cookies_file = cookies;
            options.rate_limit = limit_rate;
            options.extra_args = extra_args;

            let output_dir = dir.unwrap_or_else(|| config.output_dir.clone());
            let mut record = TaskRecord::new(url, output_dir).with_options(options);
            record.max_retries = config.max_retries;
            let id = store.create(record).context("Failed to add task")?;
            println!("{} added task {}", "[OK]".green(), id.bold());
        }

        Commands::List { status } => {
            let filter = match status.as_deref() {
                Some(s) => Some(parse_status(s)?),
                None => None,
            };
            let tasks: Vec<TaskRecord> = match filter {
                Some(status) => store.by_status(status),
                None => store.load_all(),
            };
            if tasks.is_empty() {
                println!("No tasks.");
                return Ok(());
            }
            println!(
                "{:<10} {:<11} {:>6}  {}",
                "ID".bold(),
                "STATUS".bold(),
                "PROG".bold(),
                "SOURCE".bold()
            );
            for task in &tasks {
                println!(
                    "{:<10} {:<11} {:>5.1}%  {}",
                    task.id,
                    colorize_status(task.status),
                    task.progress,
                    task.source
                );
                if let Some(error) = &task.error {
                    println!("{:<10} {}", "", format!("error: {}", error).red());
                }
            }
        }

        Commands::Run { all, concurrency } => {
            let mut config = config;
            if let Some(n) = concurrency {
                config.max_concurrent = n.max(1);
            }
            run_queue(store, &config, all).await?;
        }

        Commands::Pause { id } => {
            let current = store
                .get(&id)
                .with_context(|| format!("task `{}` not found", id))?;
            if current.status.is_terminal() {
                anyhow::bail!("task `{}` is already {}", id, current.status.as_str());
            }
            let record = store.update(&id, |t| t.mark_paused())?;
            println!("{} paused {}", "[OK]".green(), record.id);
        }

        Commands::Resume { id } => {
            let current = store
                .get(&id)
                .with_context(|| format!("task `{}` not found", id))?;
            if !matches!(current.status, TaskStatus::Paused | TaskStatus::Failed) {
                anyhow::bail!("task `{}` is {}, not paused", id, current.status.as_str());
            }
            let record = store.update(&id, |t| t.set_status(TaskStatus::Queued))?;
            println!(
                "{} {} will run on the next `fetchq run`",
                "[OK]".green(),
                record.id
            );
        }

        Commands::Cancel { id } => {
            let current = store
                .get(&id)
                .with_context(|| format!("task `{}` not found", id))?;
            if current.status.is_terminal() {
                anyhow::bail!("task `{}` is already {}", id, current.status.as_str());
            }
            store.update(&id, |t| t.mark_cancelled())?;
            println!("{} cancelled {}", "[OK]".green(), id);
        }

        Commands::Delete { id } => {
            let removed = store.remove(&id)?;
            println!("{} deleted {} ({})", "[OK]".green(), removed.id, removed.source);
        }

        Commands::Retry { id } => {
            let current = store
                .get(&id)
                .with_context(|| format!("task `{}` not found", id))?;
            if current.status != TaskStatus::Failed {
                anyhow::bail!("task `{}` is {}, not failed", id, current.status.as_str());
            }
            store.update(&id, |t| {
                t.retry_count = 0;
                t.error = None;
                t.reset_for_retry();
            })?;
            println!("{} {} requeued", "[OK]".green(), id);
        }

        Commands::RetryFailed => {
            let failed = store.by_status(TaskStatus::Failed);
            for task in &failed {
                store.update(&task.id, |t| {
                    t.retry_count = 0;
                    t.error = None;
                    t.reset_for_retry();
                })?;
            }
            println!("{} requeued {} failed task(s)", "[OK]".green(), failed.len());
        }

        Commands::ClearCompleted => {
            let cleared = store.clear_completed()?;
            println!("{} cleared {} completed task(s)", "[OK]".green(), cleared);
        }

        Commands::SetConcurrency { n } => {
            let mut config = config;
            config.max_concurrent = n.max(1);
            config.save(&config_path)?;
            println!(
                "{} max_concurrent set to {}",
                "[OK]".green(),
                config.max_concurrent
            );
        }

        Commands::Status => {
            let counts = store.status_counts();
            let part = |s: TaskStatus| counts.get(&s).copied().unwrap_or(0);
            println!(
                "{} queued, {} running, {} paused, {} completed, {} failed, {} cancelled",
                part(TaskStatus::Queued),
                part(TaskStatus::Running),
                part(TaskStatus::Paused),
                part(TaskStatus::Completed),
                part(TaskStatus::Failed),
                part(TaskStatus::Cancelled)
            );
        }
    }

    Ok(())
}

/// Drive the scheduler until the queue drains or the user interrupts.
async fn run_queue(store: Arc<TaskStore>, config: &Config, resume_all: bool) -> Result<()> {
    let (events_tx, mut events_rx) = fetchq::events::channel();
    let invocation = Arc::new(YtDlpInvocation::new(&config.downloader_program));
    let scheduler = Scheduler::new(Arc::clone(&store), invocation, config, events_tx);

    // Interrupted work is recovered as paused; it re-enters admission only
    // with --all or the auto-resume setting.
    let auto_resume = resume_all || config.auto_resume_on_launch;
    let demoted = recover_and_resume(&scheduler, auto_resume)?;
    if !auto_resume && !demoted.is_empty() {
        println!(
            "{} {} interrupted task(s) recovered as paused; resume with `fetchq run --all`",
            "[!]".yellow(),
            demoted.len()
        );
    }
    if scheduler.active_count() == 0 && scheduler.queued_count() == 0 {
        println!("Nothing to do.");
        return Ok(());
    }
    println!(
        "Processing {} task(s), {} at a time. Ctrl-C pauses.",
        scheduler.active_count() + scheduler.queued_count(),
        config.max_concurrent
    );

    let mut last_printed_percent: HashMap<String, u32> = HashMap::new();
    let mut interval = tokio::time::interval(DRAIN_CHECK);
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Ok(event) => print_event(&store, &event, &mut last_printed_percent),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("event stream lagged by {}", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\n{} pausing running downloads...", "[!]".yellow());
                let drained = scheduler
                    .shutdown(config.cancel_grace() + Duration::from_secs(2))
                    .await;
                if !drained {
                    eprintln!("{} some workers had to be killed", "[!]".yellow());
                }
                break;
            }
            _ = interval.tick() => {
                if scheduler.active_count() == 0 && scheduler.queued_count() == 0 {
                    break;
                }
            }
        }
    }

    let counts = store.status_counts();
    let part = |s: TaskStatus| counts.get(&s).copied().unwrap_or(0);
    println!(
        "Done: {} completed, {} failed, {} paused.",
        part(TaskStatus::Completed).to_string().green(),
        part(TaskStatus::Failed).to_string().red(),
        part(TaskStatus::Paused)
    );
    Ok(())
}

fn print_event(
    store: &TaskStore,
    event: &TaskEvent,
    last_printed: &mut HashMap<String, u32>,
) {
    match event {
        TaskEvent::StatusChanged { id, status } => {
            let source = store
                .get(id)
                .map(|t| t.source)
                .unwrap_or_else(|| "?".into());
            println!("{} {} {}", id.bold(), colorize_status(*status), source.dimmed());
            if status.is_terminal() {
                if let Some(task) = store.get(id) {
                    if let Some(error) = task.error {
                        println!("{} {}", id.bold(), format!("error: {}", error).red());
                    }
                }
                last_printed.remove(id);
            }
        }
        TaskEvent::ProgressUpdated {
            id,
            percent,
            speed_bps,
            eta_seconds,
        } => {
            // Print at 10% steps; per-line updates would flood the terminal.
            let bucket = (*percent / 10.0) as u32;
            let seen = last_printed.entry(id.clone()).or_insert(0);
            if bucket > *seen {
                *seen = bucket;
                println!(
                    "{} {:>5.1}% {} {}",
                    id.bold(),
                    percent,
                    format_speed(*speed_bps).cyan(),
                    format_eta(*eta_seconds).dimmed()
                );
            }
        }
        TaskEvent::MessageLogged { id, message } => {
            println!("{} {}", id.bold(), message.dimmed());
        }
    }
}

fn colorize_status(status: TaskStatus) -> colored::ColoredString {
    match status {
        TaskStatus::Queued => status.as_str().white(),
        TaskStatus::Running => status.as_str().cyan(),
        TaskStatus::Paused => status.as_str().yellow(),
        TaskStatus::Completed => status.as_str().green(),
        TaskStatus::Failed => status.as_str().red(),
        TaskStatus::Cancelled => status.as_str().dimmed(),
    }
}

fn parse_status(s: &str) -> Result<TaskStatus> {
    match s {
        "queued" => Ok(TaskStatus::Queued),
        "running" => Ok(TaskStatus::Running),
        "paused" => Ok(TaskStatus::Paused),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        "cancelled" => Ok(TaskStatus::Cancelled),
        other => anyhow::bail!("unknown status `{}`", other),
    }
}

fn format_speed(speed_bps: Option<u64>) -> String {
    match speed_bps {
        Some(bps) if bps >= 1_048_576 => format!("{:.1} MiB/s", bps as f64 / 1_048_576.0),
        Some(bps) if bps >= 1_024 => format!("{:.1} KiB/s", bps as f64 / 1_024.0),
        Some(bps) => format!("{} B/s", bps),
        None => "-".into(),
    }
}

fn format_eta(eta_seconds: Option<u64>) -> String {
    match eta_seconds {
        Some(s) if s >= 3_600 => format!("ETA {}:{:02}:{:02}", s / 3_600, (s % 3_600) / 60, s % 60),
        Some(s) => format!("ETA {}:{:02}", s / 60, s % 60),
        None => String::new(),
    }
}
