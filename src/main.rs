//! CLI entry point for the ZDAB L2 processor.
//!
//! Reads one ZDAB file, writes time-sliced L2 chunks and burst files named after the
//! output base, and prints the configuration record and a closing summary on stdout.
//!
//! # Usage
//! ```bash
//! zdab-l2 -i run_12345.zdab -o /data/l2/run_12345 -c l2.cfg -s run.toml -r
//! ```
//!
//! Send SIGUSR1 to hold closed chunks before they are archived and SIGUSR2 to release
//! them.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zdab_l2::chunk::PauseFlag;
use zdab_l2::config::{FilterConfig, RunSettings};
use zdab_l2::logging;
use zdab_l2::notify::{AlertEndpoint, HttpAlertSink, LogOnlySink, RateLimitedNotifier, Severity, SharedNotifier};
use zdab_l2::pipeline::Processor;
use zdab_l2::stats::TimeSeriesStats;
use zdab_l2::zdab::{ZdabFileFactory, ZdabReader};

#[derive(Parser)]
#[command(name = "zdab-l2")]
#[command(about = "Online L2 filter, chunker and burst archiver for ZDAB files", long_about = None)]
struct Cli {
    /// Input ZDAB file
    #[arg(short, long)]
    input: PathBuf,

    /// Output base name; chunks are written as <output>_NNNNNN.zdab
    #[arg(short, long)]
    output: PathBuf,

    /// Filter configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Run settings (TOML)
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Do not overwrite existing output
    #[arg(short = 'n', long)]
    no_clobber: bool,

    /// Write per-second statistics
    #[arg(short = 'r', long)]
    stats: bool,

    /// Password for the monitoring endpoint
    #[arg(long, env = "ZDAB_L2_ALERT_PASSWORD", hide_env_values = true)]
    alert_password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = RunSettings::load(cli.settings.as_deref()).context("loading run settings")?;
    settings.validate()?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    let filter = FilterConfig::load(&cli.config)
        .with_context(|| format!("reading filter configuration {}", cli.config.display()))?;
    let run_name = cli
        .output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    println!("{}", filter.to_record(&run_name));
    info!("Wrote configuration.");

    let (notifier, alert_task) = build_notifier(&settings, cli.alert_password.clone());

    let mut reader = match ZdabReader::open(&cli.input) {
        Ok(reader) => reader,
        Err(e) => {
            notifier.notify(Severity::Error, &format!("Aborting: {}", e));
            drain_alerts(notifier, alert_task).await;
            return Err(e.into());
        }
    };

    let factory = ZdabFileFactory {
        clobber: !cli.no_clobber,
    };
    let mut processor = Processor::new(factory, cli.output.clone(), filter, &settings, notifier.clone());
    if cli.stats {
        let path = settings
            .stats
            .path
            .clone()
            .unwrap_or_else(|| stats_path(&cli.output));
        let sink = TimeSeriesStats::with_file(&path)
            .with_context(|| format!("opening statistics file {}", path.display()))?;
        processor = processor.with_stats(Box::new(sink));
    }
    let signals = spawn_pause_listener(processor.pause_flag())?;

    let outcome = tokio::task::spawn_blocking(move || processor.run(&mut reader)).await?;
    if let Some(handle) = signals {
        handle.abort();
    }

    match outcome {
        Ok(summary) => {
            println!("{}", summary);
            drain_alerts(notifier, alert_task).await;
            Ok(())
        }
        Err(e) => {
            notifier.notify(Severity::Error, &format!("Aborting: {}", e));
            drain_alerts(notifier, alert_task).await;
            Err(e.into())
        }
    }
}

fn build_notifier(settings: &RunSettings, password: Option<String>) -> (SharedNotifier, Option<JoinHandle<()>>) {
    let alerts = &settings.alerts;
    match &alerts.url {
        Some(url) => {
            let endpoint = AlertEndpoint {
                url: url.clone(),
                client_name: alerts.client_name.clone(),
                user: alerts.user.clone(),
                password,
            };
            let (sink, handle) = HttpAlertSink::spawn(endpoint, alerts.queue_depth);
            let notifier: SharedNotifier = Arc::new(RateLimitedNotifier::new(sink, alerts.budget_per_second));
            notifier.notify(Severity::Info, "Connected to monitoring endpoint");
            (notifier, Some(handle))
        }
        None => (
            Arc::new(RateLimitedNotifier::new(LogOnlySink, alerts.budget_per_second)),
            None,
        ),
    }
}

/// Wait briefly for queued alerts to go out once every notifier handle is gone.
async fn drain_alerts(notifier: SharedNotifier, task: Option<JoinHandle<()>>) {
    drop(notifier);
    if let Some(task) = task {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("gave up waiting for queued alerts");
        }
    }
}

fn stats_path(output: &std::path::Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".stats.jsonl");
    PathBuf::from(name)
}

#[cfg(unix)]
fn spawn_pause_listener(flag: PauseFlag) -> std::io::Result<Option<JoinHandle<()>>> {
    use std::sync::atomic::Ordering;
    use tokio::signal::unix::{signal, SignalKind};

    let mut pause = signal(SignalKind::user_defined1())?;
    let mut resume = signal(SignalKind::user_defined2())?;
    Ok(Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = pause.recv() => {
                    flag.store(true, Ordering::SeqCst);
                    info!("SIGUSR1 received, holding closed chunks");
                }
                Some(()) = resume.recv() => {
                    flag.store(false, Ordering::SeqCst);
                    info!("SIGUSR2 received, resuming archival");
                }
                else => break,
            }
        }
    })))
}

#[cfg(not(unix))]
fn spawn_pause_listener(_flag: PauseFlag) -> std::io::Result<Option<JoinHandle<()>>> {
    Ok(None)
}
