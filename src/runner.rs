//! High-level runner API for the bulk sender.
//!
//! This module provides a simplified public interface that encapsulates wiring
//! the recipient store, template, persisted state, sender and dispatch engine.
//!
//! This is the primary API for external users and for the CLI.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::channels::ChannelConfig;
use crate::dispatch::{
    BatchReport, Checkpoint, Classification, CorruptStatePolicy, DispatchConfigBuilder,
    DispatchEngine, LocalStateStorage, RunLog, Sender, StateStorage,
};
use crate::recipients::{DelimitedConfig, RecipientStore, normalize_phone};
use crate::telemetry::{ProgressStats, TelemetryEvent};
use crate::template::MessageTemplate;

/// Arguments for a send run
#[derive(Debug, Clone)]
pub struct SendArgs {
    // Source configuration
    pub source: PathBuf,
    pub delimited: DelimitedConfig,
    pub phone_column: String,
    pub template: PathBuf,

    // State
    pub state_dir: PathBuf,
    /// Clear the checkpoint before starting (the run log is kept)
    pub restart: bool,
    pub strict_state: bool,

    // Dispatch tuning
    pub batch_size: usize,
    pub attachment: Option<PathBuf>,
    pub send_timeout: Duration,
    pub send_interval: Duration,

    pub channel: ChannelConfig,
    pub quiet: bool,
}

impl SendArgs {
    fn corrupt_state_policy(&self) -> CorruptStatePolicy {
        if self.strict_state {
            CorruptStatePolicy::Fail
        } else {
            CorruptStatePolicy::Recover
        }
    }
}

/// Result of a completed send run
#[derive(Debug)]
pub struct SendResult {
    pub run_id: String,
    pub report: BatchReport,
    /// Run log totals across every run against this state directory
    pub totals: StateSummary,
}

/// Snapshot of the persisted state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSummary {
    pub successful: usize,
    pub failed: usize,
    pub duplicates: usize,
    /// -1 when no resume is pending
    pub last_processed: i64,
}

impl StateSummary {
    fn from_state(run_log: &RunLog, checkpoint: &Checkpoint) -> Self {
        let entries = run_log.entries();
        Self {
            successful: entries.successful.len(),
            failed: entries.failed.len(),
            duplicates: entries.duplicates.len(),
            last_processed: checkpoint.current(),
        }
    }

    pub fn has_pending_checkpoint(&self) -> bool {
        self.last_processed >= 0
    }
}

/// Run one batch using the sender configured in `args.channel`
///
/// The batch stops early when `shutdown` turns true; state is flushed and the
/// sender session closed in every case.
pub async fn run_send(args: SendArgs, shutdown: watch::Receiver<bool>) -> Result<SendResult> {
    let sender = args
        .channel
        .create_sender()
        .context("Failed to set up message channel")?;
    run_send_with_sender(args, sender, shutdown).await
}

/// Run one batch with an already-constructed sender
pub async fn run_send_with_sender(
    args: SendArgs,
    sender: Arc<dyn Sender>,
    shutdown: watch::Receiver<bool>,
) -> Result<SendResult> {
    let result = dispatch(&args, Arc::clone(&sender), shutdown).await;

    if let Err(e) = sender.close().await {
        warn!("Failed to close {} session: {:#}", sender.name(), e);
    }

    result
}

async fn dispatch(
    args: &SendArgs,
    sender: Arc<dyn Sender>,
    shutdown: watch::Receiver<bool>,
) -> Result<SendResult> {
    let run_id = Uuid::new_v4().to_string();
    info!("Starting send run: {}", run_id);

    let store = RecipientStore::load(&args.source, &args.delimited, &args.phone_column).await?;
    let template = MessageTemplate::load(&args.template).await?;

    let storage: Arc<dyn StateStorage> = Arc::new(LocalStateStorage::new(args.state_dir.clone()));
    let policy = args.corrupt_state_policy();
    let run_log = RunLog::load(Arc::clone(&storage), policy).await?;
    let mut checkpoint = Checkpoint::load(Arc::clone(&storage), policy).await?;

    if args.restart && checkpoint.current() >= 0 {
        info!(
            "Restarting from the first recipient (discarding checkpoint {})",
            checkpoint.current()
        );
        checkpoint.clear().await?;
    } else if checkpoint.current() >= 0 {
        info!("Resuming after recipient {}", checkpoint.current());
    }

    let config = DispatchConfigBuilder::default()
        .batch_size(args.batch_size)
        .attachment(args.attachment.clone())
        .send_timeout(args.send_timeout)
        .send_interval(args.send_interval)
        .build()?;

    let engine = DispatchEngine::new(store, template, sender, run_log, checkpoint, config)?
        .with_shutdown(shutdown);

    let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
    let mut engine = engine.with_telemetry(telemetry_tx);
    let prog_jh = setup_progress_tracking(args.quiet, telemetry_rx);

    let result = engine.run_batch().await;

    // Dropping the engine closes the telemetry channel and ends the progress task
    let totals = StateSummary::from_state(engine.run_log(), engine.checkpoint());
    drop(engine);
    finish_progress(prog_jh).await;

    Ok(SendResult {
        run_id,
        report: result?,
        totals,
    })
}

/// Setup a progress bar over the batch window
fn setup_progress_tracking(
    quiet: bool,
    mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
) -> Option<tokio::task::JoinHandle<()>> {
    if quiet {
        return None;
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template(
                "[{elapsed_precise}] Sending: [{bar:30.cyan/blue}] {pos}/{len} ({percent}%) | {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );

    Some(tokio::spawn(async move {
        let mut stats = ProgressStats::new();

        while let Some(event) = telemetry_rx.recv().await {
            stats.update(&event);

            bar.set_length(stats.window_size as u64);
            bar.set_position(stats.processed as u64);

            let latency = match stats.get_percentiles() {
                (Some(p50), Some(p90)) => format!(" | p50: {}ms, p90: {}ms", p50, p90),
                _ => String::new(),
            };
            bar.set_message(format!(
                "sent {} failed {} skipped {}{}",
                stats.sent, stats.failed, stats.duplicates, latency
            ));
        }

        bar.finish();
    }))
}

/// Wait for the progress display to drain. Its failure never fails the run.
async fn finish_progress(prog_jh: Option<tokio::task::JoinHandle<()>>) {
    if let Some(jh) = prog_jh
        && let Err(e) = jh.await
    {
        warn!("Progress display task failed: {}", e);
    }
}

/// Read the persisted state without modifying it
///
/// Corrupt files are reported as errors here rather than moved aside.
pub async fn inspect_state(state_dir: PathBuf) -> Result<StateSummary> {
    let storage: Arc<dyn StateStorage> = Arc::new(LocalStateStorage::new(state_dir));
    let run_log = RunLog::load(Arc::clone(&storage), CorruptStatePolicy::Fail).await?;
    let checkpoint = Checkpoint::load(storage, CorruptStatePolicy::Fail).await?;
    Ok(StateSummary::from_state(&run_log, &checkpoint))
}

/// Clear the checkpoint, and the run log too when `clear_log` is set
pub async fn reset_state(state_dir: PathBuf, clear_log: bool) -> Result<()> {
    let storage: Arc<dyn StateStorage> = Arc::new(LocalStateStorage::new(state_dir));

    let mut checkpoint = Checkpoint::load(Arc::clone(&storage), CorruptStatePolicy::Recover).await?;
    checkpoint.clear().await?;
    info!("Checkpoint cleared");

    if clear_log {
        let mut run_log = RunLog::load(storage, CorruptStatePolicy::Recover).await?;
        run_log.clear().await?;
        info!("Run log cleared");
    }

    Ok(())
}

/// Remove one recipient from the run log so the next run attempts it again
///
/// `phone` is normalized the same way as the recipient source. Returns the
/// normalized identity and the classification it had.
pub async fn forget_recipient(state_dir: PathBuf, phone: &str) -> Result<(String, Classification)> {
    let identity = normalize_phone(phone);
    anyhow::ensure!(!identity.is_empty(), "'{}' contains no digits", phone);

    let storage: Arc<dyn StateStorage> = Arc::new(LocalStateStorage::new(state_dir));
    let mut run_log = RunLog::load(storage, CorruptStatePolicy::Fail).await?;
    let prior = run_log.forget(&identity).await?;

    if prior == Classification::Unseen {
        warn!("{} is not in the run log", identity);
    } else {
        info!("Forgot {} (was {:?})", identity, prior);
    }

    Ok((identity, prior))
}
