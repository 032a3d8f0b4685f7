use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use derive_builder::Builder;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use super::sender::{SendError, Sender};
use super::state::{Checkpoint, Classification, RunLog};
use crate::config::DEFAULT_SEND_TIMEOUT;
use crate::recipients::RecipientStore;
use crate::telemetry::TelemetryEvent;
use crate::template::MessageTemplate;

/// Configuration for one dispatch run
#[derive(Debug, Clone, Builder)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct DispatchConfig {
    /// Maximum number of new recipients walked per invocation
    pub batch_size: usize,
    #[builder(default)]
    pub attachment: Option<PathBuf>,
    #[builder(default = "DEFAULT_SEND_TIMEOUT")]
    pub send_timeout: Duration,
    /// Pause after each real send attempt
    #[builder(default)]
    pub send_interval: Duration,
}

impl DispatchConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.batch_size == Some(0) {
            return Err("batch size must be at least 1".to_string());
        }
        if self.send_timeout == Some(Duration::ZERO) {
            return Err("send timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// What happened to one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientOutcome {
    Sent,
    Failed,
    Duplicate,
}

/// A failed delivery attempt within a batch
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub index: usize,
    pub identity: String,
    pub error: SendError,
}

/// Summary of a single batch invocation
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// Planned window of recipient indices
    pub window: Range<usize>,
    pub total_recipients: usize,
    pub processed: usize,
    pub successful: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub failures: Vec<FailureRecord>,
    /// Stopped early on a shutdown request
    pub interrupted: bool,
    /// The whole recipient list has been walked and the checkpoint cleared
    pub exhausted: bool,
    /// Checkpoint value after the batch (-1 once cleared)
    pub last_processed: i64,
    pub duration: Duration,
}

/// Batch window starting just after the checkpoint.
///
/// Each invocation covers up to `batch_size` recipients from wherever the
/// previous one stopped, so several resumed invocations compose into one
/// uninterrupted walk of the list.
pub fn batch_window(last_processed: i64, batch_size: usize, len: usize) -> Range<usize> {
    let start = last_processed
        .checked_add(1)
        .and_then(|next| usize::try_from(next.max(0)).ok())
        .unwrap_or(len);
    let end = start.saturating_add(batch_size).min(len);
    start.min(end)..end
}

/// Sequential, resumable dispatcher
///
/// Owns the run log, checkpoint and sender for the duration of a run. Each
/// recipient is one transaction: classify, send, record in the run log, then
/// advance the checkpoint. The next recipient starts only after both writes
/// are durable.
pub struct DispatchEngine {
    store: RecipientStore,
    template: MessageTemplate,
    sender: Arc<dyn Sender>,
    run_log: RunLog,
    checkpoint: Checkpoint,
    config: DispatchConfig,
    telemetry_tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl DispatchEngine {
    /// Create an engine, validating the template and attachment up front
    pub fn new(
        store: RecipientStore,
        template: MessageTemplate,
        sender: Arc<dyn Sender>,
        run_log: RunLog,
        checkpoint: Checkpoint,
        config: DispatchConfig,
    ) -> Result<Self> {
        template
            .validate_against(store.columns())
            .context("Message template does not match the recipient source")?;

        if let Some(path) = &config.attachment
            && !path.is_file()
        {
            bail!("Attachment {} does not exist", path.display());
        }

        Ok(Self {
            store,
            template,
            sender,
            run_log,
            checkpoint,
            config,
            telemetry_tx: None,
            shutdown: None,
        })
    }

    /// Report per-recipient progress on this channel
    pub fn with_telemetry(mut self, telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>) -> Self {
        self.telemetry_tx = Some(telemetry_tx);
        self
    }

    /// Stop at the next recipient boundary once this flag turns true
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn run_log(&self) -> &RunLog {
        &self.run_log
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn store(&self) -> &RecipientStore {
        &self.store
    }

    /// Window the next `run_batch` call will walk
    pub fn window(&self) -> Range<usize> {
        batch_window(
            self.checkpoint.current(),
            self.config.batch_size,
            self.store.len(),
        )
    }

    /// Process one batch window
    ///
    /// Send failures are recorded and never abort the batch. Persistence
    /// failures are returned as errors: the run stops rather than continue
    /// with state it cannot vouch for.
    pub async fn run_batch(&mut self) -> Result<BatchReport> {
        let start_time = Instant::now();
        let total = self.store.len();
        let window = self.window();

        if self.checkpoint.next_index() > total {
            warn!(
                "Checkpoint {} is past the end of the recipient list ({} recipients); the list shrank since the last run",
                self.checkpoint.current(),
                total
            );
        }

        info!(
            "Dispatching recipients {}..{} of {} via {}",
            window.start,
            window.end,
            total,
            self.sender.name()
        );
        self.emit(TelemetryEvent::BatchStarted {
            start: window.start,
            end: window.end,
        });

        let mut report = BatchReport {
            window: window.clone(),
            total_recipients: total,
            processed: 0,
            successful: 0,
            failed: 0,
            duplicates: 0,
            failures: Vec::new(),
            interrupted: false,
            exhausted: false,
            last_processed: self.checkpoint.current(),
            duration: Duration::ZERO,
        };

        for index in window.clone() {
            if self.shutdown_requested() {
                info!("Shutdown requested; stopping before recipient {}", index);
                report.interrupted = true;
                break;
            }

            let outcome = self.process_recipient(index, &mut report).await?;
            report.processed += 1;

            if outcome != RecipientOutcome::Duplicate
                && !self.config.send_interval.is_zero()
                && index + 1 < window.end
            {
                self.pause(self.config.send_interval).await;
            }
        }

        if report.interrupted {
            self.flush().await?;
        } else if window.end == total {
            self.checkpoint.clear().await?;
            report.exhausted = true;
            info!("All {} recipients processed; checkpoint cleared", total);
        }

        report.last_processed = self.checkpoint.current();
        report.duration = start_time.elapsed();

        info!(
            "Batch complete: {} successful, {} failed, {} duplicates in {:.2}s",
            report.successful,
            report.failed,
            report.duplicates,
            report.duration.as_secs_f64()
        );

        Ok(report)
    }

    /// Persist the run log and checkpoint again
    pub async fn flush(&self) -> Result<()> {
        self.run_log.flush().await?;
        self.checkpoint.flush().await
    }

    /// Run one recipient transaction
    async fn process_recipient(
        &mut self,
        index: usize,
        report: &mut BatchReport,
    ) -> Result<RecipientOutcome> {
        let recipient = &self.store.recipients()[index];
        let identity = recipient.identity.clone();

        let prior = self.run_log.classify(&identity);
        if prior != Classification::Unseen {
            info!(
                "Skipping {} (recipient {}): already {:?} in an earlier run",
                identity, index, prior
            );
            self.run_log.record_duplicate(&identity).await?;
            self.checkpoint.advance(index).await?;
            report.duplicates += 1;
            self.emit(TelemetryEvent::Duplicate { index });
            return Ok(RecipientOutcome::Duplicate);
        }

        let message = self
            .template
            .render(&recipient.attributes)
            .with_context(|| format!("Failed to render message for recipient {}", index))?;

        let started = Instant::now();
        let result = self.deliver(&identity, message).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(()) => {
                self.run_log.record_success(&identity).await?;
                info!("Message sent to {} (recipient {})", identity, index);
                report.successful += 1;
                RecipientOutcome::Sent
            }
            Err(error) => {
                self.run_log.record_failure(&identity).await?;
                warn!(
                    "Failed to send to {} (recipient {}): {}",
                    identity, index, error
                );
                report.failed += 1;
                report.failures.push(FailureRecord {
                    index,
                    identity,
                    error,
                });
                RecipientOutcome::Failed
            }
        };

        self.checkpoint.advance(index).await?;

        self.emit(match outcome {
            RecipientOutcome::Sent => TelemetryEvent::Sent { index, duration_ms },
            _ => TelemetryEvent::Failed { index, duration_ms },
        });

        Ok(outcome)
    }

    /// Invoke the sender on its own task, bounded by the send timeout
    ///
    /// A sender that panics or hangs becomes an ordinary failed attempt.
    async fn deliver(&self, identity: &str, message: String) -> Result<(), SendError> {
        let sender = Arc::clone(&self.sender);
        let attachment = self.config.attachment.clone();
        let identity = identity.to_string();

        let handle = tokio::spawn(async move {
            sender
                .send(&identity, &message, attachment.as_deref())
                .await
        });
        let abort = handle.abort_handle();

        match tokio::time::timeout(self.config.send_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(SendError::Panicked(panic_message(join_error))),
            Err(_) => {
                abort.abort();
                Err(SendError::Timeout(self.config.send_timeout))
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep for `interval`, waking early on shutdown
    async fn pause(&mut self, interval: Duration) {
        let Some(rx) = self.shutdown.as_mut() else {
            tokio::time::sleep(interval).await;
            return;
        };

        let stop = async {
            if *rx.borrow_and_update() {
                return;
            }
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    return;
                }
            }
            std::future::pending::<()>().await
        };

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop => {}
        }
    }

    fn emit(&self, event: TelemetryEvent) {
        if let Some(tx) = &self.telemetry_tx {
            let _ = tx.send(event);
        }
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return "send task was cancelled".to_string();
    }

    let payload = error.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
