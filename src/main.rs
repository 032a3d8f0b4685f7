use std::path::PathBuf;
use std::time::Duration;

use bulk_sender::channels::{ChannelConfig, CloudApiConfig};
use bulk_sender::dispatch::Classification;
use bulk_sender::runner::{
    SendArgs, SendResult, StateSummary, forget_recipient, inspect_state, reset_state, run_send,
};
use bulk_sender::{DEFAULT_BATCH_SIZE, DEFAULT_PHONE_COLUMN, DEFAULT_SEND_TIMEOUT};
use clap::builder::TypedValueParser;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;

#[derive(Parser, Clone)]
#[command(version, about = "Send templated messages to a recipient list in resumable batches")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true, env = "LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Quiet mode - minimal output, only show summary
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Channel {
    /// WhatsApp Business Cloud API
    CloudApi,
    /// Log messages instead of sending them
    DryRun,
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Send the next batch of messages
    Send {
        /// Recipient list (CSV or TSV with a header row)
        #[arg(short, long, env = "CONTACTS_CSV", default_value = "contacts.csv")]
        contacts: PathBuf,

        /// Message template with {column} placeholders
        #[arg(short, long, env = "MESSAGE_TEMPLATE", default_value = "msg.txt")]
        template: PathBuf,

        /// Directory holding the run log and checkpoint
        #[arg(short, long, env = "STATE_DIR", default_value = ".")]
        state_dir: PathBuf,

        /// Number of recipients to process in this batch
        #[arg(short, long, default_value_t = DEFAULT_BATCH_SIZE,
              value_parser = clap::value_parser!(u64).range(1..).map(|v| v as usize))]
        batch_size: usize,

        /// Optional image or document sent with every message
        #[arg(short, long, alias = "image")]
        attachment: Option<PathBuf>,

        /// Column holding the phone number
        #[arg(long, default_value = DEFAULT_PHONE_COLUMN)]
        phone_column: String,

        /// File format (csv, tsv) - auto-detected from extension if not specified
        #[arg(short, long)]
        format: Option<String>,

        /// Field delimiter, overriding the format default (use \t for tab)
        #[arg(long)]
        delimiter: Option<String>,

        /// Channel used to deliver messages
        #[arg(long, value_enum, default_value_t = Channel::CloudApi)]
        channel: Channel,

        /// Cloud API access token
        #[arg(long, env = "WHATSAPP_ACCESS_TOKEN", hide_env_values = true)]
        access_token: Option<String>,

        /// Cloud API sending phone number ID
        #[arg(long, env = "WHATSAPP_PHONE_NUMBER_ID")]
        phone_number_id: Option<String>,

        /// Cloud API base URL
        #[arg(long, env = "WHATSAPP_API_BASE")]
        api_base: Option<String>,

        /// Give up on a single send after this many seconds
        #[arg(long, default_value_t = DEFAULT_SEND_TIMEOUT.as_secs())]
        send_timeout_secs: u64,

        /// Pause between consecutive sends
        #[arg(long, default_value = "0")]
        send_interval_ms: u64,

        /// Resume from the saved checkpoint without asking
        #[arg(long, conflicts_with = "restart")]
        resume: bool,

        /// Start again from the first recipient without asking (already-attempted
        /// recipients are skipped, never re-sent)
        #[arg(long)]
        restart: bool,

        /// Refuse to start if a state file is corrupt instead of starting empty
        #[arg(long)]
        strict_state: bool,
    },
    /// Show run log totals and the pending checkpoint
    Status {
        #[arg(short, long, env = "STATE_DIR", default_value = ".")]
        state_dir: PathBuf,
    },
    /// Clear the checkpoint so the next run starts from the top
    Reset {
        #[arg(short, long, env = "STATE_DIR", default_value = ".")]
        state_dir: PathBuf,

        /// Also erase the run log (previously messaged recipients will be messaged again)
        #[arg(long)]
        log: bool,
    },
    /// Remove a recipient from the run log so the next run retries it
    Forget {
        /// Phone number as written in the recipient list
        phone: String,

        #[arg(short, long, env = "STATE_DIR", default_value = ".")]
        state_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_file.as_ref(), args.quiet)?;

    match args.command {
        Command::Send {
            contacts,
            template,
            state_dir,
            batch_size,
            attachment,
            phone_column,
            format,
            delimiter,
            channel,
            access_token,
            phone_number_id,
            api_base,
            send_timeout_secs,
            send_interval_ms,
            resume,
            restart,
            strict_state,
        } => {
            let delimited = cli::resolve_delimited(&contacts, format, delimiter)?;

            let channel = match channel {
                Channel::DryRun => ChannelConfig::DryRun,
                Channel::CloudApi => {
                    let mut config = CloudApiConfig::new(
                        access_token.unwrap_or_default(),
                        phone_number_id.unwrap_or_default(),
                    );
                    if let Some(base) = api_base {
                        config.api_base = base;
                    }
                    ChannelConfig::CloudApi(config)
                }
            };

            let restart = if resume || restart {
                restart
            } else {
                cli::ask_restart(&state_dir).await?
            };

            let send_args = SendArgs {
                source: contacts,
                delimited,
                phone_column,
                template,
                state_dir,
                restart,
                strict_state,
                batch_size,
                attachment,
                send_timeout: Duration::from_secs(send_timeout_secs),
                send_interval: Duration::from_millis(send_interval_ms),
                channel,
                quiet: args.quiet,
            };

            if !args.quiet {
                println!("Bulk Sender");
                println!("===========");
                println!("Contacts: {}", send_args.source.display());
                println!("Template: {}", send_args.template.display());
                println!("State: {}", send_args.state_dir.display());
                println!("Batch size: {}", send_args.batch_size);
                println!();
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if cli::watch_interrupts(tokio::signal::ctrl_c, shutdown_tx).await {
                    eprintln!("Interrupted again; exiting without waiting for the current send");
                    std::process::exit(130);
                }
            });

            let result = run_send(send_args, shutdown_rx).await?;
            print_send_summary(&result);
        }
        Command::Status { state_dir } => {
            let summary = inspect_state(state_dir.clone()).await?;
            print_status(&state_dir, &summary);
        }
        Command::Reset { state_dir, log } => {
            reset_state(state_dir, log).await?;
            if log {
                println!("Checkpoint and run log cleared.");
            } else {
                println!("Checkpoint cleared. The run log is kept, so nobody is messaged twice.");
            }
        }
        Command::Forget { phone, state_dir } => {
            let (identity, prior) = forget_recipient(state_dir, &phone).await?;
            match prior {
                Classification::Unseen => println!("{} was not in the run log.", identity),
                prior => println!(
                    "{} removed from the run log (was {:?}); the next run will attempt it.",
                    identity, prior
                ),
            }
        }
    }

    Ok(())
}

fn init_tracing(log_file: Option<&PathBuf>, quiet: bool) -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if quiet {
                EnvFilter::new("bulk_sender=warn")
            } else {
                EnvFilter::new("bulk_sender=info")
            }
        })
    };

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("Cannot open log file {}: {}", path.display(), e))?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter())
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        None => {
            let subscriber = FmtSubscriber::builder().with_env_filter(filter()).finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }

    Ok(())
}

fn print_send_summary(result: &SendResult) {
    let report = &result.report;

    println!();
    println!("Batch Summary");
    println!("=============");
    println!("Run ID: {}", result.run_id);
    println!(
        "Window: recipients {}..{} of {}",
        report.window.start, report.window.end, report.total_recipients
    );
    println!("Processed: {}", report.processed);
    println!("Successful: {}", report.successful);
    println!("Failed: {}", report.failed);
    println!("Duplicates skipped: {}", report.duplicates);
    println!("Duration: {:.2}s", report.duration.as_secs_f64());

    if !report.failures.is_empty() {
        println!();
        println!("Failures (not retried; use `forget` to retry one):");
        for failure in &report.failures {
            println!(
                "  #{} {}: {}",
                failure.index, failure.identity, failure.error
            );
        }
    }

    println!();
    if report.interrupted {
        println!(
            "Interrupted. Progress saved after recipient {}; run again to resume.",
            report.last_processed
        );
    } else if report.exhausted {
        println!("All recipients processed. Checkpoint cleared.");
    } else {
        println!(
            "Batch done. {} recipients remain; run again for the next batch.",
            report.total_recipients as i64 - 1 - report.last_processed
        );
    }

    println!(
        "Run log totals: {} successful, {} failed, {} duplicates",
        result.totals.successful, result.totals.failed, result.totals.duplicates
    );
}

fn print_status(state_dir: &std::path::Path, summary: &StateSummary) {
    println!("State: {}", state_dir.display());
    println!("Successful: {}", summary.successful);
    println!("Failed: {}", summary.failed);
    println!("Duplicates skipped: {}", summary.duplicates);
    if summary.has_pending_checkpoint() {
        println!(
            "Checkpoint: resume after recipient {}",
            summary.last_processed
        );
    } else {
        println!("Checkpoint: none (next run starts from the first recipient)");
    }
}

/// CLI utility functions for resolving command-line arguments
mod cli {
    use std::io::IsTerminal;
    use std::path::Path;

    use bulk_sender::recipients::{DelimitedConfig, Format};
    use bulk_sender::runner::inspect_state;
    use tokio::sync::watch;

    /// Pick the delimited config from explicit flags or the file extension
    pub fn resolve_delimited(
        contacts: &Path,
        format: Option<String>,
        delimiter: Option<String>,
    ) -> anyhow::Result<DelimitedConfig> {
        let format = match format {
            Some(f) => Format::parse(&f)?,
            None => Format::detect_from_path(&contacts.to_string_lossy()).ok_or_else(|| {
                anyhow::anyhow!(
                    "Could not detect format from file '{}'.\n\
                     Supported extensions: .csv, .tsv\n\
                     Please specify --format explicitly.",
                    contacts.display()
                )
            })?,
        };

        let mut config = format.delimited_config();
        if let Some(delimiter) = delimiter {
            let quote = String::from_utf8(vec![config.quote])?;
            config = DelimitedConfig::from_strings(&delimiter, &quote)?;
        }
        Ok(config)
    }

    /// Ask whether to discard a pending checkpoint. Resumes when not interactive.
    pub async fn ask_restart(state_dir: &Path) -> anyhow::Result<bool> {
        let Ok(summary) = inspect_state(state_dir.to_path_buf()).await else {
            // Unreadable state is handled (and reported) by the run itself
            return Ok(false);
        };
        if !summary.has_pending_checkpoint() {
            return Ok(false);
        }

        if !std::io::stdin().is_terminal() {
            tracing::info!(
                "Checkpoint found after recipient {}; resuming",
                summary.last_processed
            );
            return Ok(false);
        }

        let last = summary.last_processed;
        let answer = tokio::task::spawn_blocking(move || {
            eprint!(
                "A previous run stopped after recipient {}. Resume from there? [Y/n] ",
                last
            );
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await??;

        Ok(matches!(answer.trim().to_lowercase().as_str(), "n" | "no"))
    }

    /// Request a graceful stop on the first interrupt.
    ///
    /// Returns true once a second interrupt arrives, meaning the operator wants
    /// out now. State stays consistent because every write is atomic.
    pub async fn watch_interrupts<F, Fut>(
        mut next_interrupt: F,
        shutdown_tx: watch::Sender<bool>,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::io::Result<()>>,
    {
        if next_interrupt().await.is_err() {
            return false;
        }
        eprintln!(
            "Gracefully shutting down after the current recipient (Ctrl-C again to quit now)..."
        );
        let _ = shutdown_tx.send(true);

        next_interrupt().await.is_ok()
    }

}
