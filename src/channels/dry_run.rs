use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::dispatch::{SendError, Sender};

/// Sender that only logs what it would have sent
///
/// Every attempt counts as delivered, so a dry run fills the run log exactly
/// like a real one would. Point it at a scratch state directory.
#[derive(Debug, Default)]
pub struct DryRunSender {
    sent: AtomicU64,
}

impl DryRunSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sender for DryRunSender {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn send(
        &self,
        identity: &str,
        message: &str,
        attachment: Option<&Path>,
    ) -> Result<(), SendError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        match attachment {
            Some(path) => info!(
                "[dry-run] {} <- {} chars + {}",
                identity,
                message.chars().count(),
                path.display()
            ),
            None => info!("[dry-run] {} <- {} chars", identity, message.chars().count()),
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        info!("[dry-run] {} messages would have been sent", self.sent());
        Ok(())
    }
}
