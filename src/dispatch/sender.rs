use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;

/// Why a single send attempt did not deliver
///
/// Every variant is terminal for the identity within a run; the engine never
/// retries. Operators retry by forgetting the identity and running again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("channel rejected the message: {0}")]
    Rejected(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("attachment could not be sent: {0}")]
    Attachment(String),

    #[error("send timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("sender panicked: {0}")]
    Panicked(String),
}

/// The messaging channel that performs a single delivery attempt
///
/// One session is shared by the whole run and used strictly sequentially.
#[async_trait::async_trait]
pub trait Sender: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Attempt delivery of `message` (and `attachment`, if any) to `identity`
    async fn send(
        &self,
        identity: &str,
        message: &str,
        attachment: Option<&Path>,
    ) -> std::result::Result<(), SendError>;

    /// Release the underlying session. Called once, after the last send.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
