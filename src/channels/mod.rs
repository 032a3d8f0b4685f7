//! Concrete message channels

pub mod cloud_api;
pub mod dry_run;

use std::sync::Arc;

use anyhow::Result;

pub use cloud_api::{CloudApiConfig, CloudApiSender};
pub use dry_run::DryRunSender;

use crate::dispatch::Sender;

/// Which channel delivers the messages
#[derive(Debug, Clone)]
pub enum ChannelConfig {
    CloudApi(CloudApiConfig),
    DryRun,
}

impl ChannelConfig {
    /// Create the sender for this channel
    pub fn create_sender(&self) -> Result<Arc<dyn Sender>> {
        match self {
            ChannelConfig::CloudApi(config) => Ok(Arc::new(CloudApiSender::new(config.clone())?)),
            ChannelConfig::DryRun => Ok(Arc::new(DryRunSender::new())),
        }
    }
}
