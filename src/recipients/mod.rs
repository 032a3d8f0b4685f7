//! Recipient source parsing and deduplication

pub mod delimited;
pub mod store;

pub use delimited::{DelimitedConfig, Format};
pub use store::{LoadStats, Recipient, RecipientError, RecipientStore, normalize_phone};
