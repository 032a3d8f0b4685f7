use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::delimited::DelimitedConfig;

#[derive(Debug, Error)]
pub enum RecipientError {
    #[error("phone column '{column}' not found in source header (columns: {available})")]
    MissingPhoneColumn { column: String, available: String },
}

/// A single recipient, keyed by normalized phone number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub identity: String,
    /// Every source column by header name, including the raw phone value
    pub attributes: BTreeMap<String, String>,
}

/// Counters describing what happened while loading the source
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadStats {
    pub rows_read: usize,
    pub malformed: usize,
    pub empty_identity: usize,
    pub duplicates: usize,
}

/// Normalize a phone number into a recipient identity.
///
/// Strips every non-digit character, then removes a single leading zero.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.strip_prefix('0') {
        Some(rest) => rest.to_string(),
        None => digits,
    }
}

/// Deduplicated, load-ordered list of recipients
#[derive(Debug, Clone)]
pub struct RecipientStore {
    columns: Vec<String>,
    recipients: Vec<Recipient>,
    stats: LoadStats,
}

impl RecipientStore {
    /// Load recipients from a delimited file
    pub async fn load(path: &Path, config: &DelimitedConfig, phone_column: &str) -> Result<Self> {
        let contents = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read recipient source {}", path.display()))?;

        let store = Self::from_reader(contents.as_slice(), config, phone_column)
            .with_context(|| format!("Failed to load recipients from {}", path.display()))?;

        info!(
            "Loaded {} recipients from {} ({} rows, {} malformed, {} without phone, {} duplicates)",
            store.len(),
            path.display(),
            store.stats.rows_read,
            store.stats.malformed,
            store.stats.empty_identity,
            store.stats.duplicates
        );

        Ok(store)
    }

    /// Parse recipients from any reader. Malformed rows are dropped and logged.
    pub fn from_reader<R: std::io::Read>(
        reader: R,
        config: &DelimitedConfig,
        phone_column: &str,
    ) -> Result<Self> {
        let mut csv_reader = config.reader_builder().from_reader(reader);

        let columns: Vec<String> = csv_reader
            .headers()
            .context("Failed to read header row")?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let phone_idx = columns
            .iter()
            .position(|c| c == phone_column)
            .ok_or_else(|| RecipientError::MissingPhoneColumn {
                column: phone_column.to_string(),
                available: columns.join(", "),
            })?;

        let mut stats = LoadStats::default();
        let mut seen = HashSet::new();
        let mut recipients = Vec::new();

        for result in csv_reader.records() {
            stats.rows_read += 1;

            let record = match result {
                Ok(record) => record,
                Err(e) if e.is_io_error() => {
                    return Err(e).context("Failed to read recipient source");
                }
                Err(e) => {
                    let line = e.position().map(|p| p.line()).unwrap_or(0);
                    warn!("Dropping malformed row at line {}: {}", line, e);
                    stats.malformed += 1;
                    continue;
                }
            };

            let line = record.position().map(|p| p.line()).unwrap_or(0);
            let raw_phone = record.get(phone_idx).unwrap_or_default();
            let identity = normalize_phone(raw_phone);

            if identity.is_empty() {
                warn!(
                    "Dropping row at line {}: phone value '{}' has no digits",
                    line, raw_phone
                );
                stats.empty_identity += 1;
                continue;
            }

            if !seen.insert(identity.clone()) {
                debug!("Dropping duplicate recipient {} at line {}", identity, line);
                stats.duplicates += 1;
                continue;
            }

            let attributes = columns
                .iter()
                .cloned()
                .zip(record.iter().map(|v| v.to_string()))
                .collect();

            recipients.push(Recipient {
                identity,
                attributes,
            });
        }

        Ok(Self {
            columns,
            recipients,
            stats,
        })
    }

    /// Build a store directly from already-normalized recipients
    pub fn from_recipients(columns: Vec<String>, recipients: Vec<Recipient>) -> Self {
        let mut seen = HashSet::new();
        let mut stats = LoadStats {
            rows_read: recipients.len(),
            ..LoadStats::default()
        };
        let recipients = recipients
            .into_iter()
            .filter(|r| {
                let keep = seen.insert(r.identity.clone());
                if !keep {
                    stats.duplicates += 1;
                }
                keep
            })
            .collect();

        Self {
            columns,
            recipients,
            stats,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn recipients(&self) -> &[Recipient] {
        &self.recipients
    }

    pub fn stats(&self) -> &LoadStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }
}
