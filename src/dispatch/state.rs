use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{CHECKPOINT_FILE, NO_CHECKPOINT, RUN_LOG_FILE};
use crate::io::durable;

/// Which persisted document a storage operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKey {
    RunLog,
    Checkpoint,
}

/// What to do when a state file exists but cannot be parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorruptStatePolicy {
    /// Warn, move the file aside, and continue with empty state
    #[default]
    Recover,
    /// Refuse to start
    Fail,
}

/// Trait for state storage operations
///
/// The run log and checkpoint are the only state shared across process
/// restarts. `write` and `remove` must be durable before they return: the
/// engine advances the checkpoint only after the run log write has landed.
#[async_trait::async_trait]
pub trait StateStorage: Send + Sync {
    /// Read the raw document, `None` if it has never been written
    async fn read(&self, key: StateKey) -> Result<Option<Vec<u8>>>;

    /// Durably replace the document
    async fn write(&self, key: StateKey, contents: String) -> Result<()>;

    /// Durably delete the document (no-op if absent)
    async fn remove(&self, key: StateKey) -> Result<()>;

    /// Preserve an unreadable document out of the way; returns where it went
    async fn quarantine(&self, key: StateKey) -> Result<String>;

    /// Human-readable location of the document, for logs
    fn describe(&self, key: StateKey) -> String;
}

/// Local filesystem implementation of StateStorage
///
/// Directory structure:
///   {base_dir}/log.json
///   {base_dir}/progress.json
pub struct LocalStateStorage {
    base_dir: PathBuf,
}

impl LocalStateStorage {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn path(&self, key: StateKey) -> PathBuf {
        match key {
            StateKey::RunLog => self.base_dir.join(RUN_LOG_FILE),
            StateKey::Checkpoint => self.base_dir.join(CHECKPOINT_FILE),
        }
    }
}

#[async_trait::async_trait]
impl StateStorage for LocalStateStorage {
    async fn read(&self, key: StateKey) -> Result<Option<Vec<u8>>> {
        durable::read_optional(&self.path(key)).await
    }

    async fn write(&self, key: StateKey, contents: String) -> Result<()> {
        durable::atomic_write(&self.path(key), contents.into_bytes()).await
    }

    async fn remove(&self, key: StateKey) -> Result<()> {
        durable::remove(&self.path(key)).await
    }

    async fn quarantine(&self, key: StateKey) -> Result<String> {
        let moved = durable::quarantine(&self.path(key)).await?;
        Ok(moved.display().to_string())
    }

    fn describe(&self, key: StateKey) -> String {
        self.path(key).display().to_string()
    }
}

/// Parse a state document, applying the corruption policy on failure
async fn load_document<T: for<'de> Deserialize<'de>>(
    storage: &dyn StateStorage,
    key: StateKey,
    policy: CorruptStatePolicy,
) -> Result<Option<T>> {
    let Some(contents) = storage.read(key).await? else {
        return Ok(None);
    };

    match serde_json::from_slice(&contents) {
        Ok(doc) => Ok(Some(doc)),
        Err(e) => match policy {
            CorruptStatePolicy::Fail => Err(e).with_context(|| {
                format!(
                    "State file {} is corrupt (rerun without --strict-state to start from empty state)",
                    storage.describe(key)
                )
            }),
            CorruptStatePolicy::Recover => {
                let moved = storage.quarantine(key).await?;
                warn!(
                    "State file {} is corrupt ({}); moved to {} and starting from empty state",
                    storage.describe(key),
                    e,
                    moved
                );
                Ok(None)
            }
        },
    }
}

// ============================================================================
// Run Log
// ============================================================================

/// Prior outcome of an identity according to the run log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Unseen,
    Successful,
    Failed,
}

/// Run log document (JSON serialization format)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntries {
    #[serde(default)]
    pub successful: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
    /// Skip events, not a set: the same identity may appear many times
    #[serde(default)]
    pub duplicates: Vec<String>,
}

/// Append-only record of every identity ever attempted
///
/// Each `record_*` call persists the whole log before returning, so the log is
/// never more than one attempt behind what the engine has done.
pub struct RunLog {
    entries: RunLogEntries,
    index: HashMap<String, Classification>,
    storage: Arc<dyn StateStorage>,
}

impl RunLog {
    /// Load the run log, falling back to an empty log if absent
    pub async fn load(storage: Arc<dyn StateStorage>, policy: CorruptStatePolicy) -> Result<Self> {
        let mut entries: RunLogEntries = load_document(storage.as_ref(), StateKey::RunLog, policy)
            .await?
            .unwrap_or_default();

        let mut index = HashMap::new();
        for identity in &entries.successful {
            index.insert(identity.clone(), Classification::Successful);
        }

        let mut conflicting = Vec::new();
        for identity in &entries.failed {
            if index.contains_key(identity) {
                conflicting.push(identity.clone());
            } else {
                index.insert(identity.clone(), Classification::Failed);
            }
        }

        if !conflicting.is_empty() {
            warn!(
                "{} identities appear as both successful and failed in {}; treating them as successful",
                conflicting.len(),
                storage.describe(StateKey::RunLog)
            );
            entries.failed.retain(|id| !conflicting.contains(id));
        }

        debug!(
            "Loaded run log: {} successful, {} failed, {} duplicates",
            entries.successful.len(),
            entries.failed.len(),
            entries.duplicates.len()
        );

        Ok(Self {
            entries,
            index,
            storage,
        })
    }

    pub fn classify(&self, identity: &str) -> Classification {
        self.index
            .get(identity)
            .copied()
            .unwrap_or(Classification::Unseen)
    }

    pub fn entries(&self) -> &RunLogEntries {
        &self.entries
    }

    pub async fn record_success(&mut self, identity: &str) -> Result<()> {
        self.record_attempt(identity, Classification::Successful)
            .await
    }

    pub async fn record_failure(&mut self, identity: &str) -> Result<()> {
        self.record_attempt(identity, Classification::Failed).await
    }

    pub async fn record_duplicate(&mut self, identity: &str) -> Result<()> {
        let mut next = self.entries.clone();
        next.duplicates.push(identity.to_string());
        self.commit(next).await
    }

    async fn record_attempt(&mut self, identity: &str, outcome: Classification) -> Result<()> {
        let prior = self.classify(identity);
        if prior != Classification::Unseen {
            bail!(
                "Identity {} already recorded as {:?}; refusing to record a second attempt",
                identity,
                prior
            );
        }

        let mut next = self.entries.clone();
        match outcome {
            Classification::Successful => next.successful.push(identity.to_string()),
            Classification::Failed => next.failed.push(identity.to_string()),
            Classification::Unseen => unreachable!("an attempt always has an outcome"),
        }
        self.commit(next).await?;
        self.index.insert(identity.to_string(), outcome);
        Ok(())
    }

    /// Remove an identity from `successful`/`failed` so a later run retries it.
    /// Returns the classification it had.
    pub async fn forget(&mut self, identity: &str) -> Result<Classification> {
        let prior = self.classify(identity);
        if prior == Classification::Unseen {
            return Ok(prior);
        }

        let mut next = self.entries.clone();
        next.successful.retain(|id| id != identity);
        next.failed.retain(|id| id != identity);
        self.commit(next).await?;
        self.index.remove(identity);
        Ok(prior)
    }

    /// Erase the whole log
    pub async fn clear(&mut self) -> Result<()> {
        self.storage
            .remove(StateKey::RunLog)
            .await
            .context("Failed to remove run log")?;
        self.entries = RunLogEntries::default();
        self.index.clear();
        Ok(())
    }

    /// Persist the current contents again
    pub async fn flush(&self) -> Result<()> {
        Self::persist(self.storage.as_ref(), &self.entries).await
    }

    // The in-memory log only changes once the write has landed
    async fn commit(&mut self, next: RunLogEntries) -> Result<()> {
        Self::persist(self.storage.as_ref(), &next).await?;
        self.entries = next;
        Ok(())
    }

    async fn persist(storage: &dyn StateStorage, entries: &RunLogEntries) -> Result<()> {
        let json = serde_json::to_string_pretty(entries).context("Failed to serialize run log")?;
        storage
            .write(StateKey::RunLog, json)
            .await
            .context("Failed to persist run log")
    }
}

// ============================================================================
// Checkpoint
// ============================================================================

/// Checkpoint document (JSON serialization format)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub last_processed: i64,
}

/// Cursor over the deduplicated recipient list
pub struct Checkpoint {
    last_processed: i64,
    storage: Arc<dyn StateStorage>,
}

impl Checkpoint {
    pub async fn load(storage: Arc<dyn StateStorage>, policy: CorruptStatePolicy) -> Result<Self> {
        let file: Option<CheckpointFile> =
            load_document(storage.as_ref(), StateKey::Checkpoint, policy).await?;

        let last_processed = match file {
            Some(file)
                if file.last_processed < NO_CHECKPOINT
                    || index_after(file.last_processed).is_none() =>
            {
                warn!(
                    "Checkpoint {} holds invalid index {}; starting from the beginning",
                    storage.describe(StateKey::Checkpoint),
                    file.last_processed
                );
                NO_CHECKPOINT
            }
            Some(file) => file.last_processed,
            None => NO_CHECKPOINT,
        };

        Ok(Self {
            last_processed,
            storage,
        })
    }

    /// Last persisted index, or -1 if nothing has been processed
    pub fn current(&self) -> i64 {
        self.last_processed
    }

    /// First index a resumed run should attempt
    pub fn next_index(&self) -> usize {
        index_after(self.last_processed).unwrap_or(0)
    }

    /// Durably record `index` as the last processed recipient
    pub async fn advance(&mut self, index: usize) -> Result<()> {
        let index = index as i64;
        if index <= self.last_processed {
            bail!(
                "Checkpoint cannot move backwards from {} to {}",
                self.last_processed,
                index
            );
        }

        Self::persist(self.storage.as_ref(), index).await?;
        self.last_processed = index;
        Ok(())
    }

    /// Remove the persisted checkpoint so the next run starts from the top
    pub async fn clear(&mut self) -> Result<()> {
        self.storage
            .remove(StateKey::Checkpoint)
            .await
            .context("Failed to clear checkpoint")?;
        self.last_processed = NO_CHECKPOINT;
        Ok(())
    }

    /// Persist the current value again (nothing is written for a cleared checkpoint)
    pub async fn flush(&self) -> Result<()> {
        if self.last_processed == NO_CHECKPOINT {
            return Ok(());
        }
        Self::persist(self.storage.as_ref(), self.last_processed).await
    }

    async fn persist(storage: &dyn StateStorage, last_processed: i64) -> Result<()> {
        let json = serde_json::to_string_pretty(&CheckpointFile { last_processed })
            .context("Failed to serialize checkpoint")?;
        storage
            .write(StateKey::Checkpoint, json)
            .await
            .context("Failed to persist checkpoint")
    }
}

// None when the successor of a stored index is not addressable
fn index_after(last_processed: i64) -> Option<usize> {
    last_processed
        .checked_add(1)
        .and_then(|next| usize::try_from(next).ok())
}
