//! Configuration constants for the sender
//!
//! This module centralizes all tunable parameters and constants used throughout
//! the application.

use std::time::Duration;

// ============================================================================
// State Files
// ============================================================================

/// File name of the run log inside the state directory
pub const RUN_LOG_FILE: &str = "log.json";

/// File name of the checkpoint inside the state directory
pub const CHECKPOINT_FILE: &str = "progress.json";

/// Checkpoint value meaning "nothing processed yet"
pub const NO_CHECKPOINT: i64 = -1;

// ============================================================================
// Dispatch Configuration
// ============================================================================

pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Upper bound for a single send attempt
///
/// Set to 30 seconds because a send through a UI-driven or rate-limited
/// channel routinely takes several seconds. Anything slower is recorded as a
/// failure so the batch keeps moving.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Source Configuration
// ============================================================================

pub const DEFAULT_PHONE_COLUMN: &str = "phone";

// ============================================================================
// Cloud API Configuration
// ============================================================================

pub const CLOUD_API_BASE: &str = "https://graph.facebook.com";

pub const CLOUD_API_VERSION: &str = "v21.0";

/// Timeout for establishing the HTTP connection to the Cloud API
pub const CLOUD_API_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
