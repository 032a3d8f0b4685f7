// Public API - the runner plus the pieces it is built from
pub mod channels;
pub mod dispatch;
pub mod recipients;
pub mod runner;
pub mod telemetry;
pub mod template;

// Internal modules
mod config;
mod io;

pub use config::{DEFAULT_BATCH_SIZE, DEFAULT_PHONE_COLUMN, DEFAULT_SEND_TIMEOUT};

#[cfg(test)]
mod integ_tests;
