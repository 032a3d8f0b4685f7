//! Resumable, idempotent batch dispatch

pub mod engine;
pub mod sender;
pub mod state;

pub use engine::{
    BatchReport, DispatchConfig, DispatchConfigBuilder, DispatchEngine, FailureRecord,
    RecipientOutcome, batch_window,
};
pub use sender::{SendError, Sender};
pub use state::{
    Checkpoint, Classification, CorruptStatePolicy, LocalStateStorage, RunLog, RunLogEntries,
    StateKey, StateStorage,
};
