//! File I/O helpers for persisted state

pub mod durable;
