//! Temporal coordination core: a durable, crash-safe action scheduler and a
//! per-subject message-coalescing buffer.
//!
//! This crate is intentionally storage- and transport-agnostic. Concrete stores
//! (SQLite, Postgres) and executors (webhooks) live behind ports implemented in
//! adapter crates.

pub mod clock;
pub mod config;
pub mod debounce;
pub mod domain;
pub mod errors;
pub mod executor;
pub mod logging;
pub mod reaper;
pub mod retry;
pub mod store;
pub mod worker;

pub use errors::{Error, ExecutionError, Result};
