//! SQLite-backed [`ActionStore`](tempo_core::store::ActionStore).
//!
//! SQLite has no row locks, so a claim takes the database write lock for the
//! duration of one short `BEGIN IMMEDIATE` transaction. Claimers in other
//! processes queue on `busy_timeout` instead of ever seeing each other's rows.

mod schema;
mod store;

pub use store::SqliteActionStore;
