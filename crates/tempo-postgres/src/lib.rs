//! Postgres-backed [`ActionStore`](tempo_core::store::ActionStore).
//!
//! Claims use `FOR UPDATE SKIP LOCKED`: concurrent claimers lock disjoint rows
//! and never wait on each other.

mod store;

pub use store::PostgresActionStore;
