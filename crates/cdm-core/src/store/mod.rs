//! Persistent download queue (SQLite via sqlx).
//!
//! The store is the sole authority over durable state: downloads, their
//! chunks, and attempt history. Every mutation runs in a transaction that
//! verifies the state machine, writes the rows, and bumps the snapshot
//! version. The engine never mutates state in memory without a successful
//! persisted transition.

mod attempts;
mod chunks;
mod db;
mod downloads;
mod machine;
mod snapshot;
mod types;

#[cfg(test)]
mod tests;

pub use db::{unix_millis, Store};
pub use machine::transition_allowed;
pub use types::*;
