//! Retry and backoff policy.
//!
//! Encapsulates backoff decisions for transient chunk failures so the chunk
//! fetcher and the engine share one policy. Error classification lives in
//! `crate::error`; this module only decides *whether* and *when* to retry.

mod policy;

pub use policy::{RetryDecision, RetryPolicy};
