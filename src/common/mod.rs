//! Shared utilities.

pub mod retry;

pub use retry::{exponential_backoff, with_retry_and_backoff, Backoff};
