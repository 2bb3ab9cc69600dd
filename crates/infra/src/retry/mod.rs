//! Bounded retry with backoff for external calls.
//!
//! Every call to a provider, the lead source, or the persistence layer goes
//! through [`RetryRunner`], which is also the only writer of retry telemetry.

pub mod policy;
pub mod runner;

pub use policy::{BackoffStrategy, Classify, ErrorClass, RetryPolicy};
pub use runner::{AttemptError, RetryError, RetryRunner};
