//! Reliability patterns for durable execution
//!
//! [`RetryPolicy`] bounds attempts and spacing for activities and runs.

mod retry;

pub(crate) use retry::duration_millis;
pub use retry::{RetryDecision, RetryPolicy};
