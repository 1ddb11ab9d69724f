//! Activity abstractions
//!
//! Activities are units of work executed by workers. Each call is a single
//! attempt; failed attempts are retried by the engine per the retry policy
//! the workflow attached to the activity.

mod context;
mod definition;

pub use context::ActivityContext;
pub use definition::{Activity, ActivityError};
