//! Observability
//!
//! Structured lifecycle events for diagnosing rebuilds and failures.

pub mod events;
