//! Execution state
//!
//! Markers recorded per unit of work, pollution verdicts derived from them, and the
//! foundation generation fingerprint.

pub mod generation;
pub mod markers;
pub mod pollution;
