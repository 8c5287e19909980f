//! Configuration and shared types
//!
//! Harness settings, the error taxonomy, and exit-code mapping.

pub mod settings;
pub mod types;
