//! Suite dependency chains
//!
//! The suite catalog and the runner that provisions each suite's prerequisites.

pub mod runner;
pub mod suite;
