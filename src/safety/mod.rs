//! Safety and cleanup
//!
//! Exclusive access to environments, process liveness, and symlink-safe removal.

pub mod cleanup;
pub mod lock_manager;
pub mod process;
pub mod safe_cleanup;
