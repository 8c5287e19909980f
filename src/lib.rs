//! testbox: test-environment lifecycle manager for a build-framework test harness
//!
//! Provisions, reuses, invalidates and serializes access to disposable on-disk
//! environments that test suites run against.
//!
//! # Architecture
//!
//! ## State ([`state`])
//! - [`state::markers`]: `start`/`complete` facts per unit of work
//! - [`state::pollution`]: Clean / Polluted / Missing verdicts from marker state
//! - [`state::generation`]: Content fingerprint of the framework a foundation was built from
//!
//! ## Safety ([`safety`])
//! - [`safety::lock_manager`]: Poll-once advisory locks with dead-owner reclaim
//! - [`safety::process`]: Injectable process liveness
//! - [`safety::cleanup`]: Global clean of the environment namespace
//! - [`safety::safe_cleanup`]: Symlink-safe tree removal
//!
//! ## Environments ([`env`])
//! - [`env::layout`]: `<root>/<name>/{repo/, state dir}` addressing
//! - [`env::foundation`]: Foundation builder
//! - [`env::bootstrap`]: Deriving environments from the foundation
//! - [`env::registry`]: Suite → environment resolution, provisioning, suite bindings
//!
//! ## Chains ([`chain`])
//! - [`chain::suite`]: Suite trait, catalog and discovery
//! - [`chain::runner`]: The shared `run(suite)` entry point and full runs
//!
//! ## Collaborators ([`toolchain`])
//! Version control, framework setup and suite execution behind one trait.
//!
//! # Crash recovery
//!
//! A killed run leaves a `started` marker without `complete` and a lock stamped with a
//! dead pid. The next run sees both, reclaims the lock and rebuilds. There is no other
//! cancellation mechanism.

// Marker state and verdicts
pub mod state;

// Locks, liveness, removal
pub mod safety;

// Environment provisioning
pub mod env;

// Suite chains
pub mod chain;

// External collaborators
pub mod toolchain;

// Lifecycle event log
pub mod observability;

// Configuration & error taxonomy
pub mod config;

// Test doubles
pub mod testing;

// CLI entrypoint
pub mod cli;

pub use config::types::*;
