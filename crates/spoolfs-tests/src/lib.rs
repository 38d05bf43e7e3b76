//! Integration and scenario suites for the spoolfs request-queue tree.
//!
//! The suites drive a [`spoolfs_tree::SpoolTree`] over the in-memory
//! reference remote, covering the merged view, the queue decision table,
//! rename/copy endpoint combinations, restart durability, and fetch
//! coordination under concurrency. [`harness`] holds the shared fixture.

pub mod harness;

mod concurrency;
mod durability;
mod queue_rules;
mod rename_scenarios;
mod tree_scenarios;

pub use harness::{names, TestTree};
