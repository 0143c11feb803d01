//! Shared utilities for sharebox integration tests.

pub mod harness;

pub use harness::TestHarness;
