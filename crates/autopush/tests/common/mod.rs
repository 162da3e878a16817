//! Shared test utilities for autopush integration tests.
//!
//! This module provides:
//! - `RemoteHarness` for bare git remotes seeded in temp directories
//! - Builders for the resources an automation cycle reads

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{generate_signing_key, RemoteHarness, SEED_PATH};
