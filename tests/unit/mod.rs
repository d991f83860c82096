// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for the MongoDB Operator
//!
//! This module contains unit tests for:
//! - Spec normalization
//! - Cron evaluation and archive naming
//! - The backup scheduler, executor and restore controller
//! - Reconcile planning against a simulated replica set
//! - State machine transitions
//! - Status conditions and resource generators

#[path = "../common/mod.rs"]
mod common;

mod archive;
mod normalize;
mod resources;
mod status;
