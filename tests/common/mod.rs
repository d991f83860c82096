// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Common test utilities and fixtures shared across all test targets
//!
//! `fixtures` builds MongoCluster resources and normalized specs,
//! `fakes` holds in-memory stand-ins for the cluster, mongod and storage.
//!
//! # Usage
//!
//! Include this module in your test file:
//! ```rust,ignore
//! #[path = "../common/mod.rs"]
//! mod common;
//! use common::*;
//! ```

mod fakes;
mod fixtures;

#[allow(unused_imports)]
pub use fakes::*;
pub use fixtures::*;
