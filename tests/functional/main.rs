// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the RayCluster, RayService and RayJob reconcilers.
//!
//! These tests drive the real reconcilers against the in-memory platform
//! and the scripted job submission client. No Kubernetes cluster or Ray
//! dashboard is required.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_scale_up_creates_only_new_workers
//!
//! # Run with verbose output
//! cargo test --test functional -- --nocapture
//! ```
//!
//! ## Test Categories
//!
//! - **Cluster tests**: convergence, scaling, the disruption guard, health
//!   and deletion of a single RayCluster
//! - **Service tests**: blue/green swaps of a RayService
//! - **Job tests**: the RayJob lifecycle from cluster creation to cleanup

mod cluster_tests;
mod harness;
mod job_tests;
mod service_tests;

pub use harness::*;
