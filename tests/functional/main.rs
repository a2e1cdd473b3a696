// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for the cluster upgrade pipeline.
//!
//! These tests drive discovery, drain, and the full four-phase pipeline
//! against in-memory cloud and Kubernetes fakes, WITHOUT requiring a live
//! cluster. The fakes close the loop: template deployments and capacity
//! changes materialize VMs and ready nodes, so the pipeline's own readiness
//! polling is what moves each scenario forward.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_agent_pool_holds_capacity_buffer
//!
//! # Run with verbose output
//! cargo test --test functional -- --nocapture
//! ```

mod pipeline_tests;
mod volume_tests;
