//! Timing configuration for upgrade operations.
//!
//! Every poll interval and bounded wait in the crate is reified here instead
//! of living as a module constant, so callers (and tests) can shrink them.

use std::time::Duration;

/// Bounded waits and poll intervals used by the upgrade pipeline.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Per-step timeout for node create/validate operations.
    pub step_timeout: Duration,
    /// Overall timeout for one cordon-and-drain of a node.
    pub cordon_drain_timeout: Duration,
    /// Bound on copying custom node metadata from an old node to its
    /// replacement.
    pub node_properties_copy_timeout: Duration,
    /// Interval between node-ready polls during validation.
    pub validate_retry_interval: Duration,
    /// Interval between fetch attempts while waiting for node objects to
    /// become fetchable during metadata copy.
    pub properties_copy_retry_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(20 * 60),
            cordon_drain_timeout: Duration::from_secs(20 * 60),
            node_properties_copy_timeout: Duration::from_secs(5 * 60),
            validate_retry_interval: Duration::from_secs(5),
            properties_copy_retry_interval: Duration::from_secs(5),
        }
    }
}

/// Timing knobs for a single node drain.
#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// Maximum cordon attempts absorbed when the node update hits an
    /// optimistic-concurrency conflict.
    pub cordon_max_retries: u32,
    /// Fixed pause after the cordon update so the scheduler and observers
    /// register the change. Not proportional to cluster size.
    pub cordon_settle_delay: Duration,
    /// Sleep between eviction attempts while a PodDisruptionBudget pushes
    /// back with "too many requests".
    pub eviction_retry_interval: Duration,
    /// Interval between polls while waiting for evicted or deleted pods to
    /// disappear.
    pub deletion_poll_interval: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            cordon_max_retries: 5,
            cordon_settle_delay: Duration::from_secs(60),
            eviction_retry_interval: Duration::from_secs(5),
            deletion_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Timing knobs for the volume attachment waiter.
#[derive(Debug, Clone)]
pub struct VolumeWaitConfig {
    /// Overall bound on the wait across all pods.
    pub timeout: Duration,
    /// Per-pod poll interval.
    pub poll_interval: Duration,
}

impl Default for VolumeWaitConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60 * 60),
            poll_interval: Duration::from_secs(60),
        }
    }
}
