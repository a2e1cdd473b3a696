//! Desired cluster model.
//!
//! The immutable inputs of an upgrade run: what the cluster should look like
//! once every node reports the target orchestrator version.

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::cloud::OsType;
use crate::error::{Error, Result};

/// Name prefix for all master VMs.
pub const MASTER_VM_NAME_PREFIX: &str = "k8s-master-";

/// Pool name used for the control plane in templates and logs.
pub const MASTER_POOL_NAME: &str = "master";

/// Desired state of a single agent pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPoolProfile {
    pub name: String,
    /// Steady-state node count.
    pub count: usize,
    #[serde(default)]
    pub os_type: OsType,
    /// Whether the pool is backed by a VM scale set instead of standalone
    /// availability-set VMs.
    #[serde(default)]
    pub uses_scale_sets: bool,
    /// Copy custom annotations, labels, and taints from a replaced node to
    /// its successor.
    #[serde(default = "default_true")]
    pub preserve_nodes_properties: bool,
}

fn default_true() -> bool {
    true
}

impl AgentPoolProfile {
    pub fn new(name: impl Into<String>, count: usize) -> Self {
        Self {
            name: name.into(),
            count,
            os_type: OsType::Linux,
            uses_scale_sets: false,
            preserve_nodes_properties: true,
        }
    }
}

/// Desired state of the whole cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterModel {
    /// Target orchestrator version every node should end up on.
    pub orchestrator_version: String,
    /// Unique cluster name suffix embedded in every VM name; used to exclude
    /// foreign VMs sharing the resource group.
    pub name_suffix: String,
    /// Desired master count. Zero for hosted-control-plane clusters.
    pub master_count: usize,
    /// The control plane is managed outside this resource group; masters are
    /// not enumerated or replaced, and the upgrade-path preflight does not
    /// apply.
    #[serde(default)]
    pub hosted_master: bool,
    pub agent_pools: Vec<AgentPoolProfile>,
}

impl ClusterModel {
    pub fn agent_pool(&self, name: &str) -> Option<&AgentPoolProfile> {
        self.agent_pools.iter().find(|p| p.name == name)
    }

    /// Position of a pool in the model, used as the pool digit in Windows
    /// VM names.
    pub fn agent_pool_index(&self, name: &str) -> Option<usize> {
        self.agent_pools.iter().position(|p| p.name == name)
    }

    pub fn target_version(&self) -> Result<Version> {
        parse_version(&self.orchestrator_version)
    }
}

/// Parse an orchestrator version, tolerating a leading "v".
pub fn parse_version(raw: &str) -> Result<Version> {
    Version::parse(raw.trim_start_matches('v'))
        .map_err(|e| Error::Validation(format!("invalid orchestrator version {raw:?}: {e}")))
}

/// Whether `current` → `target` is a declared, supported upgrade path.
///
/// Supported transitions stay within one major version and move forward by
/// at most one minor version (patch-level moves within a minor are allowed).
pub fn is_supported_upgrade_path(current: &Version, target: &Version) -> bool {
    if target <= current {
        return false;
    }
    current.major == target.major && target.minor - current.minor <= 1
}

/// Whether `version` is at or past the given minor boundary, expressed as
/// "major.minor.patch".
pub fn is_version_at_least(version: &Version, boundary: &Version) -> bool {
    version >= boundary
}
