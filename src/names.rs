//! VM and node naming conventions.
//!
//! Pool membership and per-node indices are derived from VM names, so the
//! formats here are load-bearing: discovery classifies nodes by them and the
//! pipeline reconstructs replacement VM names from them.
//!
//! Linux agent VMs:   `k8s-<suffix>-<pool>-<index>`  (suffix is 8 hex chars)
//! Master VMs:        `k8s-master-<suffix>-<index>`
//! Windows agent VMs: `<suffix[..4]>k8s<pool><index>` ("1708k8s020")
//! Scale sets:        `<prefix>-<suffix>-<pool>-vmss` / `<suffix[..4]>k8s<pool>-vmss`

use std::sync::LazyLock;

use regex::Regex;

use crate::cloud::OsType;
use crate::error::{Error, Result};
use crate::model::{AgentPoolProfile, ClusterModel, MASTER_VM_NAME_PREFIX};

#[allow(clippy::unwrap_used)]
static LINUX_AGENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-zA-Z]{3}-([0-9a-fA-F]{8})-(.+)-([0-9]+)$").unwrap());

#[allow(clippy::unwrap_used)]
static WINDOWS_AGENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-fA-F0-9]{4})([0-9a-zA-Z]{3})([0-9]{3,8})$").unwrap());

#[allow(clippy::unwrap_used)]
static WINDOWS_AGENT_NAME_OLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-fA-F0-9]{5})([0-9a-zA-Z]{3})(9)([a-zA-Z0-9]{3,5})$").unwrap());

#[allow(clippy::unwrap_used)]
static LINUX_VMSS_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-zA-Z]+-([0-9a-fA-F]{8})-(.+)-vmss$").unwrap());

#[allow(clippy::unwrap_used)]
static WINDOWS_VMSS_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-fA-F0-9]{4}k8s([0-9]{2,})-vmss$").unwrap());

/// Parsed parts of a Linux agent VM name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxAgentName {
    pub name_suffix: String,
    pub pool_name: String,
    pub index: usize,
}

/// Parsed parts of a Windows agent VM name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsAgentName {
    pub suffix_prefix: String,
    pub pool_index: usize,
    pub index: usize,
}

/// Whether a VM name names a master node.
pub fn is_master_vm(name: &str) -> bool {
    name.contains(MASTER_VM_NAME_PREFIX)
}

pub fn linux_agent_name_parts(name: &str) -> Result<LinuxAgentName> {
    let caps = LINUX_AGENT_NAME
        .captures(name)
        .ok_or_else(|| Error::InvalidName(name.to_string()))?;
    Ok(LinuxAgentName {
        name_suffix: caps[1].to_string(),
        pool_name: caps[2].to_string(),
        index: caps[3]
            .parse()
            .map_err(|_| Error::InvalidName(name.to_string()))?,
    })
}

pub fn windows_agent_name_parts(name: &str) -> Result<WindowsAgentName> {
    let (caps, pool_info_group) = match WINDOWS_AGENT_NAME_OLD.captures(name) {
        Some(caps) => (caps, 4),
        None => (
            WINDOWS_AGENT_NAME
                .captures(name)
                .ok_or_else(|| Error::InvalidName(name.to_string()))?,
            3,
        ),
    };
    let pool_info = &caps[pool_info_group];
    if pool_info.len() < 3 {
        return Err(Error::InvalidName(name.to_string()));
    }
    let (pool_digits, index_digits) = pool_info.split_at(2);
    Ok(WindowsAgentName {
        suffix_prefix: caps[1].to_string(),
        pool_index: pool_digits
            .parse()
            .map_err(|_| Error::InvalidName(name.to_string()))?,
        index: index_digits
            .parse()
            .map_err(|_| Error::InvalidName(name.to_string()))?,
    })
}

/// The stable numeric index embedded in a VM name.
pub fn vm_name_index(os_type: OsType, name: &str) -> Result<usize> {
    match os_type {
        OsType::Linux => {
            // Masters and Linux agents both carry a trailing "-<index>".
            let index = name
                .rsplit('-')
                .next()
                .ok_or_else(|| Error::InvalidName(name.to_string()))?;
            index
                .parse()
                .map_err(|_| Error::InvalidName(name.to_string()))
        }
        OsType::Windows => Ok(windows_agent_name_parts(name)?.index),
    }
}

/// The derived pool identifier a VM is bucketed under during discovery.
pub fn agent_pool_identifier(os_type: OsType, name: &str) -> Result<String> {
    match os_type {
        OsType::Linux => Ok(linux_agent_name_parts(name)?.pool_name),
        OsType::Windows => {
            // Old-format names carry a '9' marker at offset 8 and an 11-char
            // identifier; new-format identifiers are the first 9 chars.
            if name.len() >= 11 && name.as_bytes().get(8) == Some(&b'9') {
                Ok(name[..11].to_string())
            } else if name.len() >= 9 {
                Ok(name[..9].to_string())
            } else {
                Err(Error::InvalidName(name.to_string()))
            }
        }
    }
}

/// Reconstruct the VM name for an agent index, used when creating a
/// replacement node.
pub fn agent_vm_name(
    model: &ClusterModel,
    pool: &AgentPoolProfile,
    index: usize,
) -> Result<String> {
    match pool.os_type {
        OsType::Linux => Ok(format!(
            "k8s-{}-{}-{}",
            model.name_suffix, pool.name, index
        )),
        OsType::Windows => {
            let pool_index = model
                .agent_pool_index(&pool.name)
                .ok_or_else(|| Error::InvalidName(pool.name.clone()))?;
            let prefix = model
                .name_suffix
                .get(..4)
                .ok_or_else(|| Error::InvalidName(model.name_suffix.clone()))?;
            Ok(format!("{prefix}k8s{pool_index:02}{index}"))
        }
    }
}

/// Reconstruct the VM name for a master index.
pub fn master_vm_name(model: &ClusterModel, index: usize) -> String {
    format!("{}{}-{}", MASTER_VM_NAME_PREFIX, model.name_suffix, index)
}

/// Resolve the agent pool a scale set belongs to from its resource name.
/// Returns `None` for scale sets that do not belong to this cluster.
pub fn scale_set_pool_name(
    model: &ClusterModel,
    scale_set_name: &str,
    is_windows: bool,
) -> Option<String> {
    if is_windows {
        if !scale_set_name.starts_with(model.name_suffix.get(..4)?) {
            return None;
        }
        let caps = WINDOWS_VMSS_NAME.captures(scale_set_name)?;
        let pool_index: usize = caps[1].parse().ok()?;
        model.agent_pools.get(pool_index).map(|p| p.name.clone())
    } else {
        let caps = LINUX_VMSS_NAME.captures(scale_set_name)?;
        if &caps[1] != model.name_suffix {
            return None;
        }
        Some(caps[2].to_string())
    }
}

/// Compute the likely Kubernetes node name for a scale set instance resource
/// name of the form "<scale-set>_<instance>". The node name keeps the first
/// 28 characters of the scale set name and zero-pads the instance number to
/// six digits, so the overall name stays at 34 characters or less.
pub fn scale_set_instance_node_name(vm_name: &str) -> Option<String> {
    let (prefix, instance) = vm_name.split_once('_')?;
    let end = prefix.len().min(28);
    Some(format!("{}{:0>6}", &prefix[..end], instance))
}
