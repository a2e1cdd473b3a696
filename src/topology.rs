//! Cluster inventory discovery.
//!
//! Walks the resource group and classifies every VM and scale-set instance
//! that belongs to the cluster: masters versus agents, already at the target
//! version versus still to be replaced. The version of a VM comes from its
//! orchestrator tag when present, falling back to the kubelet version the
//! node reports. Discovery is also where the upgrade-path preflight happens,
//! so an unsupported version jump fails before anything is touched.

use std::collections::BTreeMap;

use semver::Version;
use tracing::{debug, info, warn};

use crate::cloud::{CloudClient, OsType, ScaleSet, ScaleSetVm, VirtualMachine};
use crate::error::{Error, Result};
use crate::kube_api::{KubeApi, node_kubelet_version};
use crate::model::{ClusterModel, is_supported_upgrade_path, parse_version};
use crate::names;

/// Tag carried by cluster VMs, valued `<orchestrator>:<version>`.
pub const ORCHESTRATOR_TAG: &str = "orchestrator";

/// Tag naming the agent pool a VM belongs to.
pub const POOL_NAME_TAG: &str = "poolName";

/// Version placeholder used when the force flag skips version detection.
pub const UNKNOWN_VERSION: &str = "Unknown";

/// A VM slated for (or already through) an upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeVm {
    pub name: String,
    pub current_version: String,
    /// Provisioning state reported by the cloud, used to triage half-created
    /// VMs left behind by an earlier failed run.
    pub provisioning_state: Option<String>,
}

/// Per-pool split of availability-set agents.
#[derive(Debug, Clone, Default)]
pub struct AgentPoolTopology {
    pub pool_name: String,
    /// Identifier the pool's VM names are bucketed under, derived from the
    /// first VM classified into the pool.
    pub identifier: String,
    pub os_type: OsType,
    pub to_upgrade: Vec<UpgradeVm>,
    pub upgraded: Vec<UpgradeVm>,
}

/// One scale-set instance that still needs replacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleSetInstance {
    pub resource_name: String,
    pub instance_id: String,
    pub node_name: String,
}

/// A scale set with at least one instance to replace.
#[derive(Debug, Clone)]
pub struct ScaleSetTopology {
    pub scale_set: ScaleSet,
    pub pool_name: String,
    pub instances_to_upgrade: Vec<ScaleSetInstance>,
}

/// The full classified inventory of a cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterTopology {
    pub masters_to_upgrade: Vec<UpgradeVm>,
    pub masters_upgraded: Vec<UpgradeVm>,
    pub agent_pools: BTreeMap<String, AgentPoolTopology>,
    pub scale_sets: Vec<ScaleSetTopology>,
}

/// Classifies the cluster's VMs against the model's target version.
pub struct TopologyDiscovery<'a> {
    pub cloud: &'a dyn CloudClient,
    pub kube: &'a dyn KubeApi,
    pub model: &'a ClusterModel,
    pub resource_group: &'a str,
    /// Upgrade everything regardless of reported versions, and skip the
    /// upgrade-path preflight.
    pub force: bool,
}

impl TopologyDiscovery<'_> {
    pub async fn discover(&self) -> Result<ClusterTopology> {
        let target = self.model.target_version()?;
        let mut topology = ClusterTopology::default();

        let vms = self.cloud.list_virtual_machines(self.resource_group).await?;
        for vm in &vms {
            if names::is_master_vm(&vm.name) {
                if !self.model.hosted_master {
                    self.classify_master(vm, &target, &mut topology).await?;
                }
            } else {
                self.classify_agent(vm, &target, &mut topology).await?;
            }
        }

        let found_masters = topology.masters_to_upgrade.len() + topology.masters_upgraded.len();
        if found_masters > self.model.master_count {
            return Err(Error::Inventory(format!(
                "found {found_masters} master VMs but the cluster is configured for {}",
                self.model.master_count
            )));
        }

        self.discover_scale_sets(&target, &mut topology).await?;

        info!(
            masters_to_upgrade = topology.masters_to_upgrade.len(),
            masters_upgraded = topology.masters_upgraded.len(),
            agent_pools = topology.agent_pools.len(),
            scale_sets = topology.scale_sets.len(),
            "discovered cluster topology"
        );
        Ok(topology)
    }

    async fn classify_master(
        &self,
        vm: &VirtualMachine,
        target: &Version,
        topology: &mut ClusterTopology,
    ) -> Result<()> {
        if !vm.name.contains(&self.model.name_suffix) {
            debug!(vm = %vm.name, "skipping master VM from a different cluster");
            return Ok(());
        }
        let Some(version) = self.vm_version(vm).await? else {
            info!(vm = %vm.name, "skipping VM: its orchestrator version could not be determined");
            return Ok(());
        };
        let entry = UpgradeVm {
            name: vm.name.clone(),
            current_version: version.clone(),
            provisioning_state: vm.provisioning_state.clone(),
        };
        if !self.force && version == target.to_string() {
            debug!(vm = %vm.name, "master already at target version");
            topology.masters_upgraded.push(entry);
        } else {
            self.check_upgrade_path(&vm.name, &version, target)?;
            topology.masters_to_upgrade.push(entry);
        }
        Ok(())
    }

    async fn classify_agent(
        &self,
        vm: &VirtualMachine,
        target: &Version,
        topology: &mut ClusterTopology,
    ) -> Result<()> {
        if !self.vm_in_cluster(&vm.name) {
            debug!(vm = %vm.name, "skipping VM not named like a cluster agent");
            return Ok(());
        }
        let Some(pool_name) = self.agent_pool_name(vm) else {
            warn!(vm = %vm.name, "could not determine agent pool membership, skipping");
            return Ok(());
        };
        if self.model.agent_pool(&pool_name).is_none() {
            warn!(vm = %vm.name, pool = %pool_name, "VM references an unknown agent pool");
            return Ok(());
        }

        let Some(version) = self.vm_version(vm).await? else {
            info!(vm = %vm.name, "skipping VM: its orchestrator version could not be determined");
            return Ok(());
        };
        let entry = UpgradeVm {
            name: vm.name.clone(),
            current_version: version.clone(),
            provisioning_state: vm.provisioning_state.clone(),
        };
        let identifier = names::agent_pool_identifier(vm.os_type, &vm.name)
            .unwrap_or_else(|_| pool_name.clone());
        let pool = topology
            .agent_pools
            .entry(pool_name.clone())
            .or_insert_with(|| AgentPoolTopology {
                pool_name: pool_name.clone(),
                identifier,
                os_type: vm.os_type,
                ..Default::default()
            });
        if !self.force && version == target.to_string() {
            debug!(vm = %vm.name, pool = %pool_name, "agent already at target version");
            pool.upgraded.push(entry);
        } else {
            self.check_upgrade_path(&vm.name, &version, target)?;
            pool.to_upgrade.push(entry);
        }
        Ok(())
    }

    /// Cluster membership by name: Linux agents embed the full name suffix,
    /// Windows agents only its first four characters.
    fn vm_in_cluster(&self, name: &str) -> bool {
        if name.contains(&self.model.name_suffix) {
            return true;
        }
        match self.model.name_suffix.get(..4) {
            Some(prefix) => name.contains(&format!("{prefix}k8s")),
            None => false,
        }
    }

    /// Pool membership: an explicit poolName tag wins, then the pool encoded
    /// in the VM name, then the only pool when the model has exactly one.
    fn agent_pool_name(&self, vm: &VirtualMachine) -> Option<String> {
        if let Some(pool) = vm.tags.get(POOL_NAME_TAG).filter(|pool| !pool.is_empty()) {
            return Some(pool.clone());
        }
        debug!(vm = %vm.name, "poolName tag not found");
        if let Some(pool) = self.pool_name_from_vm_name(vm) {
            return Some(pool);
        }
        if let [pool] = self.model.agent_pools.as_slice() {
            return Some(pool.name.clone());
        }
        None
    }

    fn pool_name_from_vm_name(&self, vm: &VirtualMachine) -> Option<String> {
        match vm.os_type {
            OsType::Linux => {
                let parts = names::linux_agent_name_parts(&vm.name).ok()?;
                (parts.name_suffix == self.model.name_suffix).then_some(parts.pool_name)
            }
            OsType::Windows => {
                let parts = names::windows_agent_name_parts(&vm.name).ok()?;
                self.model
                    .agent_pools
                    .get(parts.pool_index)
                    .map(|pool| pool.name.clone())
            }
        }
    }

    async fn discover_scale_sets(
        &self,
        target: &Version,
        topology: &mut ClusterTopology,
    ) -> Result<()> {
        let scale_sets = self.cloud.list_scale_sets(self.resource_group).await?;
        for scale_set in scale_sets {
            let Some(pool_name) =
                names::scale_set_pool_name(self.model, &scale_set.name, scale_set.is_windows)
            else {
                debug!(scale_set = %scale_set.name, "skipping scale set from a different cluster");
                continue;
            };
            let vms = self
                .cloud
                .list_scale_set_vms(self.resource_group, &scale_set.name)
                .await?;
            let mut instances = Vec::new();
            for vm in vms {
                if self.scale_set_vm_needs_upgrade(&vm, target).await? {
                    let Some(node_name) = instance_node_name(&vm) else {
                        warn!(instance = %vm.name, "cannot determine node name for instance");
                        continue;
                    };
                    instances.push(ScaleSetInstance {
                        resource_name: vm.name,
                        instance_id: vm.instance_id,
                        node_name,
                    });
                }
            }
            if !instances.is_empty() {
                topology.scale_sets.push(ScaleSetTopology {
                    scale_set,
                    pool_name,
                    instances_to_upgrade: instances,
                });
            }
        }
        Ok(())
    }

    async fn scale_set_vm_needs_upgrade(&self, vm: &ScaleSetVm, target: &Version) -> Result<bool> {
        if self.force {
            return Ok(true);
        }
        let Some(version) = self.scale_set_vm_version(vm).await? else {
            info!(instance = %vm.name, "skipping instance: its orchestrator version could not be determined");
            return Ok(false);
        };
        if version == target.to_string() {
            return Ok(false);
        }
        self.check_upgrade_path(&vm.name, &version, target)?;
        Ok(true)
    }

    /// Version tags are only trustworthy on instances running the latest
    /// scale-set model; stale instances are asked their kubelet version.
    async fn scale_set_vm_version(&self, vm: &ScaleSetVm) -> Result<Option<String>> {
        if vm.latest_model_applied {
            if let Some(version) = orchestrator_tag_version(&vm.tags) {
                return Ok(Some(version));
            }
            warn!(instance = %vm.name, "expected orchestrator tag not found, asking its node");
        }
        let candidates = [
            (!vm.computer_name.is_empty()).then(|| vm.computer_name.to_lowercase()),
            names::scale_set_instance_node_name(&vm.name),
        ];
        for node_name in candidates.into_iter().flatten() {
            if let Some(node) = self.kube.get_node(&node_name).await? {
                if let Some(version) = node_kubelet_version(&node) {
                    debug!(instance = %vm.name, node = %node_name, %version, "read instance version from its node");
                    return Ok(Some(version));
                }
            }
        }
        Ok(None)
    }

    async fn vm_version(&self, vm: &VirtualMachine) -> Result<Option<String>> {
        if self.force {
            return Ok(Some(UNKNOWN_VERSION.to_string()));
        }
        if let Some(version) = orchestrator_tag_version(&vm.tags) {
            return Ok(Some(version));
        }
        // Untagged VM: fall back to what its kubelet reports.
        let node_name = vm.name.to_lowercase();
        if let Some(node) = self.kube.get_node(&node_name).await? {
            if let Some(version) = node_kubelet_version(&node) {
                return Ok(Some(version));
            }
        }
        Ok(None)
    }

    fn check_upgrade_path(&self, vm_name: &str, current: &str, target: &Version) -> Result<()> {
        if self.force || current == UNKNOWN_VERSION {
            return Ok(());
        }
        let current_version = parse_version(current)?;
        if is_supported_upgrade_path(&current_version, target) {
            Ok(())
        } else {
            warn!(vm = %vm_name, %current, target = %target, "unsupported upgrade path");
            Err(Error::UnsupportedUpgradePath {
                from: current.to_string(),
                to: target.to_string(),
            })
        }
    }
}

/// Version encoded in the orchestrator tag, when present and well formed.
fn orchestrator_tag_version(tags: &BTreeMap<String, String>) -> Option<String> {
    let value = tags.get(ORCHESTRATOR_TAG)?;
    let (_, version) = value.split_once(':')?;
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}

/// Kubernetes node name for a scale-set instance, preferring the reported
/// computer name over the reconstructed fallback.
pub(crate) fn instance_node_name(vm: &ScaleSetVm) -> Option<String> {
    if vm.computer_name.is_empty() {
        names::scale_set_instance_node_name(&vm.name)
    } else {
        Some(vm.computer_name.to_lowercase())
    }
}
