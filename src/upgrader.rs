//! The four-phase upgrade pipeline.
//!
//! Phases run strictly in order: control-plane nodes one index at a time,
//! then removal of addons that cannot survive the 1.16 API boundary, then
//! scale-set agents, then availability-set agents. Every phase is written to
//! be re-entrant: a run that died halfway leaves the cluster in a state a
//! fresh discovery pass classifies correctly, and the next run picks up
//! where the last one stopped.

use std::collections::{BTreeSet, VecDeque};

use semver::Version;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::cloud::{CloudClient, ScaleSetVm};
use crate::config::{DrainConfig, Timings, VolumeWaitConfig};
use crate::drain::Drainer;
use crate::error::{Error, Result};
use crate::kube_api::KubeApi;
use crate::model::{
    AgentPoolProfile, ClusterModel, MASTER_POOL_NAME, is_version_at_least, parse_version,
};
use crate::names;
use crate::node::{
    AgentNodeUpgrader, MasterNodeUpgrader, NodeUpgraderContext, UpgradeNode, wait_for_node_ready,
};
use crate::template::{DeploymentTemplate, deployment_name};
use crate::topology::{
    AgentPoolTopology, ClusterTopology, ScaleSetTopology, instance_node_name,
};

const KUBE_SYSTEM: &str = "kube-system";

/// First version whose addon manifests cannot be reconciled in place.
const ADDON_BREAK_VERSION: Version = Version::new(1, 16, 0);

/// Drives a discovered topology to the model's target version.
pub struct Upgrader<'a> {
    pub cloud: &'a dyn CloudClient,
    pub kube: &'a dyn KubeApi,
    pub model: &'a ClusterModel,
    pub subscription_id: &'a str,
    pub resource_group: &'a str,
    pub template: DeploymentTemplate,
    pub timings: &'a Timings,
    pub drain_config: &'a DrainConfig,
    pub volume_config: &'a VolumeWaitConfig,
    /// Leave agent nodes untouched after the control plane is upgraded.
    pub control_plane_only: bool,
}

impl Upgrader<'_> {
    pub async fn run_upgrade(&self, topology: &ClusterTopology) -> Result<()> {
        self.upgrade_master_nodes(topology).await?;
        self.handle_unreconcilable_addons(topology).await?;
        if self.control_plane_only {
            info!("control-plane-only upgrade requested, leaving agents in place");
            return Ok(());
        }
        self.upgrade_agent_scale_sets(topology).await?;
        self.upgrade_agent_pools(topology).await
    }

    fn node_context(&self) -> NodeUpgraderContext<'_> {
        NodeUpgraderContext {
            cloud: self.cloud,
            kube: self.kube,
            subscription_id: self.subscription_id,
            resource_group: self.resource_group,
            template: self.template.clone(),
            timings: self.timings,
            drain_config: self.drain_config,
        }
    }

    /// Replace control-plane nodes sequentially, filling in any master
    /// indices that are missing entirely before touching live ones.
    async fn upgrade_master_nodes(&self, topology: &ClusterTopology) -> Result<()> {
        if self.model.hosted_master {
            return Ok(());
        }
        let upgrader = MasterNodeUpgrader {
            ctx: self.node_context(),
        };

        let mut present = BTreeSet::new();
        for vm in topology
            .masters_to_upgrade
            .iter()
            .chain(&topology.masters_upgraded)
        {
            present.insert(names::vm_name_index(crate::cloud::OsType::Linux, &vm.name)?);
        }
        for index in 0..self.model.master_count {
            if !present.contains(&index) {
                let vm_name = names::master_vm_name(self.model, index);
                info!(master = index, "recreating missing master");
                upgrader.create_node(MASTER_POOL_NAME, index).await?;
                upgrader.validate(&vm_name).await?;
            }
        }

        for vm in &topology.masters_to_upgrade {
            let index = names::vm_name_index(crate::cloud::OsType::Linux, &vm.name)?;
            info!(vm = %vm.name, from = %vm.current_version, "upgrading master");
            upgrader.delete_node(&vm.name, true).await?;
            upgrader.create_node(MASTER_POOL_NAME, index).await?;
            upgrader.validate(&vm.name).await?;
        }
        Ok(())
    }

    /// Best-effort removal of addons whose pre-1.16 manifests the new
    /// control plane cannot reconcile. Failures are logged, not fatal; the
    /// addon manager recreates everything at the target version.
    async fn handle_unreconcilable_addons(&self, topology: &ClusterTopology) -> Result<()> {
        let target = self.model.target_version()?;
        if !is_version_at_least(&target, &ADDON_BREAK_VERSION) {
            return Ok(());
        }
        let Some(current) = lowest_known_version(topology) else {
            return Ok(());
        };
        if is_version_at_least(&current, &ADDON_BREAK_VERSION) {
            return Ok(());
        }
        info!(from = %current, to = %target, "removing addons that cannot cross the 1.16 boundary");

        let removals = [
            ("DaemonSet kube-proxy", {
                self.kube.delete_daemon_set(KUBE_SYSTEM, "kube-proxy").await
            }),
            ("ClusterRole system:metrics-server", {
                self.kube.delete_cluster_role("system:metrics-server").await
            }),
            ("Deployment metrics-server", {
                self.kube
                    .delete_deployment(KUBE_SYSTEM, "metrics-server")
                    .await
            }),
        ];
        for (what, result) in removals {
            match result {
                Ok(()) => info!(addon = what, "removed"),
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!(addon = what, error = %err, "could not remove addon"),
            }
        }
        Ok(())
    }

    /// Replace scale-set instances one at a time, holding a one-instance
    /// capacity buffer so pool capacity never drops below its target.
    async fn upgrade_agent_scale_sets(&self, topology: &ClusterTopology) -> Result<()> {
        if topology.scale_sets.is_empty() {
            return Ok(());
        }
        // Redeploy the template so the scale-set models carry the target
        // version before any instance is replaced.
        let name = deployment_name("agents");
        info!(deployment = %name, "updating scale-set models");
        self.cloud
            .deploy_template(
                self.resource_group,
                &name,
                &self.template.template,
                &self.template.parameters,
            )
            .await?;

        for scale_set in &topology.scale_sets {
            self.upgrade_scale_set(scale_set).await?;
        }
        Ok(())
    }

    async fn upgrade_scale_set(&self, topology: &ScaleSetTopology) -> Result<()> {
        let scale_set = &topology.scale_set;
        let preserve = self
            .model
            .agent_pool(&topology.pool_name)
            .is_none_or(|pool| pool.preserve_nodes_properties);
        let drainer = Drainer::new(self.kube, self.drain_config);

        let mut known: BTreeSet<String> = self
            .cloud
            .list_scale_set_vms(self.resource_group, &scale_set.name)
            .await?
            .into_iter()
            .map(|vm| vm.name)
            .collect();

        info!(
            scale_set = %scale_set.name,
            instances = topology.instances_to_upgrade.len(),
            "upgrading scale set"
        );
        for instance in &topology.instances_to_upgrade {
            self.cloud
                .set_scale_set_capacity(
                    self.resource_group,
                    &scale_set.name,
                    &scale_set.sku_name,
                    scale_set.capacity + 1,
                    &scale_set.location,
                )
                .await?;

            let new_vm = self.wait_for_new_instance(&scale_set.name, &known).await?;
            known.insert(new_vm.name.clone());
            let new_node = instance_node_name(&new_vm).ok_or_else(|| {
                Error::Inventory(format!(
                    "cannot determine node name for new instance {}",
                    new_vm.name
                ))
            })?;
            wait_for_node_ready(
                self.kube,
                &new_node,
                self.timings.step_timeout,
                self.timings.validate_retry_interval,
            )
            .await?;

            if let Err(err) = drainer
                .cordon_and_drain(&instance.node_name, self.timings.cordon_drain_timeout)
                .await
            {
                warn!(node = %instance.node_name, error = %err, "error draining node, proceeding with deletion");
            }
            if preserve {
                if let Err(err) = self
                    .copy_custom_node_properties(&instance.node_name, &new_node)
                    .await
                {
                    warn!(old = %instance.node_name, new = %new_node, error = %err, "failed to copy node properties");
                }
            }

            info!(instance = %instance.resource_name, replacement = %new_node, "deleting old instance");
            self.cloud
                .delete_scale_set_vm(self.resource_group, &scale_set.name, &instance.instance_id)
                .await?;
            known.remove(&instance.resource_name);
        }
        Ok(())
    }

    /// Poll for the instance a capacity bump created.
    async fn wait_for_new_instance(
        &self,
        scale_set: &str,
        known: &BTreeSet<String>,
    ) -> Result<ScaleSetVm> {
        let timeout = self.timings.step_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let vms = self
                .cloud
                .list_scale_set_vms(self.resource_group, scale_set)
                .await?;
            if let Some(vm) = vms.into_iter().find(|vm| !known.contains(&vm.name)) {
                return Ok(vm);
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout(
                    format!("new instance in scale set {scale_set}"),
                    timeout,
                ));
            }
            sleep(self.timings.validate_retry_interval).await;
        }
    }

    /// Carry annotations, labels, and taints from a drained node over to its
    /// replacement. Values already present on the replacement win; taint
    /// values naming the old node are rewritten to the new one. The
    /// replacement ends up schedulable regardless of what was copied.
    async fn copy_custom_node_properties(&self, old_name: &str, new_name: &str) -> Result<()> {
        // Keep workloads off the replacement while its metadata is still
        // being written; the final update marks it schedulable again.
        let drainer = Drainer::new(self.kube, self.drain_config);
        if let Err(err) = drainer
            .cordon_and_drain(new_name, self.timings.cordon_drain_timeout)
            .await
        {
            warn!(node = %new_name, error = %err, "error draining replacement node, proceeding with property copy");
        }

        let timeout = self.timings.node_properties_copy_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_copy_node_properties(old_name, new_name).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_resource_conflict() || err.is_retryable() => {
                    warn!(old = %old_name, new = %new_name, error = %err, "retrying node property copy");
                }
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout(
                    format!("property copy from {old_name} to {new_name}"),
                    timeout,
                ));
            }
            sleep(self.timings.properties_copy_retry_interval).await;
        }
    }

    async fn try_copy_node_properties(&self, old_name: &str, new_name: &str) -> Result<()> {
        let Some(old_node) = self.kube.get_node(old_name).await? else {
            warn!(node = %old_name, "old node gone before its properties were copied");
            return Ok(());
        };
        let Some(mut new_node) = self.kube.get_node(new_name).await? else {
            return Err(Error::Validation(format!(
                "replacement node {new_name} not registered"
            )));
        };

        if let Some(annotations) = &old_node.metadata.annotations {
            let merged = new_node.metadata.annotations.get_or_insert_default();
            for (key, value) in annotations {
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        if let Some(labels) = &old_node.metadata.labels {
            let merged = new_node.metadata.labels.get_or_insert_default();
            for (key, value) in labels {
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        let old_taints = old_node
            .spec
            .as_ref()
            .and_then(|spec| spec.taints.clone())
            .unwrap_or_default();
        let new_spec = new_node.spec.get_or_insert_default();
        let existing = new_spec.taints.take().unwrap_or_default();
        let mut taints = existing;
        for mut taint in old_taints {
            let duplicate = taints
                .iter()
                .any(|t| t.key == taint.key && t.effect == taint.effect);
            if duplicate {
                continue;
            }
            if taint.value.as_deref() == Some(old_name) {
                taint.value = Some(new_name.to_string());
            }
            taints.push(taint);
        }
        if !taints.is_empty() {
            new_spec.taints = Some(taints);
        }
        new_spec.unschedulable = Some(false);

        self.kube.replace_node(&new_node).await?;
        info!(old = %old_name, new = %new_name, "copied node properties");
        Ok(())
    }

    /// Replace availability-set agents pool by pool, keeping one spare node
    /// ahead of each deletion so pool capacity never dips below its target.
    async fn upgrade_agent_pools(&self, topology: &ClusterTopology) -> Result<()> {
        for pool in &self.model.agent_pools {
            if pool.uses_scale_sets {
                continue;
            }
            let Some(pool_topology) = topology.agent_pools.get(&pool.name) else {
                continue;
            };
            if pool.count == 0 {
                continue;
            }
            self.upgrade_agent_pool(pool, pool_topology).await?;
        }
        Ok(())
    }

    async fn upgrade_agent_pool(
        &self,
        pool: &AgentPoolProfile,
        pool_topology: &AgentPoolTopology,
    ) -> Result<()> {
        let (to_upgrade, upgraded) = (&pool_topology.to_upgrade, &pool_topology.upgraded);
        info!(
            pool = %pool.name,
            identifier = %pool_topology.identifier,
            "starting upgrade of agent pool"
        );
        let upgrader = AgentNodeUpgrader {
            ctx: self.node_context(),
            volume_config: self.volume_config,
        };

        let mut used = BTreeSet::new();
        for vm in to_upgrade.iter().chain(upgraded) {
            used.insert(names::vm_name_index(pool.os_type, &vm.name)?);
        }

        // Triage VMs that already carry the target version but came out of a
        // previous run in a bad provisioning state. A failed deployment is
        // deleted outright (nothing on it is worth draining) and recreated
        // by the fill loop below; a VM mid-deletion is left alone but keeps
        // its index reserved so nothing new collides with it.
        let mut ignored = 0usize;
        for vm in upgraded {
            match vm.provisioning_state.as_deref() {
                Some("Creating" | "Updating" | "Succeeded") => {}
                Some("Failed") => {
                    warn!(vm = %vm.name, "deleting VM left in a failed provisioning state");
                    upgrader.delete_node(&vm.name, false).await?;
                    used.remove(&names::vm_name_index(pool.os_type, &vm.name)?);
                }
                state => {
                    info!(vm = %vm.name, state = ?state, "ignoring VM in a transitional provisioning state");
                    ignored += 1;
                }
            }
        }

        // Recreate missing nodes and, when replacements are pending, one
        // buffer node so capacity never dips below the pool's target. Nodes
        // created here are remembered in order so each deleted node can hand
        // its properties to the replacement that took its place.
        let buffer = usize::from(!to_upgrade.is_empty());
        let mut created = VecDeque::new();
        self.grow_pool_to(&upgrader, pool, &mut used, pool.count + buffer + ignored, &mut created)
            .await?;
        if to_upgrade.is_empty() {
            return Ok(());
        }

        info!(pool = %pool.name, vms = to_upgrade.len(), "upgrading agent pool");
        let last = to_upgrade.len() - 1;
        for (position, vm) in to_upgrade.iter().enumerate() {
            info!(vm = %vm.name, from = %vm.current_version, "upgrading agent");
            if pool.preserve_nodes_properties {
                if let Some(new_node) = created.pop_front() {
                    if let Err(err) = self
                        .copy_custom_node_properties(&vm.name.to_lowercase(), &new_node)
                        .await
                    {
                        warn!(old = %vm.name, new = %new_node, error = %err, "failed to copy node properties");
                    }
                }
            }
            upgrader.delete_node(&vm.name, true).await?;
            used.remove(&names::vm_name_index(pool.os_type, &vm.name)?);

            // The buffer covers the final deletion, so the pool lands
            // exactly on its target count.
            let desired = if position == last {
                pool.count + ignored
            } else {
                pool.count + 1 + ignored
            };
            self.grow_pool_to(&upgrader, pool, &mut used, desired, &mut created)
                .await?;
        }
        Ok(())
    }

    async fn grow_pool_to(
        &self,
        upgrader: &AgentNodeUpgrader<'_>,
        pool: &AgentPoolProfile,
        used: &mut BTreeSet<usize>,
        desired: usize,
        created: &mut VecDeque<String>,
    ) -> Result<()> {
        while used.len() < desired {
            let index = next_available_index(used);
            let vm_name = names::agent_vm_name(self.model, pool, index)?;
            info!(vm = %vm_name, pool = %pool.name, "creating agent node");
            upgrader.create_node(&pool.name, index).await?;
            upgrader.validate(&vm_name).await?;
            used.insert(index);
            created.push_back(vm_name.to_lowercase());
        }
        Ok(())
    }
}

/// The next never-used VM index: one past the highest seen. Reusing a lower
/// hole would collide with resources a failed run may have left behind.
fn next_available_index(used: &BTreeSet<usize>) -> usize {
    used.iter().next_back().map_or(0, |highest| highest + 1)
}

/// The lowest parseable version among VMs still to be upgraded.
fn lowest_known_version(topology: &ClusterTopology) -> Option<Version> {
    topology
        .masters_to_upgrade
        .iter()
        .chain(
            topology
                .agent_pools
                .values()
                .flat_map(|pool| pool.to_upgrade.iter()),
        )
        .filter_map(|vm| parse_version(&vm.current_version).ok())
        .min()
}
