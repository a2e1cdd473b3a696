//! Cluster upgrade entry point.
//!
//! Ties discovery, template generation, and the pipeline together, and
//! brackets the whole run with a cluster-autoscaler pause so capacity
//! changes made during the upgrade are not fought by the autoscaler.

use tracing::{info, warn};

use crate::cloud::CloudClient;
use crate::config::{DrainConfig, Timings, VolumeWaitConfig};
use crate::error::Result;
use crate::kube_api::KubeApi;
use crate::model::ClusterModel;
use crate::template::TemplateGenerator;
use crate::topology::{ClusterTopology, TopologyDiscovery};
use crate::upgrader::Upgrader;

const KUBE_SYSTEM: &str = "kube-system";
const AUTOSCALER_DEPLOYMENT: &str = "cluster-autoscaler";

/// Behavioral switches for a single upgrade run.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpgradeOptions {
    /// Replace every node regardless of reported version, skip the
    /// upgrade-path preflight, and demote autoscaler failures to warnings.
    pub force: bool,
    /// Upgrade only the control plane.
    pub control_plane_only: bool,
}

/// Upgrades one cluster to its model's target version.
pub struct UpgradeCluster<'a> {
    pub cloud: &'a dyn CloudClient,
    pub kube: &'a dyn KubeApi,
    pub subscription_id: &'a str,
    pub resource_group: &'a str,
    pub timings: Timings,
    pub drain_config: DrainConfig,
    pub volume_config: VolumeWaitConfig,
    pub options: UpgradeOptions,
}

impl UpgradeCluster<'_> {
    /// Discover the cluster's inventory and drive every out-of-date node to
    /// the target version.
    pub async fn upgrade_cluster(
        &self,
        model: &ClusterModel,
        generator: &dyn TemplateGenerator,
    ) -> Result<()> {
        let target = model.target_version()?;
        info!(
            resource_group = %self.resource_group,
            target = %target,
            force = self.options.force,
            "starting cluster upgrade"
        );

        let discovery = TopologyDiscovery {
            cloud: self.cloud,
            kube: self.kube,
            model,
            resource_group: self.resource_group,
            force: self.options.force,
        };
        let topology = discovery.discover().await?;
        if is_fully_upgraded(&topology) {
            info!(target = %target, "cluster is already at the target version");
            return Ok(());
        }

        let template = generator.generate(model)?;

        // The autoscaler would treat buffer nodes as surplus and scale them
        // away mid-swap, so it sits out the agent phases.
        let restore_replicas = if self.options.control_plane_only {
            None
        } else {
            self.pause_autoscaler().await?
        };

        let upgrader = Upgrader {
            cloud: self.cloud,
            kube: self.kube,
            model,
            subscription_id: self.subscription_id,
            resource_group: self.resource_group,
            template,
            timings: &self.timings,
            drain_config: &self.drain_config,
            volume_config: &self.volume_config,
            control_plane_only: self.options.control_plane_only,
        };
        let outcome = upgrader.run_upgrade(&topology).await;

        if let Some(replicas) = restore_replicas {
            self.resume_autoscaler(replicas).await?;
        }
        outcome?;
        info!(target = %target, "cluster upgrade complete");
        Ok(())
    }

    /// Scale the cluster-autoscaler to zero, remembering its replica count.
    /// Returns `None` when there is no autoscaler (or it is already off).
    async fn pause_autoscaler(&self) -> Result<Option<i32>> {
        match self.try_pause_autoscaler().await {
            Ok(replicas) => Ok(replicas),
            Err(err) if self.options.force => {
                warn!(error = %err, "could not pause the cluster autoscaler, continuing anyway");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn try_pause_autoscaler(&self) -> Result<Option<i32>> {
        let Some(deployment) = self
            .kube
            .get_deployment(KUBE_SYSTEM, AUTOSCALER_DEPLOYMENT)
            .await?
        else {
            return Ok(None);
        };
        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(0);
        if replicas == 0 {
            return Ok(None);
        }
        info!(replicas, "pausing the cluster autoscaler");
        self.kube
            .scale_deployment(KUBE_SYSTEM, AUTOSCALER_DEPLOYMENT, 0)
            .await?;
        Ok(Some(replicas))
    }

    async fn resume_autoscaler(&self, replicas: i32) -> Result<()> {
        info!(replicas, "resuming the cluster autoscaler");
        match self
            .kube
            .scale_deployment(KUBE_SYSTEM, AUTOSCALER_DEPLOYMENT, replicas)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if self.options.force => {
                warn!(error = %err, "could not resume the cluster autoscaler");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn is_fully_upgraded(topology: &ClusterTopology) -> bool {
    topology.masters_to_upgrade.is_empty()
        && topology.scale_sets.is_empty()
        && topology
            .agent_pools
            .values()
            .all(|pool| pool.to_upgrade.is_empty())
}
