//! Per-node replacement primitives.
//!
//! A node upgrade is always the same three-step dance: delete the old node
//! (drain, tear down the VM, deregister), deploy a replacement through the
//! template, and wait for the replacement to report `Ready`. Masters and
//! agents differ in how the template window is addressed and in what extra
//! care the delete step takes, so each gets its own [`UpgradeNode`]
//! implementation.

use async_trait::async_trait;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::cloud::CloudClient;
use crate::config::{DrainConfig, Timings, VolumeWaitConfig};
use crate::drain::Drainer;
use crate::error::{Error, Result};
use crate::kube_api::{KubeApi, node_is_ready};
use crate::model::MASTER_POOL_NAME;
use crate::teardown::clean_delete_virtual_machine;
use crate::template::{DeploymentTemplate, deployment_name};
use crate::volumes::VolumeAttachmentWaiter;

/// The delete / create / validate contract both node kinds implement.
#[async_trait]
pub trait UpgradeNode: Send + Sync {
    /// Remove the node: drain it (when asked to), tear down its VM, and
    /// deregister it from the apiserver.
    async fn delete_node(&self, vm_name: &str, drain: bool) -> Result<()>;

    /// Deploy a replacement node at `index` in `pool_name`.
    async fn create_node(&self, pool_name: &str, index: usize) -> Result<()>;

    /// Wait for the replacement to register and report `Ready`. An empty
    /// `vm_name` is a no-op, for callers that only scaled capacity.
    async fn validate(&self, vm_name: &str) -> Result<()>;
}

/// Everything a node upgrader needs to act on one cluster.
pub struct NodeUpgraderContext<'a> {
    pub cloud: &'a dyn CloudClient,
    pub kube: &'a dyn KubeApi,
    pub subscription_id: &'a str,
    pub resource_group: &'a str,
    pub template: DeploymentTemplate,
    pub timings: &'a Timings,
    pub drain_config: &'a DrainConfig,
}

impl NodeUpgraderContext<'_> {
    async fn deregister(&self, node_name: &str) -> Result<()> {
        match self.kube.delete_node(node_name).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn wait_for_node_ready(&self, node_name: &str) -> Result<()> {
        wait_for_node_ready(
            self.kube,
            node_name,
            self.timings.step_timeout,
            self.timings.validate_retry_interval,
        )
        .await
    }
}

/// Poll until `node_name` registers and reports `Ready`. Transient API
/// errors are tolerated until the timeout expires.
pub async fn wait_for_node_ready(
    kube: &dyn KubeApi,
    node_name: &str,
    timeout: std::time::Duration,
    interval: std::time::Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        match kube.get_node(node_name).await {
            Ok(Some(node)) if node_is_ready(&node) => {
                info!(node = %node_name, "node is ready");
                return Ok(());
            }
            Ok(_) => {}
            Err(err) => {
                warn!(node = %node_name, error = %err, "transient error while polling node readiness");
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::timeout(
                format!("readiness of node {node_name}"),
                timeout,
            ));
        }
        sleep(interval).await;
    }
}

/// Replaces control-plane nodes one index at a time.
pub struct MasterNodeUpgrader<'a> {
    pub ctx: NodeUpgraderContext<'a>,
}

#[async_trait]
impl UpgradeNode for MasterNodeUpgrader<'_> {
    // The `drain` flag is not used for master nodes: the apiserver being
    // replaced is the one that would serve the eviction calls.
    async fn delete_node(&self, vm_name: &str, _drain: bool) -> Result<()> {
        clean_delete_virtual_machine(
            self.ctx.cloud,
            self.ctx.subscription_id,
            self.ctx.resource_group,
            vm_name,
        )
        .await?;
        self.ctx.deregister(&vm_name.to_lowercase()).await
    }

    async fn create_node(&self, _pool_name: &str, index: usize) -> Result<()> {
        let mut template = self.ctx.template.clone();
        template.set_master_window(index)?;
        let name = deployment_name(MASTER_POOL_NAME);
        info!(deployment = %name, master = index, "deploying replacement master");
        self.ctx
            .cloud
            .deploy_template(
                self.ctx.resource_group,
                &name,
                &template.template,
                &template.parameters,
            )
            .await?;
        Ok(())
    }

    async fn validate(&self, vm_name: &str) -> Result<()> {
        if vm_name.is_empty() {
            return Ok(());
        }
        self.ctx.wait_for_node_ready(&vm_name.to_lowercase()).await
    }
}

/// Replaces worker nodes, waiting for their disks to follow the workloads.
pub struct AgentNodeUpgrader<'a> {
    pub ctx: NodeUpgraderContext<'a>,
    pub volume_config: &'a VolumeWaitConfig,
}

#[async_trait]
impl UpgradeNode for AgentNodeUpgrader<'_> {
    async fn delete_node(&self, vm_name: &str, drain: bool) -> Result<()> {
        let node_name = vm_name.to_lowercase();
        // A node that never registered has nothing to drain.
        let registered = self.ctx.kube.get_node(&node_name).await?.is_some();
        if drain && registered {
            let pods = self.ctx.kube.list_pods_on_node(&node_name).await?;
            let drainer = Drainer::new(self.ctx.kube, self.ctx.drain_config);
            match drainer
                .cordon_and_drain(&node_name, self.ctx.timings.cordon_drain_timeout)
                .await
            {
                Ok(()) => {
                    let waiter = VolumeAttachmentWaiter::new(self.ctx.kube, self.volume_config);
                    if let Err(err) = waiter.wait_for_disks_attached(&pods).await {
                        warn!(node = %node_name, error = %err, "proceeding without full disk reattachment");
                    }
                }
                Err(err) => {
                    warn!(node = %node_name, error = %err, "error draining node, proceeding with deletion");
                }
            }
        }
        clean_delete_virtual_machine(
            self.ctx.cloud,
            self.ctx.subscription_id,
            self.ctx.resource_group,
            vm_name,
        )
        .await?;
        if registered {
            if let Err(err) = self.ctx.deregister(&node_name).await {
                warn!(node = %node_name, error = %err, "error deregistering node");
            }
        }
        Ok(())
    }

    async fn create_node(&self, pool_name: &str, index: usize) -> Result<()> {
        let mut template = self.ctx.template.clone();
        template.set_agent_window(pool_name, index)?;
        let name = deployment_name(pool_name);
        info!(deployment = %name, pool = %pool_name, agent = index, "deploying replacement agent");
        self.ctx
            .cloud
            .deploy_template(
                self.ctx.resource_group,
                &name,
                &template.template,
                &template.parameters,
            )
            .await?;
        Ok(())
    }

    async fn validate(&self, vm_name: &str) -> Result<()> {
        if vm_name.is_empty() {
            return Ok(());
        }
        self.ctx.wait_for_node_ready(&vm_name.to_lowercase()).await
    }
}
