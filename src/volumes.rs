//! Waiting for persistent disks to reattach.
//!
//! After a node is drained, a StatefulSet pod mounting cloud disks through
//! persistent volume claims cannot run on its replacement node until the
//! platform detaches the disks from the old VM and attaches them to the new
//! one. The waiter polls each such pod until every disk behind its claims
//! shows up in its new node's attached-volume list, and gives up early when
//! the scheduler reports that no node can take another disk, since waiting
//! longer cannot fix that.

use std::sync::LazyLock;

use k8s_openapi::api::core::v1::{Pod, PodCondition};
use regex::Regex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::VolumeWaitConfig;
use crate::error::{Error, Result};
use crate::kube_api::KubeApi;

/// The in-tree provisioner whose disks are tracked on node status.
pub const AZURE_DISK_PROVISIONER: &str = "kubernetes.io/azure-disk";

/// Annotation naming the provisioner that created a persistent volume.
pub const PROVISIONED_BY_ANNOTATION: &str = "pv.kubernetes.io/provisioned-by";

#[allow(clippy::unwrap_used)]
static MAX_VOLUME_COUNT_EXCEEDED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"0/[0-9]+ nodes are available:.*exceed max volume count").unwrap()
});

/// Whether a pod is managed by a StatefulSet. Only those pods keep their
/// identity, and so their claims, across an eviction.
pub fn pod_owned_by_stateful_set(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|owner| owner.kind == "StatefulSet"))
}

/// Claim names a pod mounts as persistent-volume-claim volumes.
pub fn pod_volume_claims(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter_map(|v| v.persistent_volume_claim.as_ref())
                .map(|claim| claim.claim_name.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Waits for a set of pods to have their disks attached on whichever nodes
/// they were rescheduled to.
pub struct VolumeAttachmentWaiter<'a> {
    kube: &'a dyn KubeApi,
    config: &'a VolumeWaitConfig,
}

impl<'a> VolumeAttachmentWaiter<'a> {
    pub fn new(kube: &'a dyn KubeApi, config: &'a VolumeWaitConfig) -> Self {
        Self { kube, config }
    }

    /// Wait until every claim-bearing StatefulSet pod in `pods` has the
    /// disks behind its claims attached. Other pods are ignored. Fails
    /// fast, cancelling the remaining waits, when any pod becomes
    /// unschedulable because the cluster hit its per-node disk limit.
    pub async fn wait_for_disks_attached(&self, pods: &[Pod]) -> Result<()> {
        let tracked: Vec<&Pod> = pods
            .iter()
            .filter(|pod| pod_owned_by_stateful_set(pod) && !pod_volume_claims(pod).is_empty())
            .collect();
        if tracked.is_empty() {
            return Ok(());
        }
        info!(pods = tracked.len(), "waiting for disks to reattach");

        let cancel = CancellationToken::new();
        let waits = tracked.iter().map(|pod| {
            let cancel = cancel.clone();
            async move {
                tokio::select! {
                    result = self.wait_for_pod(pod, &cancel) => result,
                    () = cancel.cancelled() => Err(Error::Validation(
                        "disk attachment wait cancelled".to_string(),
                    )),
                }
            }
        });

        match tokio::time::timeout(self.config.timeout, futures::future::try_join_all(waits)).await
        {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(Error::timeout(
                "disk reattachment".to_string(),
                self.config.timeout,
            )),
        }
    }

    async fn wait_for_pod(&self, pod: &Pod, cancel: &CancellationToken) -> Result<()> {
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        loop {
            // An evicted StatefulSet pod is recreated under the same name,
            // so a missing pod just has not come back yet.
            let Some(current) = self.kube.get_pod(namespace, name).await? else {
                debug!(pod = %name, "pod not rescheduled yet");
                sleep(self.config.poll_interval).await;
                continue;
            };

            if let Some(condition) = scheduling_failure(&current) {
                let message = condition.message.as_deref().unwrap_or_default();
                if MAX_VOLUME_COUNT_EXCEEDED.is_match(message) {
                    warn!(pod = %name, "pod cannot schedule: node disk limit exceeded");
                    cancel.cancel();
                    return Err(Error::Validation(format!(
                        "pod {namespace}/{name} exceeds the per-node disk attachment limit"
                    )));
                }
                info!(pod = %name, %message, "pod cannot be scheduled, giving up on its volumes");
                return Ok(());
            }

            let node_name = current.spec.as_ref().and_then(|s| s.node_name.as_deref());
            if let Some(node_name) = node_name {
                if self.all_disks_attached(namespace, &current, node_name).await? {
                    info!(pod = %name, node = %node_name, "all disks attached");
                    return Ok(());
                }
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Resolve each of the pod's claims to its volume and check the disks of
    /// azure-disk-provisioned volumes against the node's attached list.
    async fn all_disks_attached(&self, namespace: &str, pod: &Pod, node_name: &str) -> Result<bool> {
        let Some(node) = self.kube.get_node(node_name).await? else {
            return Ok(false);
        };
        let attached = node
            .status
            .as_ref()
            .and_then(|status| status.volumes_attached.clone())
            .unwrap_or_default();

        for claim_name in pod_volume_claims(pod) {
            let Some(claim) = self
                .kube
                .get_persistent_volume_claim(namespace, &claim_name)
                .await?
            else {
                debug!(claim = %claim_name, "claim not found yet");
                return Ok(false);
            };
            let Some(volume_name) = claim.spec.as_ref().and_then(|s| s.volume_name.clone()) else {
                debug!(claim = %claim_name, "claim not bound yet");
                return Ok(false);
            };
            let Some(volume) = self.kube.get_persistent_volume(&volume_name).await? else {
                debug!(volume = %volume_name, "volume not found yet");
                return Ok(false);
            };

            let provisioned_by = volume
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(PROVISIONED_BY_ANNOTATION));
            if provisioned_by.map(String::as_str) != Some(AZURE_DISK_PROVISIONER) {
                continue;
            }
            let Some(disk_uri) = volume
                .spec
                .as_ref()
                .and_then(|s| s.azure_disk.as_ref())
                .map(|disk| disk.disk_uri.clone())
            else {
                continue;
            };

            let key = format!("{AZURE_DISK_PROVISIONER}/{disk_uri}");
            if !attached.iter().any(|v| v.name == key) {
                debug!(volume = %volume_name, node = %node_name, "disk not attached yet");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// The pod's scheduling condition when the scheduler has given up on it.
fn scheduling_failure(pod: &Pod) -> Option<&PodCondition> {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())?
        .iter()
        .find(|c| c.type_ == "PodScheduled" && c.reason.as_deref() == Some("Unschedulable"))
}
