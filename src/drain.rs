//! Cordon and drain.
//!
//! Marks a node unschedulable and then removes its pods, preferring the
//! eviction subresource (which honors disruption budgets) when the apiserver
//! supports it. Mirror pods and DaemonSet-managed pods are left alone: the
//! former only exist as apiserver reflections of static manifests and the
//! latter would be recreated immediately.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

use crate::config::DrainConfig;
use crate::error::{Error, Result};
use crate::kube_api::KubeApi;

/// Annotation carried by mirror pods reflecting static manifests.
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Whether a pod should be removed from a node during a drain.
pub fn is_drainable(pod: &Pod) -> bool {
    if pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION))
    {
        return false;
    }
    let daemon_set_managed = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| {
            owners
                .iter()
                .any(|o| o.kind == "DaemonSet" && o.controller == Some(true))
        });
    !daemon_set_managed
}

/// Cordons a node and empties it of drainable pods.
pub struct Drainer<'a> {
    kube: &'a dyn KubeApi,
    config: &'a DrainConfig,
}

impl<'a> Drainer<'a> {
    pub fn new(kube: &'a dyn KubeApi, config: &'a DrainConfig) -> Self {
        Self { kube, config }
    }

    /// Cordon `node_name` and remove its drainable pods, waiting until each
    /// is observed gone. The whole operation is bounded by `timeout`; when
    /// the drain times out or fails, the pods still present are reported
    /// along with their warning events before the error is returned.
    pub async fn cordon_and_drain(&self, node_name: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        self.cordon(node_name).await?;
        debug!(node = %node_name, "waiting for cordon to settle");
        sleep(self.config.cordon_settle_delay).await;

        match timeout_at(deadline, self.drain_pods(node_name)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.report_stuck_pods(node_name).await;
                Err(err)
            }
            Err(_) => {
                self.report_stuck_pods(node_name).await;
                Err(Error::timeout(format!("drain of node {node_name}"), timeout))
            }
        }
    }

    /// Mark the node unschedulable, retrying optimistic-lock conflicts with
    /// a fresh read each time.
    async fn cordon(&self, node_name: &str) -> Result<()> {
        for attempt in 1..=self.config.cordon_max_retries {
            let Some(mut node) = self.kube.get_node(node_name).await? else {
                return Err(Error::Validation(format!(
                    "node {node_name} not found while cordoning"
                )));
            };
            if node
                .spec
                .as_ref()
                .is_some_and(|spec| spec.unschedulable == Some(true))
            {
                debug!(node = %node_name, "node already cordoned");
                return Ok(());
            }
            node.spec.get_or_insert_default().unschedulable = Some(true);
            match self.kube.replace_node(&node).await {
                Ok(_) => {
                    info!(node = %node_name, "cordoned node");
                    return Ok(());
                }
                Err(err) if err.is_resource_conflict() => {
                    debug!(node = %node_name, attempt, "cordon conflicted, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::Validation(format!(
            "exhausted {} attempts to cordon node {node_name}",
            self.config.cordon_max_retries
        )))
    }

    async fn drain_pods(&self, node_name: &str) -> Result<()> {
        let pods: Vec<Pod> = self
            .kube
            .list_pods_on_node(node_name)
            .await?
            .into_iter()
            .filter(is_drainable)
            .collect();
        if pods.is_empty() {
            info!(node = %node_name, "no pods to drain");
            return Ok(());
        }
        info!(node = %node_name, pods = pods.len(), "draining pods");

        if self.kube.supports_eviction().await? {
            let evictions = pods.iter().map(|pod| self.evict_pod(pod));
            futures::future::try_join_all(evictions).await?;
        } else {
            for pod in &pods {
                let (namespace, name) = pod_coordinates(pod);
                match self.kube.delete_pod(namespace, name).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err),
                }
            }
        }

        self.wait_for_delete(&pods).await
    }

    /// Evict one pod, retrying while a disruption budget blocks it.
    async fn evict_pod(&self, pod: &Pod) -> Result<()> {
        let (namespace, name) = pod_coordinates(pod);
        loop {
            match self.kube.evict_pod(namespace, name).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) if err.is_too_many_requests() => {
                    debug!(pod = %name, namespace = %namespace, "eviction blocked by disruption budget, retrying");
                    sleep(self.config.eviction_retry_interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Poll until every pod is gone or has been replaced under a new UID.
    async fn wait_for_delete(&self, pods: &[Pod]) -> Result<()> {
        let mut pending: Vec<(&str, &str, Option<&String>)> = pods
            .iter()
            .map(|pod| {
                let (namespace, name) = pod_coordinates(pod);
                (namespace, name, pod.metadata.uid.as_ref())
            })
            .collect();

        while !pending.is_empty() {
            let mut still_pending = Vec::with_capacity(pending.len());
            for (namespace, name, uid) in pending {
                match self.kube.get_pod(namespace, name).await? {
                    None => debug!(pod = %name, namespace = %namespace, "pod deleted"),
                    Some(current) if current.metadata.uid.as_ref() != uid => {
                        debug!(pod = %name, namespace = %namespace, "pod replaced under a new uid");
                    }
                    Some(_) => still_pending.push((namespace, name, uid)),
                }
            }
            pending = still_pending;
            if !pending.is_empty() {
                sleep(self.config.deletion_poll_interval).await;
            }
        }
        Ok(())
    }

    /// Best-effort diagnostics for a drain that ran out of time.
    async fn report_stuck_pods(&self, node_name: &str) {
        let pods = match self.kube.list_pods_on_node(node_name).await {
            Ok(pods) => pods,
            Err(err) => {
                warn!(node = %node_name, error = %err, "unable to list pods for drain diagnostics");
                return;
            }
        };
        for pod in pods.iter().filter(|p| is_drainable(p)) {
            let (namespace, name) = pod_coordinates(pod);
            warn!(pod = %name, namespace = %namespace, node = %node_name, "pod still present after drain timeout");
            if let Ok(events) = self.kube.pod_events(namespace, name).await {
                for event in events {
                    warn!(
                        pod = %name,
                        reason = event.reason.as_deref().unwrap_or(""),
                        message = event.message.as_deref().unwrap_or(""),
                        "pod event"
                    );
                }
            }
        }
    }
}

fn pod_coordinates(pod: &Pod) -> (&str, &str) {
    (
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or_default(),
    )
}
