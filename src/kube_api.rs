//! Kubernetes API access.
//!
//! Everything that touches the apiserver goes through the [`KubeApi`] trait
//! so the upgrade pipeline can be driven against fakes in tests. The
//! [`KubeClient`] implementation is a thin layer over [`kube::Api`] typed
//! endpoints and deliberately carries no retry logic of its own; callers own
//! their retry policies.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Event, Node, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::rbac::v1::ClusterRole;
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::json;

use crate::error::Result;

/// The operations the upgrade pipeline needs from the apiserver.
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Fetch a node, mapping 404 to `None`.
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Replace a node object. Surfaces optimistic-lock conflicts (409) to
    /// the caller unchanged.
    async fn replace_node(&self, node: &Node) -> Result<Node>;

    async fn delete_node(&self, name: &str) -> Result<()>;

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;

    /// Fetch a pod, mapping 404 to `None`.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Ask the eviction subresource to remove a pod. Surfaces 429 (blocked
    /// by a disruption budget) to the caller unchanged.
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// Whether the apiserver serves the policy API group, which carries the
    /// eviction subresource.
    async fn supports_eviction(&self) -> Result<bool>;

    /// Events recorded against a pod, for surfacing scheduling failures.
    async fn pod_events(&self, namespace: &str, pod_name: &str) -> Result<Vec<Event>>;

    /// Fetch a persistent volume claim, mapping 404 to `None`.
    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>>;

    /// Fetch a persistent volume, mapping 404 to `None`.
    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_daemon_set(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_cluster_role(&self, name: &str) -> Result<()>;
}

/// [`KubeApi`] backed by a live [`kube::Client`].
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes().list(&ListParams::default()).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.nodes().get_opt(name).await?)
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .nodes()
            .replace(name, &PostParams::default(), node)
            .await?)
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.nodes().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        Ok(pods.list(&params).await?.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .evict(name, &EvictParams::default())
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn supports_eviction(&self) -> Result<bool> {
        match kube::discovery::group(&self.client, "policy").await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn pod_events(&self, namespace: &str, pod_name: &str) -> Result<Vec<Event>> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().fields(&format!(
            "involvedObject.name={pod_name},involvedObject.kind=Pod"
        ));
        Ok(events.list(&params).await?.items)
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(claims.get_opt(name).await?)
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(volumes.get_opt(name).await?)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(deployments.get_opt(name).await?)
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({"spec": {"replicas": replicas}});
        deployments
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        deployments.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_daemon_set(&self, namespace: &str, name: &str) -> Result<()> {
        let daemon_sets: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        daemon_sets.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_cluster_role(&self, name: &str) -> Result<()> {
        let roles: Api<ClusterRole> = Api::all(self.client.clone());
        roles.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

/// Whether a node is reporting `Ready`.
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// The kubelet version a node reports, normalized without a leading `v`.
pub fn node_kubelet_version(node: &Node) -> Option<String> {
    node.status
        .as_ref()
        .and_then(|status| status.node_info.as_ref())
        .map(|info| info.kubelet_version.trim_start_matches('v').to_string())
}
