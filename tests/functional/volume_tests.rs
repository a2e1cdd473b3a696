//! Disk reattachment waiting.

use std::time::Duration;

use k8s_openapi::api::core::v1::{AttachedVolume, PodCondition};

use node_rollover::config::VolumeWaitConfig;
use node_rollover::volumes::{AZURE_DISK_PROVISIONER, VolumeAttachmentWaiter};

use crate::fake_clients::FakeCluster;

const NODE: &str = "k8s-37117985-agentpool1-0";
const DISK_URI: &str = "/subscriptions/sub/disks/data-disk";

fn fast_config() -> VolumeWaitConfig {
    VolumeWaitConfig {
        timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
    }
}

fn cluster_with_stateful_pod() -> FakeCluster {
    let cluster = FakeCluster::new("37117985", "1.18.2", &["agentpool1"]);
    cluster.add_agent("agentpool1", 0, "1.17.11");
    cluster.add_stateful_pod("default", "db-0", NODE, DISK_URI);
    cluster
}

fn attach_disk(cluster: &FakeCluster, node: &str, disk_uri: &str) {
    cluster.with_state(|state| {
        let node = state.nodes.get_mut(node).unwrap();
        node.status
            .as_mut()
            .unwrap()
            .volumes_attached
            .get_or_insert_default()
            .push(AttachedVolume {
                name: format!("{AZURE_DISK_PROVISIONER}/{disk_uri}"),
                device_path: "/dev/disk/azure/scsi1/lun0".to_string(),
            });
    });
}

fn mark_unschedulable(cluster: &FakeCluster, namespace: &str, name: &str) {
    cluster.with_state(|state| {
        let pod = state
            .pods
            .get_mut(&(namespace.to_string(), name.to_string()))
            .unwrap();
        pod.spec.as_mut().unwrap().node_name = None;
        pod.status.get_or_insert_default().conditions = Some(vec![PodCondition {
            type_: "PodScheduled".to_string(),
            status: "False".to_string(),
            reason: Some("Unschedulable".to_string()),
            message: Some("0/3 nodes are available: 3 node(s) exceed max volume count.".to_string()),
            ..Default::default()
        }]);
    });
}

#[tokio::test]
async fn test_wait_succeeds_once_disks_show_attached() {
    let cluster = cluster_with_stateful_pod();
    let pods = cluster.with_state(|state| state.pods.values().cloned().collect::<Vec<_>>());

    // Attach the disk a few poll intervals in.
    let delayed = cluster.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        attach_disk(&delayed, NODE, DISK_URI);
    });

    let kube = cluster.kube();
    let config = fast_config();
    VolumeAttachmentWaiter::new(&kube, &config)
        .wait_for_disks_attached(&pods)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_wait_ignores_pods_without_claims() {
    let cluster = FakeCluster::new("37117985", "1.18.2", &["agentpool1"]);
    cluster.add_agent("agentpool1", 0, "1.17.11");
    cluster.add_pod("default", "web-0", NODE);
    let pods = cluster.with_state(|state| state.pods.values().cloned().collect::<Vec<_>>());

    let kube = cluster.kube();
    let config = fast_config();
    VolumeAttachmentWaiter::new(&kube, &config)
        .wait_for_disks_attached(&pods)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_wait_ignores_claim_pods_not_owned_by_a_stateful_set() {
    // Same claim-bearing pod, but owned by nothing: replacements will get
    // fresh claims, so there is no disk handoff to wait for.
    let cluster = cluster_with_stateful_pod();
    cluster.with_state(|state| {
        let pod = state
            .pods
            .get_mut(&("default".to_string(), "db-0".to_string()))
            .unwrap();
        pod.metadata.owner_references = None;
    });
    let pods = cluster.with_state(|state| state.pods.values().cloned().collect::<Vec<_>>());

    let started = tokio::time::Instant::now();
    let kube = cluster.kube();
    let config = fast_config();
    VolumeAttachmentWaiter::new(&kube, &config)
        .wait_for_disks_attached(&pods)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_wait_fails_fast_when_disk_limit_exceeded() {
    // Two disk-bearing pods: one the scheduler has given up on, one whose
    // disk never attaches. The first must cancel the second's watcher.
    let cluster = cluster_with_stateful_pod();
    cluster.add_stateful_pod("default", "db-1", NODE, "/subscriptions/sub/disks/other-disk");
    mark_unschedulable(&cluster, "default", "db-0");
    let pods = cluster.with_state(|state| state.pods.values().cloned().collect::<Vec<_>>());

    let kube = cluster.kube();
    let config = VolumeWaitConfig {
        timeout: Duration::from_secs(30),
        poll_interval: Duration::from_millis(10),
    };
    let started = tokio::time::Instant::now();
    let result = VolumeAttachmentWaiter::new(&kube, &config)
        .wait_for_disks_attached(&pods)
        .await;
    assert!(result.is_err());
    // Both watchers short-circuited well before the configured timeout.
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_wait_times_out_when_disks_never_attach() {
    let cluster = cluster_with_stateful_pod();
    let pods = cluster.with_state(|state| state.pods.values().cloned().collect::<Vec<_>>());

    let kube = cluster.kube();
    let config = VolumeWaitConfig {
        timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(10),
    };
    let result = VolumeAttachmentWaiter::new(&kube, &config)
        .wait_for_disks_attached(&pods)
        .await;
    assert!(matches!(
        result,
        Err(node_rollover::Error::Timeout { .. })
    ));
}
