//! End-to-end pipeline scenarios against the closed-loop fakes.

use std::time::Duration;

use k8s_openapi::api::core::v1::Taint;
use serde_json::Value;

use node_rollover::cloud::RoleAssignment;
use node_rollover::config::{DrainConfig, Timings, VolumeWaitConfig};
use node_rollover::model::{AgentPoolProfile, ClusterModel};
use node_rollover::template::TemplateGenerator;
use node_rollover::topology::TopologyDiscovery;
use node_rollover::upgrader::Upgrader;

use crate::fake_clients::{FakeCluster, StaticTemplateGenerator};

fn fast_timings() -> Timings {
    Timings {
        step_timeout: Duration::from_secs(5),
        cordon_drain_timeout: Duration::from_secs(5),
        node_properties_copy_timeout: Duration::from_secs(2),
        validate_retry_interval: Duration::from_millis(5),
        properties_copy_retry_interval: Duration::from_millis(5),
    }
}

fn fast_drain_config() -> DrainConfig {
    DrainConfig {
        cordon_max_retries: 5,
        cordon_settle_delay: Duration::ZERO,
        eviction_retry_interval: Duration::from_millis(5),
        deletion_poll_interval: Duration::from_millis(5),
    }
}

fn fast_volume_config() -> VolumeWaitConfig {
    VolumeWaitConfig {
        timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
    }
}

fn model(target: &str, master_count: usize, pools: Vec<AgentPoolProfile>) -> ClusterModel {
    ClusterModel {
        orchestrator_version: target.to_string(),
        name_suffix: "37117985".to_string(),
        master_count,
        hosted_master: false,
        agent_pools: pools,
    }
}

async fn run_pipeline(
    cluster: &FakeCluster,
    model: &ClusterModel,
    control_plane_only: bool,
) -> node_rollover::Result<()> {
    let cloud = cluster.cloud();
    let kube = cluster.kube();
    let topology = TopologyDiscovery {
        cloud: &cloud,
        kube: &kube,
        model,
        resource_group: "rg",
        force: false,
    }
    .discover()
    .await?;

    let timings = fast_timings();
    let drain_config = fast_drain_config();
    let volume_config = fast_volume_config();
    let upgrader = Upgrader {
        cloud: &cloud,
        kube: &kube,
        model,
        subscription_id: "sub",
        resource_group: "rg",
        template: StaticTemplateGenerator.generate(model)?,
        timings: &timings,
        drain_config: &drain_config,
        volume_config: &volume_config,
        control_plane_only,
    };
    upgrader.run_upgrade(&topology).await
}

fn master_offsets(cluster: &FakeCluster) -> Vec<u64> {
    cluster.with_state(|state| {
        state
            .template_deployments
            .iter()
            .filter_map(|(_, template)| {
                template
                    .get("variables")
                    .and_then(Value::as_object)
                    .and_then(|v| v.get("masterOffset"))
                    .and_then(Value::as_u64)
            })
            .collect()
    })
}

#[tokio::test]
async fn test_missing_master_is_recreated_before_any_deletion() {
    let cluster = FakeCluster::new("37117985", "1.18.2", &[]);
    cluster.add_master(0, "1.17.11");
    cluster.add_master(1, "1.18.2");
    // Master 2 is gone entirely, as a crashed earlier run would leave it.

    let model = model("1.18.2", 3, vec![]);
    run_pipeline(&cluster, &model, true).await.unwrap();

    // The hole is filled first, then the out-of-date master is replaced.
    assert_eq!(master_offsets(&cluster), vec![2, 0]);
    cluster.with_state(|state| {
        assert_eq!(state.deleted_vms, vec!["k8s-master-37117985-0"]);
        for index in 0..3 {
            assert!(state.vms.contains_key(&format!("k8s-master-37117985-{index}")));
        }
    });
}

#[tokio::test]
async fn test_master_teardown_cleans_nic_disk_and_role_assignments() {
    let cluster = FakeCluster::new("37117985", "1.18.2", &[]);
    cluster.add_master(0, "1.17.11");
    cluster.with_state(|state| {
        let vm = state.vms.get_mut("k8s-master-37117985-0").unwrap();
        vm.identity_principal_id = Some("principal-1".to_string());
        state.role_assignments.insert(
            "principal-1".to_string(),
            vec![RoleAssignment {
                id: "/subscriptions/sub/roleAssignments/ra-1".to_string(),
            }],
        );
    });

    let model = model("1.18.2", 1, vec![]);
    run_pipeline(&cluster, &model, true).await.unwrap();

    cluster.with_state(|state| {
        assert_eq!(state.deleted_nics, vec!["k8s-master-37117985-0-nic"]);
        assert_eq!(state.deleted_disks, vec!["k8s-master-37117985-0-osdisk"]);
        assert_eq!(
            state.deleted_role_assignments,
            vec!["/subscriptions/sub/roleAssignments/ra-1"]
        );
    });
}

#[tokio::test]
async fn test_agent_pool_holds_capacity_buffer() {
    let cluster = FakeCluster::new("37117985", "1.18.2", &["agentpool1"]);
    cluster.add_agent("agentpool1", 0, "1.17.11");
    cluster.add_agent("agentpool1", 1, "1.17.11");

    let model = model("1.18.2", 0, vec![AgentPoolProfile::new("agentpool1", 2)]);
    run_pipeline(&cluster, &model, false).await.unwrap();

    cluster.with_state(|state| {
        // Old indices 0 and 1 were replaced by fresh indices 2 and 3; the
        // buffer absorbed the last deletion so no fourth node was created.
        assert_eq!(state.deleted_vms.len(), 2);
        let names: Vec<String> = state.vms.keys().cloned().collect();
        assert_eq!(
            names,
            vec!["k8s-37117985-agentpool1-2", "k8s-37117985-agentpool1-3"]
        );
        assert_eq!(state.vms.len(), model.agent_pools[0].count);
    });
}

#[tokio::test]
async fn test_failed_provisioning_vm_is_deleted_without_drain() {
    let cluster = FakeCluster::new("37117985", "1.18.2", &["agentpool1"]);
    // Already on the target version, but a previous run left it half-provisioned.
    cluster.add_agent("agentpool1", 0, "1.18.2");
    cluster.add_agent("agentpool1", 1, "1.17.11");
    cluster.add_pod("default", "app-0", "k8s-37117985-agentpool1-0");
    cluster.with_state(|state| {
        state
            .vms
            .get_mut("k8s-37117985-agentpool1-0")
            .unwrap()
            .provisioning_state = Some("Failed".to_string());
    });

    let model = model("1.18.2", 0, vec![AgentPoolProfile::new("agentpool1", 2)]);
    run_pipeline(&cluster, &model, false).await.unwrap();

    cluster.with_state(|state| {
        // The half-provisioned VM went away without an eviction pass, so
        // its pod record was never touched.
        assert!(state.deleted_vms.contains(&"k8s-37117985-agentpool1-0".to_string()));
        assert!(
            state
                .pods
                .contains_key(&("default".to_string(), "app-0".to_string()))
        );
        assert_eq!(state.vms.len(), 2);
    });
}

#[tokio::test]
async fn test_mid_deletion_vm_keeps_its_index_and_is_left_alone() {
    let cluster = FakeCluster::new("37117985", "1.18.2", &["agentpool1"]);
    cluster.add_agent("agentpool1", 0, "1.18.2");
    cluster.add_agent("agentpool1", 1, "1.17.11");
    cluster.with_state(|state| {
        state
            .vms
            .get_mut("k8s-37117985-agentpool1-0")
            .unwrap()
            .provisioning_state = Some("Deleting".to_string());
    });

    let model = model("1.18.2", 0, vec![AgentPoolProfile::new("agentpool1", 2)]);
    run_pipeline(&cluster, &model, false).await.unwrap();

    cluster.with_state(|state| {
        // The transitional VM was never touched, and an extra node was
        // created to cover the capacity it cannot provide.
        assert!(state.vms.contains_key("k8s-37117985-agentpool1-0"));
        assert_eq!(state.deleted_vms, vec!["k8s-37117985-agentpool1-1"]);
        let names: Vec<String> = state.vms.keys().cloned().collect();
        assert_eq!(
            names,
            vec![
                "k8s-37117985-agentpool1-0",
                "k8s-37117985-agentpool1-2",
                "k8s-37117985-agentpool1-3"
            ]
        );
    });
}

#[tokio::test]
async fn test_agent_pool_replacement_inherits_node_properties() {
    let cluster = FakeCluster::new("37117985", "1.18.2", &["agentpool1"]);
    cluster.add_agent("agentpool1", 0, "1.17.11");
    cluster.with_state(|state| {
        let node = state.nodes.get_mut("k8s-37117985-agentpool1-0").unwrap();
        node.metadata.labels = Some(
            [("workload-class".to_string(), "batch".to_string())]
                .into_iter()
                .collect(),
        );
    });

    let model = model("1.18.2", 0, vec![AgentPoolProfile::new("agentpool1", 1)]);
    run_pipeline(&cluster, &model, false).await.unwrap();

    cluster.with_state(|state| {
        // The buffer node built ahead of the deletion received the old
        // node's labels and came out schedulable.
        let replacement = state.nodes.get("k8s-37117985-agentpool1-1").unwrap();
        assert_eq!(
            replacement.metadata.labels.as_ref().unwrap()["workload-class"],
            "batch"
        );
        assert_eq!(
            replacement.spec.as_ref().unwrap().unschedulable,
            Some(false)
        );
        assert!(!state.nodes.contains_key("k8s-37117985-agentpool1-0"));
    });
}

#[tokio::test]
async fn test_agent_with_wedged_pod_is_still_replaced() {
    let cluster = FakeCluster::new("37117985", "1.18.2", &["agentpool1"]);
    cluster.add_agent("agentpool1", 0, "1.17.11");
    cluster.add_pod("default", "wedged", "k8s-37117985-agentpool1-0");
    cluster.with_state(|state| {
        state
            .stuck_pods
            .insert(("default".to_string(), "wedged".to_string()));
    });

    let cloud = cluster.cloud();
    let kube = cluster.kube();
    let model = model("1.18.2", 0, vec![AgentPoolProfile::new("agentpool1", 1)]);
    let topology = TopologyDiscovery {
        cloud: &cloud,
        kube: &kube,
        model: &model,
        resource_group: "rg",
        force: false,
    }
    .discover()
    .await
    .unwrap();

    let mut timings = fast_timings();
    timings.cordon_drain_timeout = Duration::from_millis(100);
    let drain_config = fast_drain_config();
    let volume_config = fast_volume_config();
    let upgrader = Upgrader {
        cloud: &cloud,
        kube: &kube,
        model: &model,
        subscription_id: "sub",
        resource_group: "rg",
        template: StaticTemplateGenerator.generate(&model).unwrap(),
        timings: &timings,
        drain_config: &drain_config,
        volume_config: &volume_config,
        control_plane_only: false,
    };
    upgrader.run_upgrade(&topology).await.unwrap();

    cluster.with_state(|state| {
        // The drain never completed, but the node was replaced anyway.
        assert!(state.deleted_vms.contains(&"k8s-37117985-agentpool1-0".to_string()));
        assert!(state.vms.contains_key("k8s-37117985-agentpool1-1"));
    });
}

#[tokio::test]
async fn test_addons_removed_when_crossing_the_116_boundary() {
    let cluster = FakeCluster::new("37117985", "1.16.1", &[]);
    cluster.add_master(0, "1.15.7");
    cluster.with_state(|state| {
        state
            .daemon_sets
            .insert(("kube-system".to_string(), "kube-proxy".to_string()));
        state.cluster_roles.insert("system:metrics-server".to_string());
        let mut metrics = k8s_openapi::api::apps::v1::Deployment::default();
        metrics.metadata.name = Some("metrics-server".to_string());
        state.deployments.insert(
            ("kube-system".to_string(), "metrics-server".to_string()),
            metrics,
        );
    });

    let model = model("1.16.1", 1, vec![]);
    run_pipeline(&cluster, &model, true).await.unwrap();

    cluster.with_state(|state| {
        assert_eq!(state.deleted_daemon_sets, vec!["kube-proxy"]);
        assert_eq!(state.deleted_cluster_roles, vec!["system:metrics-server"]);
        assert_eq!(state.deleted_k8s_deployments, vec!["metrics-server"]);
    });
}

#[tokio::test]
async fn test_addons_untouched_when_already_past_116() {
    let cluster = FakeCluster::new("37117985", "1.18.2", &[]);
    cluster.add_master(0, "1.17.11");
    cluster.with_state(|state| {
        state
            .daemon_sets
            .insert(("kube-system".to_string(), "kube-proxy".to_string()));
    });

    let model = model("1.18.2", 1, vec![]);
    run_pipeline(&cluster, &model, true).await.unwrap();

    cluster.with_state(|state| assert!(state.deleted_daemon_sets.is_empty()));
}

#[tokio::test]
async fn test_scale_set_swap_buffers_capacity_and_copies_properties() {
    let cluster = FakeCluster::new("37117985", "1.18.2", &["agentpool1"]);
    cluster.add_scale_set("agentpool1", 2, "1.17.11");
    let old_node = "k8s-agentpool1-vmss000000";
    cluster.with_state(|state| {
        let node = state.nodes.get_mut(old_node).unwrap();
        node.metadata.labels = Some(
            [("workload-class".to_string(), "batch".to_string())]
                .into_iter()
                .collect(),
        );
        node.spec.get_or_insert_default().taints = Some(vec![Taint {
            key: "bound-to".to_string(),
            value: Some(old_node.to_string()),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        }]);
    });

    let mut pool = AgentPoolProfile::new("agentpool1", 2);
    pool.uses_scale_sets = true;
    let model = model("1.18.2", 0, vec![pool]);
    run_pipeline(&cluster, &model, false).await.unwrap();

    cluster.with_state(|state| {
        // Capacity went to 3 for each swap and landed back on 2.
        assert_eq!(state.capacity_calls, vec![3, 3]);
        assert_eq!(state.deleted_instances, vec!["0", "1"]);
        let ss = state.scale_sets.get("k8s-37117985-agentpool1-vmss").unwrap();
        assert_eq!(ss.capacity, 2);

        // The first replacement inherited the old node's labels and taints,
        // with the taint value rewritten, and ended up schedulable.
        let replacement = state.nodes.get("k8s-37117985-agentpool1-vmss000100").unwrap();
        assert_eq!(
            replacement.metadata.labels.as_ref().unwrap()["workload-class"],
            "batch"
        );
        let taints = replacement.spec.as_ref().unwrap().taints.as_ref().unwrap();
        assert_eq!(taints[0].value.as_deref(), Some("k8s-37117985-agentpool1-vmss000100"));
        assert_eq!(
            replacement.spec.as_ref().unwrap().unschedulable,
            Some(false)
        );
    });
}

#[tokio::test]
async fn test_pipeline_rerun_after_completion_changes_nothing() {
    let cluster = FakeCluster::new("37117985", "1.18.2", &["agentpool1"]);
    cluster.add_master(0, "1.17.11");
    cluster.add_agent("agentpool1", 0, "1.17.11");

    let model = model(
        "1.18.2",
        1,
        vec![AgentPoolProfile::new("agentpool1", 1)],
    );
    run_pipeline(&cluster, &model, false).await.unwrap();
    let deployments_after_first = cluster.with_state(|state| state.template_deployments.len());

    // A second run discovers nothing left to do and submits nothing.
    run_pipeline(&cluster, &model, false).await.unwrap();
    cluster.with_state(|state| {
        assert_eq!(state.template_deployments.len(), deployments_after_first);
        assert!(state.vms.contains_key("k8s-master-37117985-0"));
        assert!(state.vms.contains_key("k8s-37117985-agentpool1-1"));
    });
}
