//! node-rollover library crate
//!
//! Rolling in-place upgrades for cloud-VM-hosted Kubernetes clusters: the
//! inventory discovery pass, the cordon/drain machinery, and the pipeline
//! that replaces masters and agents one node at a time while holding spare
//! capacity.

pub mod cloud;
pub mod cluster;
pub mod config;
pub mod drain;
pub mod error;
pub mod kube_api;
pub mod model;
pub mod names;
pub mod node;
pub mod teardown;
pub mod template;
pub mod topology;
pub mod upgrader;
pub mod volumes;

pub use cloud::{CloudClient, CloudError};
pub use cluster::{UpgradeCluster, UpgradeOptions};
pub use config::{DrainConfig, Timings, VolumeWaitConfig};
pub use error::{Error, Result};
pub use kube_api::{KubeApi, KubeClient};
pub use model::{AgentPoolProfile, ClusterModel};
pub use template::{DeploymentTemplate, TemplateGenerator};
pub use topology::{ClusterTopology, TopologyDiscovery};
pub use upgrader::Upgrader;
