//! Cloud collaborator interface.
//!
//! The upgrade pipeline never talks to a cloud SDK directly; it consumes this
//! trait. Implementations are expected to await every long-running operation
//! to its terminal state before returning, so the orchestrator can sequence
//! mutations without pipelining two changes against the same resource.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::template::TemplateMap;

/// Scope string for resource-group-level role assignments.
pub fn role_assignment_scope(subscription_id: &str, resource_group: &str) -> String {
    format!("/subscriptions/{subscription_id}/resourceGroups/{resource_group}")
}

/// Error type surfaced by cloud operations.
#[derive(Error, Debug)]
pub enum CloudError {
    /// The named resource does not exist.
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// A cloud operation reached a terminal failure state.
    #[error("cloud operation {operation} failed for {resource}: {message}")]
    Operation {
        operation: &'static str,
        resource: String,
        message: String,
    },

    /// The operation is still in flight and should be polled again.
    #[error("cloud operation {operation} on {resource} has not completed")]
    NotComplete {
        operation: &'static str,
        resource: String,
    },
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::NotComplete { .. })
    }
}

/// Operating system of a VM's OS disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OsType {
    #[default]
    Linux,
    Windows,
}

/// OS disk backing storage. Managed disks and VHD blobs are mutually
/// exclusive by storage type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsDisk {
    Managed { name: String },
    Vhd { uri: String },
}

/// A standalone (availability-set) virtual machine as the discovery pass
/// sees it.
#[derive(Debug, Clone, Default)]
pub struct VirtualMachine {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub os_type: OsType,
    /// Terminal or transitional provisioning state reported by the cloud
    /// ("Succeeded", "Failed", "Creating", "Updating", "Deleting").
    pub provisioning_state: Option<String>,
    pub os_disk: Option<OsDisk>,
    /// Fully qualified resource ID of the primary network interface.
    pub nic_id: Option<String>,
    /// Principal ID of the VM's managed identity, when one is assigned.
    pub identity_principal_id: Option<String>,
}

/// A VM scale set resource.
#[derive(Debug, Clone, Default)]
pub struct ScaleSet {
    pub name: String,
    pub location: String,
    pub sku_name: String,
    pub capacity: i64,
    pub is_windows: bool,
}

/// A single instance inside a VM scale set.
#[derive(Debug, Clone, Default)]
pub struct ScaleSetVm {
    /// Cloud resource name ("myvmss_3").
    pub name: String,
    pub instance_id: String,
    /// OS-level computer name, which is also the Kubernetes node name.
    pub computer_name: String,
    pub tags: BTreeMap<String, String>,
    /// Whether the scale set's latest model has been applied to this
    /// instance. Version tags on stale-model instances are unreliable.
    pub latest_model_applied: bool,
}

/// A role assignment bound to a managed identity's principal.
#[derive(Debug, Clone)]
pub struct RoleAssignment {
    pub id: String,
}

/// VM, scale-set, network, and disk management capability consumed by the
/// upgrade pipeline. Each mutating call may represent a long-running cloud
/// operation; implementations must await it to a terminal state.
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn list_virtual_machines(
        &self,
        resource_group: &str,
    ) -> Result<Vec<VirtualMachine>, CloudError>;

    async fn list_scale_sets(&self, resource_group: &str) -> Result<Vec<ScaleSet>, CloudError>;

    async fn list_scale_set_vms(
        &self,
        resource_group: &str,
        scale_set: &str,
    ) -> Result<Vec<ScaleSetVm>, CloudError>;

    async fn get_virtual_machine(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<VirtualMachine, CloudError>;

    async fn delete_virtual_machine(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<(), CloudError>;

    async fn delete_scale_set_vm(
        &self,
        resource_group: &str,
        scale_set: &str,
        instance_id: &str,
    ) -> Result<(), CloudError>;

    async fn set_scale_set_capacity(
        &self,
        resource_group: &str,
        scale_set: &str,
        sku_name: &str,
        capacity: i64,
        location: &str,
    ) -> Result<(), CloudError>;

    async fn delete_network_interface(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<(), CloudError>;

    async fn delete_managed_disk(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<(), CloudError>;

    /// Delete an OS disk VHD blob by its full URI.
    async fn delete_vhd_blob(&self, uri: &str) -> Result<(), CloudError>;

    async fn list_role_assignments_for_principal(
        &self,
        scope: &str,
        principal_id: &str,
    ) -> Result<Vec<RoleAssignment>, CloudError>;

    async fn delete_role_assignment(&self, id: &str) -> Result<(), CloudError>;

    /// Deploy a declarative template, waiting for the deployment to reach a
    /// terminal state.
    async fn deploy_template(
        &self,
        resource_group: &str,
        deployment_name: &str,
        template: &TemplateMap,
        parameters: &TemplateMap,
    ) -> Result<(), CloudError>;
}

/// Returns the last segment (the resource name) of a fully qualified
/// resource identifier.
pub fn resource_name(id: &str) -> Result<String, CloudError> {
    match id.rsplit('/').next() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(CloudError::Operation {
            operation: "parse resource id",
            resource: id.to_string(),
            message: "resource name was missing from identifier".to_string(),
        }),
    }
}
