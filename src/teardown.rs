//! Clean VM teardown.
//!
//! Deleting a VM through the cloud API leaves its network interface, OS disk,
//! and any role assignments for its managed identity behind. This module
//! removes the VM and all of those leftovers so a replacement node can be
//! created under the same name without colliding with orphaned resources.

use tracing::{info, warn};

use crate::cloud::{CloudClient, OsDisk, resource_name, role_assignment_scope};
use crate::error::{Error, Result};

/// Delete a VM together with its NIC, OS disk, and managed-identity role
/// assignments. Steps run in dependency order; the VM itself goes first so
/// the NIC and disk are detached by the time they are removed.
pub async fn clean_delete_virtual_machine(
    cloud: &dyn CloudClient,
    subscription_id: &str,
    resource_group: &str,
    name: &str,
) -> Result<()> {
    info!(vm = %name, "fetching virtual machine");
    let vm = cloud.get_virtual_machine(resource_group, name).await?;

    let os_disk = vm.os_disk.clone().ok_or_else(|| {
        Error::Validation(format!("vm {name} has neither a managed disk nor a VHD"))
    })?;

    info!(vm = %name, "deleting virtual machine");
    cloud.delete_virtual_machine(resource_group, name).await?;

    match vm.nic_id.as_deref() {
        Some(nic_id) => {
            let nic_name = resource_name(nic_id)?;
            info!(vm = %name, nic = %nic_name, "deleting network interface");
            cloud
                .delete_network_interface(resource_group, &nic_name)
                .await?;
        }
        None => warn!(vm = %name, "vm has no network interface to delete"),
    }

    match &os_disk {
        OsDisk::Managed { name: disk_name } => {
            info!(vm = %name, disk = %disk_name, "deleting managed OS disk");
            cloud.delete_managed_disk(resource_group, disk_name).await?;
        }
        OsDisk::Vhd { uri } => {
            info!(vm = %name, vhd = %uri, "deleting OS disk blob");
            cloud.delete_vhd_blob(uri).await?;
        }
    }

    if let Some(principal_id) = vm.identity_principal_id.as_deref() {
        let scope = role_assignment_scope(subscription_id, resource_group);
        info!(vm = %name, principal = %principal_id, "deleting role assignments");
        let assignments = cloud
            .list_role_assignments_for_principal(&scope, principal_id)
            .await?;
        for assignment in assignments {
            cloud.delete_role_assignment(&assignment.id).await?;
        }
    }

    Ok(())
}
