//! `cloudstack_secondary_ipaddress`: an extra IP address on a VM's NIC.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{remote, Resource, SECONDARY_IPADDRESS};
use crate::client::{CloudStackApi, VirtualMachine};
use crate::error::ProviderError;
use crate::schema::{Attribute, Schema};
use crate::state::ResourceState;

/// Handler for `cloudstack_secondary_ipaddress`. The resource ID is the ID of
/// the secondary IP itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecondaryIpAddress;

#[async_trait]
impl Resource for SecondaryIpAddress {
    fn type_name(&self) -> &'static str {
        SECONDARY_IPADDRESS
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("id", Attribute::computed_string())
            .with_attribute(
                "ip_address",
                Attribute::optional_computed_string()
                    .with_description("Picked by CloudStack when not set")
                    .with_force_new(),
            )
            .with_attribute(
                "nic_id",
                Attribute::optional_computed_string()
                    .with_description("Defaults to the first NIC of the virtual machine")
                    .with_force_new(),
            )
            .with_attribute(
                "virtual_machine_id",
                Attribute::required_string().with_force_new(),
            )
    }

    async fn create(
        &self,
        api: &dyn CloudStackApi,
        mut planned: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        let vm_id = planned.required_string("virtual_machine_id")?.to_string();

        let nic_id = match planned.string("nic_id") {
            Some(nic_id) => nic_id.to_string(),
            None => {
                let vm = virtual_machine(api, &vm_id).await?;
                default_nic(&vm)?.to_string()
            },
        };

        info!(vm_id = %vm_id, nic_id = %nic_id, "Adding secondary IP address");
        let ip = api
            .add_ip_to_nic(&nic_id, planned.string("ip_address"))
            .await
            .map_err(remote(format!(
                "Error adding secondary IP address to NIC {}",
                nic_id
            )))?;

        planned.set("id", ip.id);
        planned.set("nic_id", nic_id);
        self.read(api, planned).await
    }

    async fn read(
        &self,
        api: &dyn CloudStackApi,
        mut current: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        let id = current.id()?.to_string();
        let vm_id = current.required_string("virtual_machine_id")?.to_string();

        let vm = virtual_machine(api, &vm_id).await?;
        let nic_id = match current.string("nic_id") {
            Some(nic_id) => nic_id.to_string(),
            None => default_nic(&vm)?.to_string(),
        };

        let nics = api
            .list_nics(&vm_id, Some(&nic_id))
            .await
            .map_err(remote(format!("Error listing NICs of virtual machine {}", vm_id)))?;

        let nic = match nics.as_slice() {
            [] => {
                debug!(nic_id = %nic_id, "NIC no longer exists");
                return Err(ProviderError::NotFound(format!("NIC {} no longer exists", nic_id)));
            },
            [nic] => nic,
            _ => {
                let ids: Vec<&str> = nics.iter().map(|nic| nic.id.as_str()).collect();
                return Err(ProviderError::RemoteFailure(format!(
                    "Found more then one possible result: {:?}",
                    ids
                )));
            },
        };

        let ip = nic
            .secondary_ips
            .iter()
            .find(|ip| ip.id == id)
            .ok_or_else(|| {
                ProviderError::NotFound(format!("secondary IP address {} no longer exists", id))
            })?;

        current.set("ip_address", ip.ip_address.clone());
        current.set("nic_id", nic.id.clone());
        current.set("virtual_machine_id", nic.virtual_machine_id.clone());
        Ok(current)
    }

    async fn delete(
        &self,
        api: &dyn CloudStackApi,
        current: ResourceState,
    ) -> Result<(), ProviderError> {
        let id = current.id()?;

        info!(id, "Removing secondary IP address");
        match api.remove_ip_from_nic(id).await {
            Ok(()) => Ok(()),
            Err(err) if err.entity_missing() => {
                warn!(id, "Secondary IP address already removed");
                Ok(())
            },
            Err(err) => Err(remote(format!("Error removing secondary IP address {}", id))(err)),
        }
    }
}

async fn virtual_machine(
    api: &dyn CloudStackApi,
    id: &str,
) -> Result<VirtualMachine, ProviderError> {
    match api.get_virtual_machine(id).await {
        Ok(vm) => Ok(vm),
        Err(err) if err.entity_missing() => {
            debug!(id, "Virtual machine no longer exists");
            Err(ProviderError::NotFound(format!("virtual machine {} no longer exists", id)))
        },
        Err(err) => Err(remote(format!("Error retrieving virtual machine {}", id))(err)),
    }
}

fn default_nic(vm: &VirtualMachine) -> Result<&str, ProviderError> {
    vm.nics.first().map(|nic| nic.id.as_str()).ok_or_else(|| {
        ProviderError::RemoteFailure(format!("virtual machine {} has no NICs", vm.id))
    })
}
