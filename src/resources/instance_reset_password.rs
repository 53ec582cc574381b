//! `cloudstack_instance_reset_password`: resets a VM's password and keeps
//! the new one in state.
//!
//! The resource ID is the VM ID. Nothing is created remotely, so delete only
//! drops the resource from state.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{remote, Resource, INSTANCE_RESET_PASSWORD};
use crate::client::CloudStackApi;
use crate::error::ProviderError;
use crate::schema::{Attribute, Schema};
use crate::state::ResourceState;

/// Handler for `cloudstack_instance_reset_password`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceResetPassword;

impl InstanceResetPassword {
    async fn reset(
        &self,
        api: &dyn CloudStackApi,
        mut state: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        let vm_id = state.id()?.to_string();
        let vm = api
            .get_virtual_machine(&vm_id)
            .await
            .map_err(remote(format!("Error retrieving virtual machine {}", vm_id)))?;

        info!(vm = %vm.name, id = %vm.id, "Resetting virtual machine password");
        let reset = api
            .reset_password_for_virtual_machine(&vm_id)
            .await
            .map_err(|err| {
                ProviderError::RemoteFailure(format!(
                    "Failed to reset password for virtual machine {} [{}] due to : {}",
                    vm.name, vm.id, err
                ))
            })?;

        state.set("password", reset.password.unwrap_or_default());
        Ok(state)
    }
}

#[async_trait]
impl Resource for InstanceResetPassword {
    fn type_name(&self) -> &'static str {
        INSTANCE_RESET_PASSWORD
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute(
                "id",
                Attribute::required_string().with_description("ID of the virtual machine"),
            )
            .with_attribute("password", Attribute::computed_string().sensitive())
    }

    async fn create(
        &self,
        api: &dyn CloudStackApi,
        planned: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        self.reset(api, planned).await
    }

    async fn read(
        &self,
        api: &dyn CloudStackApi,
        current: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        let vm_id = current.id()?;
        match api.get_virtual_machine(vm_id).await {
            Ok(_) => Ok(current),
            Err(err) if err.entity_missing() => {
                debug!(id = vm_id, "Virtual machine no longer exists");
                Err(ProviderError::NotFound(format!(
                    "virtual machine {} no longer exists",
                    vm_id
                )))
            },
            Err(err) => Err(remote(format!("Error retrieving virtual machine {}", vm_id))(err)),
        }
    }

    async fn update(
        &self,
        api: &dyn CloudStackApi,
        _prior: ResourceState,
        planned: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        self.reset(api, planned).await
    }

    async fn delete(
        &self,
        _api: &dyn CloudStackApi,
        current: ResourceState,
    ) -> Result<(), ProviderError> {
        debug!(id = ?current.string("id"), "Dropping password reset from state");
        Ok(())
    }
}
