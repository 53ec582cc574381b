//! `cloudstack_ssh_keypair`: an SSH key pair, either registered from a
//! public key or generated by CloudStack.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{lookup_id, remote, Resource, SSH_KEYPAIR};
use crate::client::{CloudStackApi, ResourceKind};
use crate::error::ProviderError;
use crate::schema::{Attribute, Schema};
use crate::state::ResourceState;

/// Handler for `cloudstack_ssh_keypair`. Key pairs are identified by name.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshKeyPair;

async fn project_id(
    api: &dyn CloudStackApi,
    state: &ResourceState,
) -> Result<Option<String>, ProviderError> {
    match state.string("project") {
        Some(project) => Ok(Some(lookup_id(api, ResourceKind::Project, project).await?)),
        None => Ok(None),
    }
}

#[async_trait]
impl Resource for SshKeyPair {
    fn type_name(&self) -> &'static str {
        SSH_KEYPAIR
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("id", Attribute::computed_string())
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute(
                "public_key",
                Attribute::optional_string()
                    .with_description("Register this key instead of generating one")
                    .with_force_new(),
            )
            .with_attribute("project", Attribute::optional_string().with_force_new())
            .with_attribute(
                "private_key",
                Attribute::computed_string()
                    .with_description("Only set when CloudStack generated the key pair")
                    .sensitive(),
            )
            .with_attribute("fingerprint", Attribute::computed_string())
    }

    async fn create(
        &self,
        api: &dyn CloudStackApi,
        mut planned: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        let name = planned.required_string("name")?.to_string();
        let project_id = project_id(api, &planned).await?;

        let key_pair = match planned.string("public_key") {
            Some(public_key) => {
                info!(name = %name, "Registering SSH key pair");
                api.register_ssh_key_pair(&name, public_key, project_id.as_deref())
                    .await
                    .map_err(remote(format!("Error registering SSH key pair {}", name)))?
            },
            None => {
                info!(name = %name, "Creating SSH key pair");
                api.create_ssh_key_pair(&name, project_id.as_deref())
                    .await
                    .map_err(remote(format!("Error creating SSH key pair {}", name)))?
            },
        };

        if let Some(private_key) = key_pair.private_key {
            planned.set("private_key", private_key);
        }
        planned.set("id", key_pair.name);
        self.read(api, planned).await
    }

    async fn read(
        &self,
        api: &dyn CloudStackApi,
        mut current: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        let name = current.id()?.to_string();
        let project_id = project_id(api, &current).await?;

        let key_pairs = api
            .list_ssh_key_pairs(&name, project_id.as_deref())
            .await
            .map_err(remote(format!("Error reading SSH key pair {}", name)))?;

        let Some(key_pair) = key_pairs.into_iter().find(|kp| kp.name == name) else {
            debug!(name = %name, "SSH key pair no longer exists");
            return Err(ProviderError::NotFound(format!("SSH key pair {} no longer exists", name)));
        };

        current.set("name", key_pair.name);
        current.set("fingerprint", key_pair.fingerprint);
        Ok(current)
    }

    async fn delete(
        &self,
        api: &dyn CloudStackApi,
        current: ResourceState,
    ) -> Result<(), ProviderError> {
        let name = current.id()?;
        let project_id = project_id(api, &current).await?;

        info!(name, "Deleting SSH key pair");
        match api.delete_ssh_key_pair(name, project_id.as_deref()).await {
            Ok(()) => Ok(()),
            Err(err) if err.entity_missing() => {
                warn!(name, "SSH key pair already deleted");
                Ok(())
            },
            Err(err) => Err(remote(format!("Error deleting SSH key pair {}", name))(err)),
        }
    }

    async fn import(
        &self,
        api: &dyn CloudStackApi,
        id: &str,
    ) -> Result<ResourceState, ProviderError> {
        let mut state = ResourceState::default();
        state.set("id", id);
        state.set("name", id);
        self.read(api, state).await
    }
}
