//! Resource handlers, one module per CloudStack resource type.
//!
//! Every handler implements [`Resource`]. Handlers receive the CloudStack
//! client explicitly and hold no state of their own, so one registry can
//! serve any number of concurrent operations.

pub mod firewall;
pub mod instance_reset_password;
pub mod secondary_ipaddress;
pub mod ssh_keypair;
pub mod template;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::{is_id, resolve_id, ApiError, CloudStackApi, ResourceKind};
use crate::error::ProviderError;
use crate::schema::{Diagnostic, Schema};
use crate::state::ResourceState;

/// `cloudstack_firewall`
pub const FIREWALL: &str = "cloudstack_firewall";
/// `cloudstack_instance_reset_password`
pub const INSTANCE_RESET_PASSWORD: &str = "cloudstack_instance_reset_password";
/// `cloudstack_secondary_ipaddress`
pub const SECONDARY_IPADDRESS: &str = "cloudstack_secondary_ipaddress";
/// `cloudstack_ssh_keypair`
pub const SSH_KEYPAIR: &str = "cloudstack_ssh_keypair";
/// `cloudstack_template`
pub const TEMPLATE: &str = "cloudstack_template";

/// CRUD handler for one resource type.
#[async_trait]
pub trait Resource: Send + Sync {
    /// The resource type name, e.g. `cloudstack_template`.
    fn type_name(&self) -> &'static str;

    /// Schema of the resource's configuration and state.
    fn schema(&self) -> Schema;

    /// Checks beyond what the schema can express.
    fn validate(&self, config: &ResourceState) -> Vec<Diagnostic> {
        let _ = config;
        Vec::new()
    }

    /// Create the remote object and return its state.
    async fn create(
        &self,
        api: &dyn CloudStackApi,
        planned: ResourceState,
    ) -> Result<ResourceState, ProviderError>;

    /// Refresh state from the remote object.
    ///
    /// Returns [`ProviderError::NotFound`] when the object is gone.
    async fn read(
        &self,
        api: &dyn CloudStackApi,
        current: ResourceState,
    ) -> Result<ResourceState, ProviderError>;

    /// Apply in-place changes.
    async fn update(
        &self,
        api: &dyn CloudStackApi,
        prior: ResourceState,
        planned: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        let _ = (api, prior, planned);
        Err(ProviderError::Unimplemented(format!(
            "{} cannot be updated in place",
            self.type_name()
        )))
    }

    /// Delete the remote object. Objects that are already gone count as deleted.
    async fn delete(
        &self,
        api: &dyn CloudStackApi,
        current: ResourceState,
    ) -> Result<(), ProviderError>;

    /// Build the state of an existing object from its import ID.
    async fn import(
        &self,
        api: &dyn CloudStackApi,
        id: &str,
    ) -> Result<ResourceState, ProviderError> {
        let _ = (api, id);
        Err(ProviderError::Unimplemented(format!(
            "Import not supported for resource type: {}",
            self.type_name()
        )))
    }
}

/// All resource handlers, keyed by type name.
pub fn registry() -> BTreeMap<&'static str, Arc<dyn Resource>> {
    let resources: [Arc<dyn Resource>; 5] = [
        Arc::new(firewall::Firewall),
        Arc::new(instance_reset_password::InstanceResetPassword),
        Arc::new(secondary_ipaddress::SecondaryIpAddress),
        Arc::new(ssh_keypair::SshKeyPair),
        Arc::new(template::Template),
    ];
    resources
        .into_iter()
        .map(|resource| (resource.type_name(), resource))
        .collect()
}

/// Wrap a client error with context, keeping its category.
pub(crate) fn remote(context: impl fmt::Display) -> impl FnOnce(ApiError) -> ProviderError {
    move |err| ProviderError::from(err).context(context)
}

/// Resolve a name-or-UUID attribute to a UUID.
///
/// Names that match nothing (or more than one object) are configuration
/// errors, not missing resources.
pub(crate) async fn lookup_id(
    api: &dyn CloudStackApi,
    kind: ResourceKind,
    value: &str,
) -> Result<String, ProviderError> {
    resolve_id(api, kind, value).await.map_err(|err| {
        let context = format!("Error retrieving ID of {} {}", kind, value);
        match err {
            ApiError::NotFound(_) | ApiError::Ambiguous(_) => {
                ProviderError::Validation(format!("{}: {}", context, err))
            },
            other => ProviderError::from(other).context(context),
        }
    })
}

/// Store either the name or the ID of a referenced object, matching the
/// form the user wrote.
pub(crate) fn set_value_or_id(state: &mut ResourceState, key: &str, name: &str, id: &str) {
    let configured_as_id = state.string(key).is_some_and(is_id);
    state.set(key, if configured_as_id { id } else { name });
}
