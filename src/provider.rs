//! The CloudStack provider: routes host operations to the resource handlers.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{CloudStackApi, CloudStackClient};
use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::plan::plan;
use crate::resources::{registry, Resource};
use crate::schema::{Diagnostic, ProviderSchema};
use crate::service::ProviderService;
use crate::state::ResourceState;
use crate::types::{ImportedResource, PlanResult};
use crate::validation::validate;

/// Provider for Apache CloudStack.
///
/// Resource operations fail with [`ProviderError::Configuration`] until
/// [`configure`](ProviderService::configure) has installed a client, unless
/// one was injected with [`CloudStackProvider::with_client`].
pub struct CloudStackProvider {
    client: RwLock<Option<Arc<dyn CloudStackApi>>>,
    resources: BTreeMap<&'static str, Arc<dyn Resource>>,
}

impl CloudStackProvider {
    /// Create an unconfigured provider.
    pub fn new() -> Self {
        Self {
            client: RwLock::new(None),
            resources: registry(),
        }
    }

    /// Create a provider that talks to `client` without being configured.
    pub fn with_client(client: Arc<dyn CloudStackApi>) -> Self {
        Self {
            client: RwLock::new(Some(client)),
            resources: registry(),
        }
    }

    fn client(&self) -> Result<Arc<dyn CloudStackApi>, ProviderError> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                ProviderError::Configuration("provider has not been configured".to_string())
            })
    }

    fn resource(&self, resource_type: &str) -> Result<Arc<dyn Resource>, ProviderError> {
        self.resources
            .get(resource_type)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownResource(resource_type.to_string()))
    }
}

impl Default for CloudStackProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CloudStackProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let configured = self
            .client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("CloudStackProvider")
            .field("configured", &configured)
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait::async_trait]
impl ProviderService for CloudStackProvider {
    fn schema(&self) -> ProviderSchema {
        self.resources.iter().fold(
            ProviderSchema::new().with_provider_config(ProviderConfig::schema()),
            |schema, (name, resource)| schema.with_resource(*name, resource.schema()),
        )
    }

    #[instrument(skip(self, config), name = "provider.validate_provider_config")]
    async fn validate_provider_config(
        &self,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        match ProviderConfig::from_json(&config) {
            Ok(_) => Ok(vec![]),
            Err(diagnostics) => {
                warn!(diagnostics = diagnostics.len(), "Provider configuration is invalid");
                Ok(diagnostics)
            },
        }
    }

    #[instrument(skip(self, config), name = "provider.configure")]
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>, ProviderError> {
        let config = match ProviderConfig::from_json(&config) {
            Ok(config) => config,
            Err(diagnostics) => {
                warn!(diagnostics = diagnostics.len(), "Provider configuration is invalid");
                return Ok(diagnostics);
            },
        };

        let client = CloudStackClient::new(&config)?;
        info!(
            api_url = %config.api_url,
            http_get_only = config.http_get_only,
            "Configured CloudStack client"
        );

        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(client));
        Ok(vec![])
    }

    #[instrument(skip(self), name = "provider.stop")]
    async fn stop(&self) -> Result<(), ProviderError> {
        info!("Stopping provider");
        self.client.write().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    #[instrument(skip(self, config), name = "provider.validate_resource_config")]
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let resource = self.resource(resource_type)?;

        let mut diagnostics = validate(&resource.schema(), &config);
        diagnostics.extend(resource.validate(&ResourceState::from_value(config)?));

        if !diagnostics.is_empty() {
            debug!(diagnostics = diagnostics.len(), "Resource configuration is invalid");
        }
        Ok(diagnostics)
    }

    #[instrument(skip(self, prior_state, proposed_state, _config), name = "provider.plan")]
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
        _config: Value,
    ) -> Result<PlanResult, ProviderError> {
        let resource = self.resource(resource_type)?;
        let result = plan(&resource.schema(), prior_state.as_ref(), proposed_state)?;
        debug!(
            changes = result.changes.len(),
            requires_replace = result.requires_replace,
            "Planned changes"
        );
        Ok(result)
    }

    #[instrument(skip(self, planned_state), name = "provider.create")]
    async fn create(
        &self,
        resource_type: &str,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        let resource = self.resource(resource_type)?;
        let client = self.client()?;

        match resource
            .create(client.as_ref(), ResourceState::from_value(planned_state)?)
            .await
        {
            Ok(state) => {
                info!("Create completed successfully");
                Ok(state.into_value())
            },
            Err(e) => {
                error!(error = %e, "Create failed");
                Err(e)
            },
        }
    }

    #[instrument(skip(self, current_state), name = "provider.read")]
    async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Value, ProviderError> {
        let resource = self.resource(resource_type)?;
        let client = self.client()?;

        match resource
            .read(client.as_ref(), ResourceState::from_value(current_state)?)
            .await
        {
            Ok(state) => Ok(state.into_value()),
            Err(e) if e.is_not_found() => {
                warn!(error = %e, "Resource is gone, removing it from state");
                Err(e)
            },
            Err(e) => {
                error!(error = %e, "Read failed");
                Err(e)
            },
        }
    }

    #[instrument(skip(self, prior_state, planned_state), name = "provider.update")]
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        let resource = self.resource(resource_type)?;
        let client = self.client()?;

        match resource
            .update(
                client.as_ref(),
                ResourceState::from_value(prior_state)?,
                ResourceState::from_value(planned_state)?,
            )
            .await
        {
            Ok(state) => {
                info!("Update completed successfully");
                Ok(state.into_value())
            },
            Err(e) => {
                error!(error = %e, "Update failed");
                Err(e)
            },
        }
    }

    #[instrument(skip(self, current_state), name = "provider.delete")]
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError> {
        let resource = self.resource(resource_type)?;
        let client = self.client()?;

        match resource
            .delete(client.as_ref(), ResourceState::from_value(current_state)?)
            .await
        {
            Ok(()) => {
                info!("Delete completed successfully");
                Ok(())
            },
            Err(e) => {
                error!(error = %e, "Delete failed");
                Err(e)
            },
        }
    }

    #[instrument(skip(self), name = "provider.import_resource")]
    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        let resource = self.resource(resource_type)?;
        let client = self.client()?;

        let state = resource.import(client.as_ref(), id).await?;
        info!("Import completed successfully");
        Ok(vec![ImportedResource::new(resource_type, state.into_value())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ResourceKind;
    use crate::resources::{FIREWALL, SECONDARY_IPADDRESS, SSH_KEYPAIR, TEMPLATE};
    use crate::testing::{
        assert_error_contains, assert_plan_changes_attribute, assert_plan_replaces,
        assert_plan_updates_in_place, FakeCloud, ProviderTester,
    };
    use serde_json::json;

    fn tester() -> (Arc<FakeCloud>, ProviderTester<CloudStackProvider>) {
        let cloud = Arc::new(FakeCloud::new());
        let provider = CloudStackProvider::with_client(cloud.clone());
        (cloud, ProviderTester::new(provider))
    }

    fn template_config() -> Value {
        json!({
            "name": "centos",
            "format": "QCOW2",
            "hypervisor": "KVM",
            "os_type": "CentOS 7 (64-bit)",
            "url": "http://images.example.com/centos.qcow2",
            "tags": {"env": "dev"}
        })
    }

    #[test]
    fn test_schema_lists_resources() {
        let provider = CloudStackProvider::new();
        let schema = provider.schema();

        assert_eq!(
            provider.metadata().resources,
            vec![
                "cloudstack_firewall",
                "cloudstack_instance_reset_password",
                "cloudstack_secondary_ipaddress",
                "cloudstack_ssh_keypair",
                "cloudstack_template"
            ]
        );
        assert!(schema.provider.attribute("secret_key").unwrap().flags.sensitive);
        assert!(schema.resources[TEMPLATE].attribute("url").unwrap().force_new);
    }

    #[tokio::test]
    async fn test_unconfigured_provider() {
        let provider = CloudStackProvider::new();

        let err = provider
            .create(SSH_KEYPAIR, json!({"name": "deploy"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unknown_resource_type() {
        let (_, tester) = tester();
        let err = tester
            .create("cloudstack_volume", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownResource(_)));
    }

    #[tokio::test]
    async fn test_configure_installs_client() {
        let provider = CloudStackProvider::new();
        let diagnostics = provider
            .configure(json!({
                "api_url": "https://cloud.example.com/client/api",
                "api_key": "key",
                "secret_key": "secret",
                "timeout": 60
            }))
            .await
            .unwrap();

        assert!(diagnostics.is_empty());
        assert!(provider.client().is_ok());

        provider.stop().await.unwrap();
        assert!(provider.client().is_err());
    }

    #[tokio::test]
    async fn test_configure_rejects_unknown_attribute() {
        let provider = CloudStackProvider::new();
        let diagnostics = provider
            .validate_provider_config(json!({
                "api_url": "https://cloud.example.com/client/api",
                "api_key": "key",
                "secret_key": "secret",
                "zone": "Sandbox-simulator"
            }))
            .await
            .unwrap();

        assert_error_contains(&diagnostics, "Invalid provider configuration");
    }

    #[tokio::test]
    async fn test_validate_resource_config() {
        let (_, tester) = tester();

        let mut config = template_config();
        config["format"] = json!("ISO");
        let diagnostics = tester
            .provider()
            .validate_resource_config(TEMPLATE, config)
            .await
            .unwrap();
        assert_error_contains(&diagnostics, "Invalid format");

        let diagnostics = tester
            .provider()
            .validate_resource_config(FIREWALL, json!({"ip_address_id": "ip-1", "rule": []}))
            .await
            .unwrap();
        assert!(!diagnostics.is_empty());

        assert!(tester
            .validate_resource_config(SSH_KEYPAIR, json!({"name": "deploy"}))
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_template_lifecycle() {
        let (cloud, tester) = tester();
        cloud.add_named(ResourceKind::OsType, "CentOS 7 (64-bit)");

        let created = tester
            .lifecycle_create(TEMPLATE, template_config())
            .await
            .unwrap();
        assert_eq!(created["is_ready"], true);
        assert_eq!(created["is_ready_timeout"], 300);

        // no-op plan on unchanged config
        let plan = tester
            .plan_update(TEMPLATE, created.clone(), template_config())
            .await
            .unwrap();
        assert!(plan.changes.is_empty(), "unexpected changes: {:?}", plan.changes);

        let mut renamed = template_config();
        renamed["display_text"] = json!("CentOS 7");
        renamed["tags"] = json!({"env": "prod"});
        let plan = tester
            .plan_update(TEMPLATE, created.clone(), renamed.clone())
            .await
            .unwrap();
        assert_plan_changes_attribute(&plan, "tags");
        assert_plan_updates_in_place(&plan);

        cloud.clear_calls();
        let updated = tester
            .lifecycle_update(TEMPLATE, created.clone(), renamed)
            .await
            .unwrap();
        assert_eq!(updated["display_text"], "CentOS 7");
        assert_eq!(updated["tags"], json!({"env": "prod"}));
        assert_eq!(
            cloud.calls(),
            vec![
                "updateTemplate",
                "deleteTags",
                "createTags",
                "listTemplates",
                "listTemplates"
            ]
        );

        let mut moved = template_config();
        moved["url"] = json!("http://mirror.example.com/centos.qcow2");
        let plan = tester.plan_update(TEMPLATE, updated.clone(), moved).await.unwrap();
        assert_plan_replaces(&plan);

        tester.delete(TEMPLATE, updated.clone()).await.unwrap();
        let err = tester.read(TEMPLATE, updated).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_secondary_ip_lifecycle() {
        let (cloud, tester) = tester();
        let vm_id = cloud.add_virtual_machine("web");

        let created = tester
            .lifecycle_create(SECONDARY_IPADDRESS, json!({"virtual_machine_id": vm_id}))
            .await
            .unwrap();
        assert!(created["ip_address"].is_string());

        let plan = tester
            .plan_update(
                SECONDARY_IPADDRESS,
                created.clone(),
                json!({"virtual_machine_id": vm_id, "ip_address": "10.1.1.99"}),
            )
            .await
            .unwrap();
        assert_plan_replaces(&plan);

        tester.delete(SECONDARY_IPADDRESS, created).await.unwrap();
        assert!(cloud.virtual_machine(&vm_id).unwrap().nics[0]
            .secondary_ips
            .is_empty());
    }

    #[tokio::test]
    async fn test_firewall_lifecycle() {
        let (cloud, tester) = tester();
        let ip = "5e8d3b8c-1b1c-4a5d-9d38-3f4c3a6b1d2e";

        let state = tester
            .lifecycle_crud(
                FIREWALL,
                json!({
                    "ip_address_id": ip,
                    "rule": [{"cidr_list": ["10.0.0.0/24"], "protocol": "tcp", "ports": ["80"]}]
                }),
                json!({
                    "ip_address_id": ip,
                    "rule": [{
                        "cidr_list": ["10.0.0.0/24"],
                        "protocol": "tcp",
                        "ports": ["80", "443"]
                    }]
                }),
            )
            .await
            .unwrap();

        assert_eq!(state["rule"][0]["uuids"].as_object().unwrap().len(), 2);
        assert!(cloud.firewall_rules(ip).is_empty());
    }

    #[tokio::test]
    async fn test_import_ssh_keypair() {
        let (cloud, tester) = tester();
        cloud
            .register_ssh_key_pair("deploy", "ssh-rsa AAAA deploy", None)
            .await
            .unwrap();

        let imported = tester.import_resource(SSH_KEYPAIR, "deploy").await.unwrap();

        assert_eq!(imported.len(), 1);
        assert_eq!(imported[0].resource_type, SSH_KEYPAIR);
        assert_eq!(imported[0].state["id"], "deploy");

        let err = tester
            .import_resource(crate::resources::INSTANCE_RESET_PASSWORD, "vm-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unimplemented(_)));
    }
}
