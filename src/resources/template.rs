//! `cloudstack_template`: a VM template registered from a URL.
//!
//! Registration returns immediately, but CloudStack still has to download
//! the image. Create therefore polls the template until it reports ready or
//! `is_ready_timeout` seconds have passed.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{lookup_id, remote, set_value_or_id, Resource, TEMPLATE};
use crate::client::{
    self, resolve_id, CloudStackApi, RegisterTemplate, ResourceKind, UpdateTemplate,
};
use crate::error::ProviderError;
use crate::poll::{wait_until, PollError, PollOptions};
use crate::schema::{Attribute, Diagnostic, Schema};
use crate::state::ResourceState;
use crate::tags::{set_tags, tags_from_state, tags_schema, tags_to_value, update_tags};

/// Image formats CloudStack accepts.
pub const VALID_FORMATS: [&str; 5] = ["OVA", "QCOW2", "RAW", "VHD", "VMDK"];

const TAG_RESOURCE_TYPE: &str = "Template";
const DEFAULT_READY_TIMEOUT: i64 = 300;
const READY_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Handler for `cloudstack_template`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Template;

#[async_trait]
impl Resource for Template {
    fn type_name(&self) -> &'static str {
        TEMPLATE
    }

    fn schema(&self) -> Schema {
        Schema::v0()
            .with_attribute("id", Attribute::computed_string())
            .with_attribute("name", Attribute::required_string())
            .with_attribute(
                "display_text",
                Attribute::optional_computed_string().with_description("Defaults to the name"),
            )
            .with_attribute(
                "format",
                Attribute::required_string()
                    .with_description("One of OVA, QCOW2, RAW, VHD or VMDK"),
            )
            .with_attribute("hypervisor", Attribute::required_string().with_force_new())
            .with_attribute(
                "os_type",
                Attribute::required_string().with_description("OS type description or UUID"),
            )
            .with_attribute(
                "url",
                Attribute::required_string()
                    .with_description("The URL of where the template is hosted")
                    .with_force_new(),
            )
            .with_attribute("project", Attribute::optional_computed_string().with_force_new())
            .with_attribute("zone", Attribute::optional_string().with_force_new())
            .with_attribute("is_dynamically_scalable", Attribute::optional_computed_bool())
            .with_attribute("is_extractable", Attribute::optional_computed_bool().with_force_new())
            .with_attribute("is_featured", Attribute::optional_computed_bool().with_force_new())
            .with_attribute("is_public", Attribute::optional_computed_bool())
            .with_attribute("password_enabled", Attribute::optional_computed_bool())
            .with_attribute("is_ready", Attribute::computed_bool())
            .with_attribute(
                "is_ready_timeout",
                Attribute::optional_int64()
                    .with_description("Seconds to wait for the template to become ready")
                    .with_default(json!(DEFAULT_READY_TIMEOUT)),
            )
            .with_attribute("tags", tags_schema())
    }

    fn validate(&self, config: &ResourceState) -> Vec<Diagnostic> {
        verify_format(config)
            .err()
            .map(|err| {
                Diagnostic::error("Invalid format")
                    .with_detail(err.message().to_string())
                    .with_attribute("format")
            })
            .into_iter()
            .collect()
    }

    async fn create(
        &self,
        api: &dyn CloudStackApi,
        mut planned: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        verify_format(&planned)?;
        let tags = tags_from_state(&planned.as_value())?;

        let name = planned.required_string("name")?.to_string();
        let display_text = planned.string("display_text").unwrap_or(&name).to_string();

        // An unknown OS type is left for CloudStack to default.
        let os_type_id = match planned.string("os_type") {
            Some(os_type) => match resolve_id(api, ResourceKind::OsType, os_type).await {
                Ok(id) => Some(id),
                Err(err) => {
                    warn!(
                        os_type,
                        error = %err,
                        "Could not resolve os_type, registering without it"
                    );
                    None
                },
            },
            None => None,
        };

        let zone_id = match planned.string("zone") {
            Some(zone) => Some(lookup_id(api, ResourceKind::Zone, zone).await?),
            None => None,
        };
        let project_id = match planned.string("project") {
            Some(project) => Some(lookup_id(api, ResourceKind::Project, project).await?),
            None => None,
        };

        let params = RegisterTemplate {
            name: name.clone(),
            display_text,
            format: planned.required_string("format")?.to_string(),
            hypervisor: planned.required_string("hypervisor")?.to_string(),
            url: planned.required_string("url")?.to_string(),
            os_type_id,
            zone_id,
            project_id,
            is_dynamically_scalable: planned.bool("is_dynamically_scalable"),
            is_extractable: planned.bool("is_extractable"),
            is_featured: planned.bool("is_featured"),
            is_public: planned.bool("is_public"),
            password_enabled: planned.bool("password_enabled"),
        };

        info!(name = %name, url = %params.url, "Registering template");
        let template = api
            .register_template(&params)
            .await
            .map_err(remote(format!("Error creating template {}", name)))?;
        planned.set("id", template.id.clone());

        set_tags(api, &template.id, TAG_RESOURCE_TYPE, &tags)
            .await
            .map_err(remote(format!("Error setting tags on the template {}", name)))?;

        let timeout = planned
            .int("is_ready_timeout")
            .unwrap_or(DEFAULT_READY_TIMEOUT)
            .max(0) as u64;
        let options = PollOptions::new(READY_POLL_INTERVAL, Duration::from_secs(timeout))
            .with_initial_delay(READY_POLL_INTERVAL);

        debug!(id = %template.id, timeout, "Waiting for template to become ready");
        let current = &planned;
        let ready = wait_until(options, || {
            let state = current.clone();
            async move {
                let refreshed = self.read(api, state).await?;
                let is_ready = refreshed.bool("is_ready").unwrap_or(false);
                Ok::<_, ProviderError>(is_ready.then_some(refreshed))
            }
        })
        .await;

        match ready {
            Ok(state) => Ok(state),
            Err(PollError::Timeout { .. }) => Err(ProviderError::DeadlineExceeded(format!(
                "Timeout while waiting for template {} ({}) to become ready",
                name, template.id
            ))),
            Err(PollError::Check(err)) => Err(err),
        }
    }

    async fn read(
        &self,
        api: &dyn CloudStackApi,
        mut current: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        let id = current.id()?.to_string();
        let project_id = match current.string("project") {
            Some(project) => Some(lookup_id(api, ResourceKind::Project, project).await?),
            None => None,
        };

        let template = match api.get_template(&id, project_id.as_deref()).await {
            Ok(template) => template,
            Err(err) if err.entity_missing() => {
                debug!(id = %id, "Template no longer exists");
                return Err(ProviderError::NotFound(format!("template {} no longer exists", id)));
            },
            Err(err) => return Err(remote(format!("Error reading template {}", id))(err)),
        };

        apply_remote(&mut current, &template);
        Ok(current)
    }

    async fn update(
        &self,
        api: &dyn CloudStackApi,
        prior: ResourceState,
        mut planned: ResourceState,
    ) -> Result<ResourceState, ProviderError> {
        let id = prior.id()?.to_string();
        let name = planned.required_string("name")?.to_string();
        planned.set("id", id.clone());

        let mut params = UpdateTemplate {
            id: id.clone(),
            ..Default::default()
        };

        if prior.differs(&planned, "name") {
            params.name = Some(name.clone());
        }
        if prior.differs(&planned, "display_text") {
            params.display_text = planned.string("display_text").map(str::to_string);
        }
        if prior.differs(&planned, "format") {
            verify_format(&planned)?;
            params.format = planned.string("format").map(str::to_string);
        }
        if prior.differs(&planned, "is_dynamically_scalable") {
            params.is_dynamically_scalable = planned.bool("is_dynamically_scalable");
        }
        if prior.differs(&planned, "os_type") {
            let os_type = planned.required_string("os_type")?;
            params.os_type_id = Some(lookup_id(api, ResourceKind::OsType, os_type).await?);
        }
        if prior.differs(&planned, "password_enabled") {
            params.password_enabled = planned.bool("password_enabled");
        }

        let unchanged = UpdateTemplate {
            id: id.clone(),
            ..Default::default()
        };
        if params != unchanged {
            info!(id = %id, ?params, "Updating template");
            api.update_template(&params)
                .await
                .map_err(remote(format!("Error updating template {}", name)))?;
        }

        if prior.differs(&planned, "tags") {
            update_tags(
                api,
                &id,
                TAG_RESOURCE_TYPE,
                tags_from_state(&prior.as_value())?,
                tags_from_state(&planned.as_value())?,
            )
            .await
            .map_err(remote(format!("Error updating tags on template {}", name)))?;
        }

        self.read(api, planned).await
    }

    async fn delete(
        &self,
        api: &dyn CloudStackApi,
        current: ResourceState,
    ) -> Result<(), ProviderError> {
        let id = current.id()?;

        info!(id, "Deleting template");
        match api.delete_template(id).await {
            Ok(()) => Ok(()),
            Err(err) if err.entity_missing() => {
                warn!(id, "Template already deleted");
                Ok(())
            },
            Err(err) => Err(remote(format!("Error deleting template {}", id))(err)),
        }
    }

    async fn import(
        &self,
        api: &dyn CloudStackApi,
        id: &str,
    ) -> Result<ResourceState, ProviderError> {
        let template = api
            .get_template(id, None)
            .await
            .map_err(remote(format!("Error importing template {}", id)))?;

        let mut state = ResourceState::default();
        state.set("id", template.id.clone());
        state.set("is_ready_timeout", DEFAULT_READY_TIMEOUT);
        if !template.zone_name.is_empty() {
            state.set("zone", template.zone_name.clone());
        }
        apply_remote(&mut state, &template);
        Ok(state)
    }
}

fn verify_format(state: &ResourceState) -> Result<(), ProviderError> {
    let format = state.string("format").unwrap_or_default();
    if VALID_FORMATS.contains(&format) {
        Ok(())
    } else {
        Err(ProviderError::Validation(format!(
            "{} is not a valid format. Valid options are: {}",
            format,
            VALID_FORMATS.join(", ")
        )))
    }
}

fn apply_remote(state: &mut ResourceState, template: &client::Template) {
    state.set("name", template.name.clone());
    state.set("display_text", template.display_text.clone());
    state.set("format", template.format.clone());
    state.set("hypervisor", template.hypervisor.clone());
    state.set("is_dynamically_scalable", template.is_dynamically_scalable);
    state.set("is_extractable", template.is_extractable);
    state.set("is_featured", template.is_featured);
    state.set("is_public", template.is_public);
    state.set("password_enabled", template.password_enabled);
    state.set("is_ready", template.is_ready);
    state.set("tags", tags_to_value(&template.tag_set()));

    set_value_or_id(state, "os_type", &template.os_type_name, &template.os_type_id);
    set_value_or_id(state, "project", &template.project, &template.project_id);

    // zone is optional but not computed; only refresh it when configured
    if state.string("zone").is_some() {
        set_value_or_id(state, "zone", &template.zone_name, &template.zone_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ApiError;
    use crate::plan::plan;
    use crate::tags::TagSet;
    use crate::testing::FakeCloud;
    use serde_json::Value;

    fn planned(config: Value) -> ResourceState {
        let plan = plan(&Template.schema(), None, config).unwrap();
        ResourceState::from_value(plan.planned_state).unwrap()
    }

    fn centos() -> Value {
        json!({
            "name": "centos",
            "format": "QCOW2",
            "hypervisor": "KVM",
            "os_type": "CentOS 7 (64-bit)",
            "url": "http://images.example.com/centos.qcow2",
            "zone": "Sandbox-simulator",
            "tags": {"env": "dev", "team": "web"}
        })
    }

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_waits_until_ready() {
        let cloud = FakeCloud::new();
        let os_type_id = cloud.add_named(ResourceKind::OsType, "CentOS 7 (64-bit)");
        cloud.add_named(ResourceKind::Zone, "Sandbox-simulator");
        cloud.set_template_ready_after(2);

        let state = Template.create(&cloud, planned(centos())).await.unwrap();

        assert_eq!(state.bool("is_ready"), Some(true));
        assert_eq!(state.string("display_text"), Some("centos"));
        assert_eq!(state.string("os_type"), Some("CentOS 7 (64-bit)"));
        assert_eq!(state.string("zone"), Some("Sandbox-simulator"));
        assert_eq!(
            cloud.calls(),
            vec![
                "listOsTypes",
                "listZones",
                "registerTemplate",
                "createTags",
                "listTemplates",
                "listTemplates"
            ]
        );

        let id = state.id().unwrap();
        let remote = cloud.template(id).unwrap();
        assert_eq!(remote.os_type_id, os_type_id);
        assert_eq!(cloud.tags_of(id), tags(&[("env", "dev"), ("team", "web")]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_times_out() {
        let cloud = FakeCloud::new();
        cloud.add_named(ResourceKind::Zone, "Sandbox-simulator");
        cloud.set_template_ready_after(100);

        let mut config = centos();
        config["is_ready_timeout"] = json!(30);
        let err = Template.create(&cloud, planned(config)).await.unwrap_err();

        assert!(matches!(err, ProviderError::DeadlineExceeded(_)));
        assert!(err.message().contains("to become ready"));

        // the zone took the first ID, the template the second
        let id = "00000000-0000-0000-0000-000000000002";
        assert!(err.message().contains(id));
        assert!(cloud.template(id).is_some());
        assert_eq!(
            cloud.calls().iter().filter(|c| *c == "listTemplates").count(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_tolerates_unknown_os_type() {
        let cloud = FakeCloud::new();
        cloud.add_named(ResourceKind::Zone, "Sandbox-simulator");

        let state = Template.create(&cloud, planned(centos())).await.unwrap();
        let remote = cloud.template(state.id().unwrap()).unwrap();
        assert!(remote.os_type_id.is_empty());
    }

    #[tokio::test]
    async fn test_create_fails_on_unknown_zone() {
        let cloud = FakeCloud::new();

        let err = Template.create(&cloud, planned(centos())).await.unwrap_err();

        assert!(matches!(err, ProviderError::Validation(_)));
        assert!(!cloud.calls().contains(&"registerTemplate".to_string()));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_format() {
        let cloud = FakeCloud::new();
        let mut config = centos();
        config["format"] = json!("ISO");

        let err = Template.create(&cloud, planned(config)).await.unwrap_err();
        assert!(err.message().contains("ISO is not a valid format"));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_malformed_tags_before_registering() {
        let cloud = FakeCloud::new();
        cloud.add_named(ResourceKind::Zone, "Sandbox-simulator");
        let mut config = centos();
        config["tags"] = json!({"env": 1});

        let state = ResourceState::from_value(config).unwrap();
        let err = Template.create(&cloud, state).await.unwrap_err();

        assert!(matches!(err, ProviderError::Validation(_)));
        assert!(cloud.calls().is_empty());
    }

    #[test]
    fn test_validate_format() {
        let mut config = centos();
        assert!(Template
            .validate(&ResourceState::from_value(config.clone()).unwrap())
            .is_empty());

        config["format"] = json!("qcow3");
        let diagnostics = Template.validate(&ResourceState::from_value(config).unwrap());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].attribute, Some("format".to_string()));
    }

    async fn created(cloud: &FakeCloud) -> ResourceState {
        cloud.add_named(ResourceKind::OsType, "CentOS 7 (64-bit)");
        cloud.add_named(ResourceKind::Zone, "Sandbox-simulator");
        let state = Template.create(cloud, planned(centos())).await.unwrap();
        cloud.clear_calls();
        state
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_gone_is_not_found() {
        let cloud = FakeCloud::new();
        let state = created(&cloud).await;
        cloud.remove_template(state.id().unwrap());

        let err = Template.read(&cloud, state).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_deletes_tags_before_creating() {
        let cloud = FakeCloud::new();
        let prior = created(&cloud).await;

        let mut config = centos();
        config["name"] = json!("centos-7");
        config["tags"] = json!({"env": "prod", "team": "web", "owner": "ops"});
        let plan = plan(&Template.schema(), Some(&prior.as_value()), config).unwrap();
        let planned = ResourceState::from_value(plan.planned_state).unwrap();

        let state = Template.update(&cloud, prior, planned).await.unwrap();

        assert_eq!(
            cloud.calls(),
            vec!["updateTemplate", "deleteTags", "createTags", "listTemplates"]
        );
        assert_eq!(state.string("name"), Some("centos-7"));
        assert_eq!(
            cloud.tags_of(state.id().unwrap()),
            tags(&[("env", "prod"), ("owner", "ops"), ("team", "web")])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_tags_only_skips_update_call() {
        let cloud = FakeCloud::new();
        let prior = created(&cloud).await;

        let mut config = centos();
        config["tags"] = json!({"env": "dev"});
        let plan = plan(&Template.schema(), Some(&prior.as_value()), config).unwrap();
        let planned = ResourceState::from_value(plan.planned_state).unwrap();

        let state = Template.update(&cloud, prior, planned).await.unwrap();

        assert_eq!(cloud.calls(), vec!["deleteTags", "listTemplates"]);
        assert_eq!(state.get("tags"), Some(&json!({"env": "dev"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_tag_failure_stops_before_read() {
        let cloud = FakeCloud::new();
        let prior = created(&cloud).await;
        cloud.fail_next(
            "createTags",
            ApiError::Api {
                code: 530,
                text: "Internal error".to_string(),
            },
        );

        let mut planned = prior.clone();
        planned.set("tags", json!({"env": "prod", "team": "web"}));
        let err = Template.update(&cloud, prior, planned).await.unwrap_err();

        assert!(matches!(err, ProviderError::RemoteFailure(_)));
        assert_eq!(cloud.calls(), vec!["deleteTags", "createTags"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_is_idempotent() {
        let cloud = FakeCloud::new();
        let state = created(&cloud).await;

        Template.delete(&cloud, state.clone()).await.unwrap();
        assert!(cloud.template(state.id().unwrap()).is_none());

        Template.delete(&cloud, state).await.unwrap();
        assert_eq!(cloud.calls(), vec!["deleteTemplate", "deleteTemplate"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_import_by_id() {
        let cloud = FakeCloud::new();
        let state = created(&cloud).await;

        let imported = Template.import(&cloud, state.id().unwrap()).await.unwrap();

        assert_eq!(imported.string("name"), Some("centos"));
        assert_eq!(imported.string("zone"), Some("Sandbox-simulator"));
        assert_eq!(imported.int("is_ready_timeout"), Some(DEFAULT_READY_TIMEOUT));
        assert_eq!(imported.get("tags"), Some(&json!({"env": "dev", "team": "web"})));
    }
}
