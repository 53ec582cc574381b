//! Signed HTTP client for the CloudStack query API.
//!
//! Every request carries `command`, `response=json` and `apiKey`, and is
//! signed with HMAC-SHA1 over the sorted, lower-cased query string. Responses
//! arrive wrapped in a `<command>response` object. Commands that CloudStack
//! runs as async jobs answer with a `jobid`, which is polled through
//! `queryAsyncJobResult` until the job succeeds or fails.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha1::Sha1;
use tracing::{debug, trace};
use url::{form_urlencoded, Url};

use super::{
    ApiError, CloudStackApi, CreateFirewallRule, FirewallRule, Nic, RegisterTemplate,
    ResourceKind, SecondaryIp, SshKeyPair, Template, UpdateTemplate, VirtualMachine,
};
use crate::config::ProviderConfig;
use crate::poll::{wait_until, PollOptions};
use crate::tags::TagSet;

type HmacSha1 = Hmac<Sha1>;

/// Default delay between two `queryAsyncJobResult` calls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound for a single HTTP round trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const JOB_PENDING: u64 = 0;
const JOB_SUCCEEDED: u64 = 1;

/// Request parameters, kept sorted for signing.
#[derive(Debug, Clone, Default)]
struct Params(BTreeMap<String, String>);

impl Params {
    fn new() -> Self {
        Self::default()
    }

    fn set(mut self, key: &str, value: impl ToString) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    fn set_opt<V: ToString>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.set(key, value),
            None => self,
        }
    }

    fn set_tags(mut self, resource_ids: &[String], resource_type: &str, tags: &TagSet) -> Self {
        for (i, (key, value)) in tags.iter().enumerate() {
            self.0.insert(format!("tags[{}].key", i), key.clone());
            self.0.insert(format!("tags[{}].value", i), value.clone());
        }
        self.set("resourceids", resource_ids.join(","))
            .set("resourcetype", resource_type)
    }
}

/// [`CloudStackApi`] over HTTP.
#[derive(Clone)]
pub struct CloudStackClient {
    http: reqwest::Client,
    endpoint: Url,
    api_key: String,
    signer: HmacSha1,
    http_get_only: bool,
    async_timeout: Duration,
    poll_interval: Duration,
}

impl fmt::Debug for CloudStackClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudStackClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("http_get_only", &self.http_get_only)
            .field("async_timeout", &self.async_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl CloudStackClient {
    /// Build a client from the provider configuration.
    pub fn new(config: &ProviderConfig) -> Result<Self, ApiError> {
        let endpoint = Url::parse(&config.api_url)
            .map_err(|e| ApiError::Config(format!("api_url '{}': {}", config.api_url, e)))?;
        let signer = HmacSha1::new_from_slice(config.secret_key.as_bytes())
            .map_err(|e| ApiError::Config(format!("secret_key: {}", e)))?;

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;

        Ok(Self {
            http,
            endpoint,
            api_key: config.api_key.clone(),
            signer,
            http_get_only: config.http_get_only,
            async_timeout: config.timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Change the delay between async job status checks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Signature for an already complete parameter set.
    fn sign(&self, params: &BTreeMap<String, String>) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .finish()
            .replace('+', "%20")
            .to_lowercase();

        let mut mac = self.signer.clone();
        mac.update(query.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Run a synchronous command and return the unwrapped response body.
    async fn call(&self, command: &str, params: Params) -> Result<Value, ApiError> {
        let mut params = params
            .set("command", command)
            .set("response", "json")
            .set("apiKey", &self.api_key)
            .0;
        let signature = self.sign(&params);
        params.insert("signature".to_string(), signature);

        trace!(command, "Sending CloudStack request");
        let request = if self.http_get_only || is_read_only(command) {
            let mut url = self.endpoint.clone();
            url.query_pairs_mut().extend_pairs(params.iter());
            self.http.get(url)
        } else {
            self.http.post(self.endpoint.clone()).form(&params)
        };

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        let value: Value = match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(_) if !status.is_success() => {
                return Err(ApiError::Api {
                    code: u32::from(status.as_u16()),
                    text: body,
                })
            },
            Err(e) => return Err(ApiError::Decode(format!("{}: {}", command, e))),
        };

        unwrap_envelope(command, value)
    }

    /// Run an async command and wait for its job result.
    async fn call_async(&self, command: &str, params: Params) -> Result<Value, ApiError> {
        let response = self.call(command, params).await?;
        let job_id = response
            .get("jobid")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Decode(format!("{}: response has no jobid", command)))?
            .to_string();

        debug!(command, job_id = %job_id, "Waiting for async job");
        let options = PollOptions::new(self.poll_interval, self.async_timeout);
        let job_ref = job_id.as_str();
        wait_until(options, || self.job_result(job_ref))
            .await
            .map_err(|e| ApiError::from_poll(e, format_args!("{} (job {})", command, job_id)))
    }

    async fn job_result(&self, job_id: &str) -> Result<Option<Value>, ApiError> {
        let status: JobStatus = decode(
            self.call("queryAsyncJobResult", Params::new().set("jobid", job_id))
                .await?,
        )?;

        match status.job_status {
            JOB_PENDING => Ok(None),
            JOB_SUCCEEDED => Ok(Some(status.job_result)),
            _ => {
                let failure: JobFailure =
                    serde_json::from_value(status.job_result).unwrap_or_default();
                Err(ApiError::JobFailed {
                    job_id: job_id.to_string(),
                    code: failure.error_code,
                    text: failure.error_text,
                })
            },
        }
    }

    async fn list_named(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Vec<NamedObject>, ApiError> {
        let (command, params, key) = match kind {
            ResourceKind::OsType => (
                "listOsTypes",
                Params::new().set("description", name),
                "ostype",
            ),
            ResourceKind::Zone => ("listZones", Params::new().set("name", name), "zone"),
            ResourceKind::Project => (
                "listProjects",
                Params::new().set("name", name).set("listall", true),
                "project",
            ),
        };
        decode_list(self.call(command, params).await?, key)
    }
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    #[serde(rename = "jobstatus")]
    job_status: u64,
    #[serde(default, rename = "jobresult")]
    job_result: Value,
}

#[derive(Debug, Default, Deserialize)]
struct JobFailure {
    #[serde(default, rename = "errorcode")]
    error_code: u32,
    #[serde(default, rename = "errortext")]
    error_text: String,
}

#[derive(Debug, Deserialize)]
struct NamedObject {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
}

fn is_read_only(command: &str) -> bool {
    command.starts_with("list") || command.starts_with("query") || command.starts_with("get")
}

/// Strip the `<command>response` wrapper and surface CloudStack errors.
fn unwrap_envelope(command: &str, value: Value) -> Result<Value, ApiError> {
    let Value::Object(mut outer) = value else {
        return Err(ApiError::Decode(format!("{}: expected a JSON object", command)));
    };

    let key = format!("{}response", command.to_lowercase());
    let inner = match outer.remove(&key) {
        Some(inner) => inner,
        // errors sometimes come back as `errorresponse`
        None if outer.len() == 1 => outer.into_iter().map(|(_, v)| v).next().unwrap_or_default(),
        None => return Err(ApiError::Decode(format!("{}: missing '{}'", command, key))),
    };

    if let Some(code) = inner.get("errorcode").and_then(Value::as_u64) {
        let text = inner
            .get("errortext")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(ApiError::Api {
            code: u32::try_from(code).unwrap_or(u32::MAX),
            text,
        });
    }

    Ok(inner)
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Decode the object stored under `key`.
fn decode_field<T: DeserializeOwned>(mut value: Value, key: &str) -> Result<T, ApiError> {
    match value.get_mut(key).map(Value::take) {
        Some(field) => decode(field),
        None => Err(ApiError::Decode(format!("response has no '{}'", key))),
    }
}

/// Decode the list stored under `key`; CloudStack omits the key when empty.
fn decode_list<T: DeserializeOwned>(mut value: Value, key: &str) -> Result<Vec<T>, ApiError> {
    match value.get_mut(key).map(Value::take) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(list) => decode(list),
    }
}

/// Map CloudStack's "entity does not exist" reply onto [`ApiError::NotFound`].
fn not_found_if_missing(what: String) -> impl FnOnce(ApiError) -> ApiError {
    move |err| {
        if err.entity_missing() {
            ApiError::NotFound(what)
        } else {
            err
        }
    }
}

#[async_trait]
impl CloudStackApi for CloudStackClient {
    async fn get_virtual_machine(&self, id: &str) -> Result<VirtualMachine, ApiError> {
        let what = format!("virtual machine {} not found", id);
        let response = self
            .call("listVirtualMachines", Params::new().set("id", id))
            .await
            .map_err(not_found_if_missing(what.clone()))?;

        decode_list::<VirtualMachine>(response, "virtualmachine")?
            .into_iter()
            .next()
            .ok_or(ApiError::NotFound(what))
    }

    async fn reset_password_for_virtual_machine(
        &self,
        id: &str,
    ) -> Result<VirtualMachine, ApiError> {
        let result = self
            .call_async("resetPasswordForVirtualMachine", Params::new().set("id", id))
            .await?;
        decode_field(result, "virtualmachine")
    }

    async fn list_nics(
        &self,
        virtual_machine_id: &str,
        nic_id: Option<&str>,
    ) -> Result<Vec<Nic>, ApiError> {
        let params = Params::new()
            .set("virtualmachineid", virtual_machine_id)
            .set_opt("nicid", nic_id);
        let response = self.call("listNics", params).await.map_err(not_found_if_missing(
            format!("NICs of virtual machine {} not found", virtual_machine_id),
        ))?;
        decode_list(response, "nic")
    }

    async fn add_ip_to_nic(
        &self,
        nic_id: &str,
        ip_address: Option<&str>,
    ) -> Result<SecondaryIp, ApiError> {
        let params = Params::new()
            .set("nicid", nic_id)
            .set_opt("ipaddress", ip_address);
        let result = self.call_async("addIpToNic", params).await?;
        decode_field(result, "nicsecondaryip")
    }

    async fn remove_ip_from_nic(&self, id: &str) -> Result<(), ApiError> {
        self.call_async("removeIpFromNic", Params::new().set("id", id))
            .await
            .map(drop)
    }

    async fn register_template(&self, params: &RegisterTemplate) -> Result<Template, ApiError> {
        let request = Params::new()
            .set("name", &params.name)
            .set("displaytext", &params.display_text)
            .set("format", &params.format)
            .set("hypervisor", &params.hypervisor)
            .set("url", &params.url)
            .set("zoneid", params.zone_id.as_deref().unwrap_or("-1"))
            .set_opt("ostypeid", params.os_type_id.as_deref())
            .set_opt("projectid", params.project_id.as_deref())
            .set_opt("isdynamicallyscalable", params.is_dynamically_scalable)
            .set_opt("isextractable", params.is_extractable)
            .set_opt("isfeatured", params.is_featured)
            .set_opt("ispublic", params.is_public)
            .set_opt("passwordenabled", params.password_enabled);

        let response = self.call("registerTemplate", request).await?;
        decode_list::<Template>(response, "template")?
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::Decode("registerTemplate returned no template".to_string()))
    }

    async fn get_template(
        &self,
        id: &str,
        project_id: Option<&str>,
    ) -> Result<Template, ApiError> {
        let what = format!("template {} not found", id);
        let params = Params::new()
            .set("id", id)
            .set("templatefilter", "executable")
            .set_opt("projectid", project_id);
        let response = self
            .call("listTemplates", params)
            .await
            .map_err(not_found_if_missing(what.clone()))?;

        decode_list::<Template>(response, "template")?
            .into_iter()
            .next()
            .ok_or(ApiError::NotFound(what))
    }

    async fn update_template(&self, params: &UpdateTemplate) -> Result<Template, ApiError> {
        let request = Params::new()
            .set("id", &params.id)
            .set_opt("name", params.name.as_deref())
            .set_opt("displaytext", params.display_text.as_deref())
            .set_opt("format", params.format.as_deref())
            .set_opt("isdynamicallyscalable", params.is_dynamically_scalable)
            .set_opt("ostypeid", params.os_type_id.as_deref())
            .set_opt("passwordenabled", params.password_enabled);

        let response = self.call("updateTemplate", request).await?;
        decode_field(response, "template")
    }

    async fn delete_template(&self, id: &str) -> Result<(), ApiError> {
        self.call_async("deleteTemplate", Params::new().set("id", id))
            .await
            .map(drop)
    }

    async fn create_tags(
        &self,
        resource_ids: &[String],
        resource_type: &str,
        tags: &TagSet,
    ) -> Result<(), ApiError> {
        let params = Params::new().set_tags(resource_ids, resource_type, tags);
        self.call_async("createTags", params).await.map(drop)
    }

    async fn delete_tags(
        &self,
        resource_ids: &[String],
        resource_type: &str,
        tags: &TagSet,
    ) -> Result<(), ApiError> {
        let params = Params::new().set_tags(resource_ids, resource_type, tags);
        self.call_async("deleteTags", params).await.map(drop)
    }

    async fn create_ssh_key_pair(
        &self,
        name: &str,
        project_id: Option<&str>,
    ) -> Result<SshKeyPair, ApiError> {
        let params = Params::new()
            .set("name", name)
            .set_opt("projectid", project_id);
        decode_field(self.call("createSSHKeyPair", params).await?, "keypair")
    }

    async fn register_ssh_key_pair(
        &self,
        name: &str,
        public_key: &str,
        project_id: Option<&str>,
    ) -> Result<SshKeyPair, ApiError> {
        let params = Params::new()
            .set("name", name)
            .set("publickey", public_key)
            .set_opt("projectid", project_id);
        decode_field(self.call("registerSSHKeyPair", params).await?, "keypair")
    }

    async fn list_ssh_key_pairs(
        &self,
        name: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<SshKeyPair>, ApiError> {
        let params = Params::new()
            .set("name", name)
            .set_opt("projectid", project_id);
        decode_list(self.call("listSSHKeyPairs", params).await?, "sshkeypair")
    }

    async fn delete_ssh_key_pair(
        &self,
        name: &str,
        project_id: Option<&str>,
    ) -> Result<(), ApiError> {
        let params = Params::new()
            .set("name", name)
            .set_opt("projectid", project_id);
        self.call("deleteSSHKeyPair", params).await.map(drop)
    }

    async fn create_firewall_rule(
        &self,
        params: &CreateFirewallRule,
    ) -> Result<FirewallRule, ApiError> {
        let request = Params::new()
            .set("ipaddressid", &params.ip_address_id)
            .set("protocol", &params.protocol)
            .set("cidrlist", params.cidr_list.join(","))
            .set_opt("startport", params.start_port)
            .set_opt("endport", params.end_port)
            .set_opt("icmptype", params.icmp_type)
            .set_opt("icmpcode", params.icmp_code);

        let result = self.call_async("createFirewallRule", request).await?;
        decode_field(result, "firewallrule")
    }

    async fn list_firewall_rules(
        &self,
        ip_address_id: &str,
    ) -> Result<Vec<FirewallRule>, ApiError> {
        let params = Params::new()
            .set("ipaddressid", ip_address_id)
            .set("listall", true);
        let response = self.call("listFirewallRules", params).await.map_err(
            not_found_if_missing(format!("IP address {} not found", ip_address_id)),
        )?;
        decode_list(response, "firewallrule")
    }

    async fn delete_firewall_rule(&self, id: &str) -> Result<(), ApiError> {
        self.call_async("deleteFirewallRule", Params::new().set("id", id))
            .await
            .map(drop)
    }

    async fn find_id_by_name(&self, kind: ResourceKind, name: &str) -> Result<String, ApiError> {
        let mut matches: Vec<NamedObject> = self
            .list_named(kind, name)
            .await?
            .into_iter()
            .filter(|object| match kind {
                ResourceKind::OsType => object.description == name,
                _ => object.name == name,
            })
            .collect();

        match matches.len() {
            0 => Err(ApiError::NotFound(format!("no {} named '{}'", kind, name))),
            1 => Ok(matches.remove(0).id),
            n => Err(ApiError::Ambiguous(format!(
                "found {} {} objects named '{}'",
                n, kind, name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const API_PATH: &str = "/client/api";

    fn client_for(server: &MockServer) -> CloudStackClient {
        let config = ProviderConfig::new(format!("{}{}", server.uri(), API_PATH), "key", "secret");
        CloudStackClient::new(&config)
            .unwrap()
            .with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_signature_matches_cloudstack_scheme() {
        let config = ProviderConfig::new("http://localhost:8080/client/api", "key", "secret");
        let client = CloudStackClient::new(&config).unwrap();

        let params = Params::new()
            .set("name", "my zone")
            .set("command", "listZones")
            .set("response", "json")
            .set("apiKey", "key");

        assert_eq!(client.sign(&params.0), "Fn8gvHp+0/OlmScB+d0xuw7393Q=");
    }

    #[test]
    fn test_debug_hides_credentials() {
        let config = ProviderConfig::new("http://localhost:8080/client/api", "key", "hunter2");
        let client = CloudStackClient::new(&config).unwrap();
        let debug = format!("{:?}", client);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("localhost:8080"));
    }

    #[test]
    fn test_new_rejects_bad_url() {
        let config = ProviderConfig::new("::not a url::", "key", "secret");
        assert!(matches!(
            CloudStackClient::new(&config),
            Err(ApiError::Config(_))
        ));
    }

    #[test]
    fn test_tag_params() {
        let tags: TagSet = [("env".to_string(), "prod".to_string())].into_iter().collect();
        let params = Params::new().set_tags(&["a".to_string(), "b".to_string()], "Template", &tags);

        assert_eq!(params.0["tags[0].key"], "env");
        assert_eq!(params.0["tags[0].value"], "prod");
        assert_eq!(params.0["resourceids"], "a,b");
        assert_eq!(params.0["resourcetype"], "Template");
    }

    #[test]
    fn test_unwrap_envelope_error() {
        let err = unwrap_envelope(
            "deleteTemplate",
            json!({
                "deletetemplateresponse": {"errorcode": 431, "errortext": "entity does not exist"}
            }),
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::Api { code: 431, .. }));
        assert!(err.entity_missing());
    }

    #[tokio::test]
    async fn test_get_virtual_machine_signed_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(API_PATH))
            .and(query_param("command", "listVirtualMachines"))
            .and(query_param("id", "vm-1"))
            .and(query_param("apiKey", "key"))
            .and(query_param("response", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "listvirtualmachinesresponse": {
                    "count": 1,
                    "virtualmachine": [{
                        "id": "vm-1",
                        "name": "web",
                        "nic": [{"id": "nic-1", "virtualmachineid": "vm-1"}]
                    }]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let vm = client_for(&server).get_virtual_machine("vm-1").await.unwrap();
        assert_eq!(vm.name, "web");
        assert_eq!(vm.nics[0].id, "nic-1");
    }

    #[tokio::test]
    async fn test_missing_virtual_machine_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("command", "listVirtualMachines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "listvirtualmachinesresponse": {}
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .get_virtual_machine("vm-gone")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_error_status_surfaces_errortext() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("command", "listTemplates"))
            .respond_with(ResponseTemplate::new(431).set_body_json(json!({
                "listtemplatesresponse": {
                    "uuidList": [],
                    "errorcode": 431,
                    "cserrorcode": 9999,
                    "errortext": "Unable to execute API command listtemplates due to invalid value"
                }
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .get_template("tpl-1", None)
            .await
            .unwrap_err();
        match err {
            ApiError::Api { code, text } => {
                assert_eq!(code, 431);
                assert!(text.contains("invalid value"));
            },
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_async_job_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(API_PATH))
            .and(body_string_contains("command=createFirewallRule"))
            .and(body_string_contains("cidrlist=10.0.0.0%2F8%2C192.168.0.0%2F16"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "createfirewallruleresponse": {"id": "fw-1", "jobid": "job-1"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("command", "queryAsyncJobResult"))
            .and(query_param("jobid", "job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "queryasyncjobresultresponse": {
                    "jobid": "job-1",
                    "jobstatus": 1,
                    "jobresult": {
                        "firewallrule": {
                            "id": "fw-1",
                            "protocol": "tcp",
                            "startport": 80,
                            "endport": 80,
                            "cidrlist": "10.0.0.0/8,192.168.0.0/16",
                            "ipaddressid": "ip-1"
                        }
                    }
                }
            })))
            .mount(&server)
            .await;

        let rule = client_for(&server)
            .create_firewall_rule(&CreateFirewallRule {
                ip_address_id: "ip-1".to_string(),
                protocol: "tcp".to_string(),
                cidr_list: vec!["10.0.0.0/8".to_string(), "192.168.0.0/16".to_string()],
                start_port: Some(80),
                end_port: Some(80),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(rule.id, "fw-1");
        assert_eq!(rule.start_port, Some(80));
    }

    #[tokio::test]
    async fn test_async_job_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=deleteTemplate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "deletetemplateresponse": {"jobid": "job-2"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("command", "queryAsyncJobResult"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "queryasyncjobresultresponse": {
                    "jobstatus": 2,
                    "jobresult": {"errorcode": 530, "errortext": "Template is in use"}
                }
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .delete_template("tpl-1")
            .await
            .unwrap_err();
        match err {
            ApiError::JobFailed { job_id, code, text } => {
                assert_eq!(job_id, "job-2");
                assert_eq!(code, 530);
                assert_eq!(text, "Template is in use");
            },
            other => panic!("expected job failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_async_job_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=removeIpFromNic"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "removeipfromnicresponse": {"jobid": "job-3"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("command", "queryAsyncJobResult"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "queryasyncjobresultresponse": {"jobstatus": 0}
            })))
            .mount(&server)
            .await;

        let mut config =
            ProviderConfig::new(format!("{}{}", server.uri(), API_PATH), "key", "secret");
        config.timeout = Duration::ZERO;
        let client = CloudStackClient::new(&config).unwrap();

        let err = client.remove_ip_from_nic("ip-1").await.unwrap_err();
        assert!(matches!(err, ApiError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_http_get_only_sends_mutations_as_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("command", "deleteSSHKeyPair"))
            .and(query_param("name", "deploy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "deletesshkeypairresponse": {"success": "true"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config =
            ProviderConfig::new(format!("{}{}", server.uri(), API_PATH), "key", "secret");
        config.http_get_only = true;
        let client = CloudStackClient::new(&config).unwrap();

        client.delete_ssh_key_pair("deploy", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_find_id_by_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("command", "listOsTypes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "listostypesresponse": {
                    "count": 2,
                    "ostype": [
                        {"id": "os-1", "description": "CentOS 7 (64-bit)"},
                        {"id": "os-2", "description": "CentOS 7.9 (64-bit)"}
                    ]
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("command", "listZones"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "listzonesresponse": {
                    "count": 2,
                    "zone": [
                        {"id": "zone-1", "name": "Sandbox"},
                        {"id": "zone-2", "name": "Sandbox"}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(
            client
                .find_id_by_name(ResourceKind::OsType, "CentOS 7 (64-bit)")
                .await
                .unwrap(),
            "os-1"
        );
        assert!(matches!(
            client.find_id_by_name(ResourceKind::Zone, "Sandbox").await,
            Err(ApiError::Ambiguous(_))
        ));
        assert!(matches!(
            client.find_id_by_name(ResourceKind::OsType, "Plan 9").await,
            Err(ApiError::NotFound(_))
        ));
    }
}
