//! CloudStack API access.
//!
//! Resource handlers talk to CloudStack only through the [`CloudStackApi`]
//! trait, which they receive explicitly on every call. [`http::CloudStackClient`]
//! is the production implementation; [`crate::testing::FakeCloud`] is an
//! in-memory one for tests.

pub mod http;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::poll::PollError;
use crate::tags::TagSet;

pub use http::CloudStackClient;

/// Errors returned by a [`CloudStackApi`] implementation.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A lookup matched nothing.
    #[error("{0}")]
    NotFound(String),

    /// CloudStack answered with an error response.
    #[error("CloudStack API error {code}: {text}")]
    Api {
        /// CloudStack error code (e.g. 431 for bad parameters).
        code: u32,
        /// CloudStack error text.
        text: String,
    },

    /// An async job finished with a failure.
    #[error("async job {job_id} failed with error {code}: {text}")]
    JobFailed {
        /// The job that failed.
        job_id: String,
        /// CloudStack error code.
        code: u32,
        /// CloudStack error text.
        text: String,
    },

    /// An async job did not finish in time.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The HTTP request itself failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The response could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),

    /// A name lookup matched more than one object.
    #[error("{0}")]
    Ambiguous(String),

    /// The client could not be built from its configuration.
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ApiError {
    /// Whether CloudStack reported that the addressed entity does not exist.
    ///
    /// CloudStack has no dedicated status for this; deletes of vanished
    /// objects fail with a 431 whose text ends in "entity does not exist"
    /// (or "does not exist" for key pairs).
    pub fn entity_missing(&self) -> bool {
        match self {
            ApiError::NotFound(_) => true,
            ApiError::Api { text, .. } | ApiError::JobFailed { text, .. } => {
                text.contains("does not exist")
            },
            _ => false,
        }
    }

    pub(crate) fn from_poll(err: PollError<ApiError>, what: impl fmt::Display) -> Self {
        match err {
            PollError::Timeout { elapsed } => {
                ApiError::Timeout(format!("{} ({:?} elapsed)", what, elapsed))
            },
            PollError::Check(err) => err,
        }
    }
}

/// Lookup namespaces that accept either a UUID or a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// Guest OS types, looked up by description.
    OsType,
    /// Zones.
    Zone,
    /// Projects.
    Project,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::OsType => "os_type",
            ResourceKind::Zone => "zone",
            ResourceKind::Project => "project",
        };
        f.write_str(name)
    }
}

/// Whether `value` is a CloudStack UUID rather than a name.
pub fn is_id(value: &str) -> bool {
    Uuid::parse_str(value).is_ok()
}

/// Turn a name-or-UUID into a UUID.
pub async fn resolve_id(
    api: &dyn CloudStackApi,
    kind: ResourceKind,
    value: &str,
) -> Result<String, ApiError> {
    if is_id(value) {
        return Ok(value.to_string());
    }

    debug!(%kind, name = value, "Looking up ID by name");
    api.find_id_by_name(kind, value).await
}

/// A virtual machine, reduced to what the handlers need.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachine {
    /// VM UUID.
    pub id: String,
    /// VM name.
    #[serde(default)]
    pub name: String,
    /// Attached NICs; the first one is the default NIC.
    #[serde(default, rename = "nic")]
    pub nics: Vec<Nic>,
    /// Only present in the response to a password reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// A network interface of a virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    /// NIC UUID.
    pub id: String,
    /// Owning VM UUID.
    #[serde(default, rename = "virtualmachineid")]
    pub virtual_machine_id: String,
    /// Secondary IPs assigned to this NIC.
    #[serde(default, rename = "secondaryip")]
    pub secondary_ips: Vec<SecondaryIp>,
}

/// A secondary IP address on a NIC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryIp {
    /// Secondary IP UUID.
    pub id: String,
    /// The address.
    #[serde(rename = "ipaddress")]
    pub ip_address: String,
}

/// A tag as returned inside other objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

/// A registered template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Template {
    /// Template UUID.
    pub id: String,
    /// Template name.
    pub name: String,
    /// Display text.
    #[serde(rename = "displaytext")]
    pub display_text: String,
    /// Image format (QCOW2, VHD, ...).
    pub format: String,
    /// Target hypervisor.
    pub hypervisor: String,
    /// Whether the template supports dynamic scaling.
    #[serde(rename = "isdynamicallyscalable")]
    pub is_dynamically_scalable: bool,
    /// Whether the template can be downloaded.
    #[serde(rename = "isextractable")]
    pub is_extractable: bool,
    /// Whether the template is featured.
    #[serde(rename = "isfeatured")]
    pub is_featured: bool,
    /// Whether the template is visible to all accounts.
    #[serde(rename = "ispublic")]
    pub is_public: bool,
    /// Whether the template supports password reset.
    #[serde(rename = "passwordenabled")]
    pub password_enabled: bool,
    /// Whether the template has finished downloading and can be used.
    #[serde(rename = "isready")]
    pub is_ready: bool,
    /// Guest OS type UUID.
    #[serde(rename = "ostypeid")]
    pub os_type_id: String,
    /// Guest OS type description.
    #[serde(rename = "ostypename")]
    pub os_type_name: String,
    /// Project name, empty when not in a project.
    pub project: String,
    /// Project UUID.
    #[serde(rename = "projectid")]
    pub project_id: String,
    /// Zone UUID.
    #[serde(rename = "zoneid")]
    pub zone_id: String,
    /// Zone name.
    #[serde(rename = "zonename")]
    pub zone_name: String,
    /// Tags attached to the template.
    pub tags: Vec<Tag>,
}

impl Template {
    /// The template's tags as a [`TagSet`].
    pub fn tag_set(&self) -> TagSet {
        self.tags
            .iter()
            .map(|tag| (tag.key.clone(), tag.value.clone()))
            .collect()
    }
}

/// Parameters for `registerTemplate`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterTemplate {
    /// Template name.
    pub name: String,
    /// Display text.
    pub display_text: String,
    /// Image format.
    pub format: String,
    /// Target hypervisor.
    pub hypervisor: String,
    /// Where to download the image from.
    pub url: String,
    /// Guest OS type UUID.
    pub os_type_id: Option<String>,
    /// Zone UUID; all zones when unset.
    pub zone_id: Option<String>,
    /// Project UUID.
    pub project_id: Option<String>,
    /// Whether the template supports dynamic scaling.
    pub is_dynamically_scalable: Option<bool>,
    /// Whether the template can be downloaded.
    pub is_extractable: Option<bool>,
    /// Whether the template is featured.
    pub is_featured: Option<bool>,
    /// Whether the template is visible to all accounts.
    pub is_public: Option<bool>,
    /// Whether the template supports password reset.
    pub password_enabled: Option<bool>,
}

/// Parameters for `updateTemplate`. Unset fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateTemplate {
    /// Template UUID.
    pub id: String,
    /// New name.
    pub name: Option<String>,
    /// New display text.
    pub display_text: Option<String>,
    /// New image format.
    pub format: Option<String>,
    /// Whether the template supports dynamic scaling.
    pub is_dynamically_scalable: Option<bool>,
    /// Guest OS type UUID.
    pub os_type_id: Option<String>,
    /// Whether the template supports password reset.
    pub password_enabled: Option<bool>,
}

/// An SSH key pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKeyPair {
    /// Key pair name; also its identifier.
    pub name: String,
    /// MD5 fingerprint of the public key.
    #[serde(default)]
    pub fingerprint: String,
    /// Only returned when CloudStack generated the key pair.
    #[serde(default, rename = "privatekey", skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

/// A firewall rule on a public IP address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallRule {
    /// Rule UUID.
    pub id: String,
    /// tcp, udp, icmp or all.
    pub protocol: String,
    /// Comma-separated source CIDRs.
    #[serde(rename = "cidrlist")]
    pub cidr_list: String,
    /// First port of the range.
    #[serde(rename = "startport", skip_serializing_if = "Option::is_none")]
    pub start_port: Option<u16>,
    /// Last port of the range.
    #[serde(rename = "endport", skip_serializing_if = "Option::is_none")]
    pub end_port: Option<u16>,
    /// ICMP type, for icmp rules.
    #[serde(rename = "icmptype", skip_serializing_if = "Option::is_none")]
    pub icmp_type: Option<i32>,
    /// ICMP code, for icmp rules.
    #[serde(rename = "icmpcode", skip_serializing_if = "Option::is_none")]
    pub icmp_code: Option<i32>,
    /// The public IP address UUID the rule belongs to.
    #[serde(rename = "ipaddressid")]
    pub ip_address_id: String,
}

/// Parameters for `createFirewallRule`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateFirewallRule {
    /// The public IP address UUID.
    pub ip_address_id: String,
    /// tcp, udp, icmp or all.
    pub protocol: String,
    /// Source CIDRs.
    pub cidr_list: Vec<String>,
    /// First port of the range.
    pub start_port: Option<u16>,
    /// Last port of the range.
    pub end_port: Option<u16>,
    /// ICMP type, for icmp rules.
    pub icmp_type: Option<i32>,
    /// ICMP code, for icmp rules.
    pub icmp_code: Option<i32>,
}

/// The CloudStack operations used by the resource handlers.
///
/// Lookups of a single object by ID return [`ApiError::NotFound`] when it
/// does not exist. Mutating calls that CloudStack runs as async jobs return
/// once the job has finished.
#[async_trait]
pub trait CloudStackApi: Send + Sync {
    /// Fetch a virtual machine by UUID.
    async fn get_virtual_machine(&self, id: &str) -> Result<VirtualMachine, ApiError>;

    /// Reset a VM's password; the response carries the new password.
    async fn reset_password_for_virtual_machine(
        &self,
        id: &str,
    ) -> Result<VirtualMachine, ApiError>;

    /// List a VM's NICs, optionally narrowed to one NIC.
    async fn list_nics(
        &self,
        virtual_machine_id: &str,
        nic_id: Option<&str>,
    ) -> Result<Vec<Nic>, ApiError>;

    /// Add a secondary IP to a NIC; CloudStack picks one when `ip_address` is unset.
    async fn add_ip_to_nic(
        &self,
        nic_id: &str,
        ip_address: Option<&str>,
    ) -> Result<SecondaryIp, ApiError>;

    /// Remove a secondary IP by its UUID.
    async fn remove_ip_from_nic(&self, id: &str) -> Result<(), ApiError>;

    /// Register a template from a URL.
    async fn register_template(&self, params: &RegisterTemplate) -> Result<Template, ApiError>;

    /// Fetch an executable template by UUID.
    async fn get_template(&self, id: &str, project_id: Option<&str>)
        -> Result<Template, ApiError>;

    /// Update mutable template attributes.
    async fn update_template(&self, params: &UpdateTemplate) -> Result<Template, ApiError>;

    /// Delete a template.
    async fn delete_template(&self, id: &str) -> Result<(), ApiError>;

    /// Attach tags to resources.
    async fn create_tags(
        &self,
        resource_ids: &[String],
        resource_type: &str,
        tags: &TagSet,
    ) -> Result<(), ApiError>;

    /// Detach tags from resources.
    async fn delete_tags(
        &self,
        resource_ids: &[String],
        resource_type: &str,
        tags: &TagSet,
    ) -> Result<(), ApiError>;

    /// Generate a new key pair; the response carries the private key.
    async fn create_ssh_key_pair(
        &self,
        name: &str,
        project_id: Option<&str>,
    ) -> Result<SshKeyPair, ApiError>;

    /// Register an existing public key.
    async fn register_ssh_key_pair(
        &self,
        name: &str,
        public_key: &str,
        project_id: Option<&str>,
    ) -> Result<SshKeyPair, ApiError>;

    /// List key pairs with the given name.
    async fn list_ssh_key_pairs(
        &self,
        name: &str,
        project_id: Option<&str>,
    ) -> Result<Vec<SshKeyPair>, ApiError>;

    /// Delete a key pair by name.
    async fn delete_ssh_key_pair(&self, name: &str, project_id: Option<&str>)
        -> Result<(), ApiError>;

    /// Create a firewall rule.
    async fn create_firewall_rule(
        &self,
        params: &CreateFirewallRule,
    ) -> Result<FirewallRule, ApiError>;

    /// List all firewall rules on a public IP address.
    async fn list_firewall_rules(&self, ip_address_id: &str)
        -> Result<Vec<FirewallRule>, ApiError>;

    /// Delete a firewall rule.
    async fn delete_firewall_rule(&self, id: &str) -> Result<(), ApiError>;

    /// Look up the UUID of a named object. Prefer [`resolve_id`], which skips
    /// the lookup for values that already are UUIDs.
    async fn find_id_by_name(&self, kind: ResourceKind, name: &str) -> Result<String, ApiError>;
}
