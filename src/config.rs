//! Provider configuration.
//!
//! The host passes the `provider "cloudstack" { ... }` block to
//! [`ProviderService::configure`](crate::ProviderService::configure) as JSON.
//! Credentials may be left out of the block and supplied through the
//! environment instead:
//!
//! - `CLOUDSTACK_API_URL`
//! - `CLOUDSTACK_API_KEY`
//! - `CLOUDSTACK_SECRET_KEY`
//! - `CLOUDSTACK_TIMEOUT` (seconds)

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::schema::{Attribute, Diagnostic, Schema};

/// Default time allowed for a CloudStack async job to finish.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(900);

const ENV_API_URL: &str = "CLOUDSTACK_API_URL";
const ENV_API_KEY: &str = "CLOUDSTACK_API_KEY";
const ENV_SECRET_KEY: &str = "CLOUDSTACK_SECRET_KEY";
const ENV_TIMEOUT: &str = "CLOUDSTACK_TIMEOUT";

/// The configuration block as written by the user.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    api_url: Option<String>,
    api_key: Option<String>,
    secret_key: Option<String>,
    http_get_only: Option<bool>,
    timeout: Option<u64>,
    verify_ssl: Option<bool>,
}

/// Resolved provider configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// CloudStack API endpoint, e.g. `https://cloud.example.com/client/api`.
    pub api_url: String,
    /// API key of the account the provider acts as.
    pub api_key: String,
    /// Secret key used to sign requests.
    pub secret_key: String,
    /// Send every command as GET instead of POST.
    pub http_get_only: bool,
    /// How long to wait for async jobs.
    pub timeout: Duration,
    /// Verify the API endpoint's TLS certificate.
    pub verify_ssl: bool,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("http_get_only", &self.http_get_only)
            .field("timeout", &self.timeout)
            .field("verify_ssl", &self.verify_ssl)
            .finish()
    }
}

impl ProviderConfig {
    /// Build a configuration from explicit values, with defaults for the rest.
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            http_get_only: false,
            timeout: DEFAULT_TIMEOUT,
            verify_ssl: true,
        }
    }

    /// Parse the configuration block, falling back to the process environment.
    pub fn from_json(config: &Value) -> Result<Self, Vec<Diagnostic>> {
        Self::from_json_with_env(config, |key| std::env::var(key).ok())
    }

    /// Parse the configuration block, falling back to `env` for unset values.
    pub fn from_json_with_env<F>(config: &Value, env: F) -> Result<Self, Vec<Diagnostic>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = match config {
            Value::Null => RawConfig::default(),
            other => serde_json::from_value(other.clone()).map_err(|e| {
                vec![Diagnostic::error("Invalid provider configuration").with_detail(e.to_string())]
            })?,
        };

        let mut diagnostics = Vec::new();
        let mut required = |value: Option<String>, attribute: &str, env_key: &str| {
            match value.filter(|v| !v.is_empty()).or_else(|| env(env_key)) {
                Some(v) => v,
                None => {
                    diagnostics.push(
                        Diagnostic::error(format!("Missing required attribute '{}'", attribute))
                            .with_detail(format!(
                                "Set '{}' in the provider block or the {} environment variable",
                                attribute, env_key
                            ))
                            .with_attribute(attribute),
                    );
                    String::new()
                },
            }
        };

        let api_url = required(raw.api_url, "api_url", ENV_API_URL);
        let api_key = required(raw.api_key, "api_key", ENV_API_KEY);
        let secret_key = required(raw.secret_key, "secret_key", ENV_SECRET_KEY);

        let timeout = match raw.timeout {
            Some(secs) => Duration::from_secs(secs),
            None => match env(ENV_TIMEOUT) {
                Some(value) => match value.parse::<u64>() {
                    Ok(secs) => Duration::from_secs(secs),
                    Err(_) => {
                        diagnostics.push(
                            Diagnostic::error(format!("Invalid {} value '{}'", ENV_TIMEOUT, value))
                                .with_detail("Expected a number of seconds")
                                .with_attribute("timeout"),
                        );
                        DEFAULT_TIMEOUT
                    },
                },
                None => DEFAULT_TIMEOUT,
            },
        };

        if !api_url.is_empty() && url::Url::parse(&api_url).is_err() {
            diagnostics.push(
                Diagnostic::error(format!("Invalid api_url '{}'", api_url))
                    .with_detail(
                        "Expected an absolute URL such as https://cloud.example.com/client/api",
                    )
                    .with_attribute("api_url"),
            );
        }

        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }

        Ok(Self {
            api_url,
            api_key,
            secret_key,
            http_get_only: raw.http_get_only.unwrap_or(false),
            timeout,
            verify_ssl: raw.verify_ssl.unwrap_or(true),
        })
    }

    /// Schema of the provider configuration block.
    pub fn schema() -> Schema {
        Schema::v0()
            .with_attribute(
                "api_url",
                Attribute::optional_string().with_description("CloudStack API endpoint"),
            )
            .with_attribute("api_key", Attribute::optional_string().sensitive())
            .with_attribute("secret_key", Attribute::optional_string().sensitive())
            .with_attribute(
                "http_get_only",
                Attribute::optional_bool().with_default(json!(false)),
            )
            .with_attribute(
                "timeout",
                Attribute::optional_int64()
                    .with_description("Seconds to wait for async jobs")
                    .with_default(json!(DEFAULT_TIMEOUT.as_secs())),
            )
            .with_attribute(
                "verify_ssl",
                Attribute::optional_bool().with_default(json!(true)),
            )
    }
}
