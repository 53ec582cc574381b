//! Hemmer Provider for Apache CloudStack
//!
//! This crate implements the Hemmer provider interface for a handful of
//! CloudStack resource types:
//!
//! | Resource type                        | Remote object                         |
//! |--------------------------------------|---------------------------------------|
//! | `cloudstack_template`                | a VM template registered from a URL   |
//! | `cloudstack_secondary_ipaddress`     | a secondary IP on a VM's NIC          |
//! | `cloudstack_instance_reset_password` | a VM password reset                   |
//! | `cloudstack_ssh_keypair`             | an SSH key pair                       |
//! | `cloudstack_firewall`                | the firewall rules on a public IP     |
//!
//! # Overview
//!
//! - **[`CloudStackProvider`]**: implements [`ProviderService`] and routes each
//!   operation to the handler for its resource type
//! - **[`client`]**: the [`CloudStackApi`](client::CloudStackApi) trait and its
//!   signed HTTP implementation
//! - **[`tags`]**: the tag reconciler shared by taggable resources
//! - **[`plan`]**: schema-driven planning (defaults, computed values, replacement)
//! - **[`poll`]**: the retry-with-timeout primitive behind template readiness
//!   and async job polling
//! - **[`testing`]**: an in-memory CloudStack and a lifecycle test harness
//!
//! # Quick Start
//!
//! ```ignore
//! use hemmer_provider_cloudstack::{init_logging, CloudStackProvider, ProviderService};
//! use serde_json::json;
//!
//! init_logging();
//!
//! let provider = CloudStackProvider::new();
//! provider.configure(json!({
//!     "api_url": "https://cloud.example.com/client/api",
//!     "api_key": "...",
//!     "secret_key": "...",
//! })).await?;
//!
//! let plan = provider
//!     .plan("cloudstack_ssh_keypair", None, json!({"name": "deploy"}), json!({}))
//!     .await?;
//! let state = provider.create("cloudstack_ssh_keypair", plan.planned_state).await?;
//! ```
//!
//! # Errors
//!
//! Every operation returns [`ProviderError`]. [`ProviderError::NotFound`]
//! from `read` means the remote object is gone and should be dropped from
//! state; every other variant aborts the operation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod plan;
pub mod poll;
pub mod provider;
pub mod resources;
pub mod schema;
pub mod service;
pub mod state;
pub mod tags;
pub mod testing;
pub mod types;
pub mod validation;

// Re-export main types at crate root
pub use client::{ApiError, CloudStackApi, CloudStackClient};
pub use config::ProviderConfig;
pub use error::ProviderError;
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::CloudStackProvider;
pub use schema::ProviderSchema;
pub use service::ProviderService;
pub use types::{AttributeChange, ImportedResource, PlanResult, ProviderMetadata};
pub use validation::validate;

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tonic;
pub use tracing;
