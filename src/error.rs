//! Error types for the CloudStack provider.

use thiserror::Error;

use crate::client::ApiError;

/// Errors returned by provider operations.
///
/// `NotFound` is the only non-fatal variant: it tells the host that the
/// remote object is gone and should be dropped from state. Everything else
/// aborts the current operation.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The remote object no longer exists.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The CloudStack API rejected a call or could not be reached.
    #[error("Remote failure: {0}")]
    RemoteFailure(String),

    /// A wait loop ran past its deadline.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// A validation error occurred.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The provider is not configured, or its configuration is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The requested resource type is unknown.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid request from the host.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Operation not implemented for this resource type.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),
}

impl ProviderError {
    /// Get the error message without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(msg)
            | Self::RemoteFailure(msg)
            | Self::DeadlineExceeded(msg)
            | Self::Validation(msg)
            | Self::Configuration(msg)
            | Self::UnknownResource(msg)
            | Self::InvalidRequest(msg)
            | Self::Unimplemented(msg) => msg,
            Self::Serialization(_err) => "serialization error (see Debug output)",
        }
    }

    /// Whether this error signals that the remote object is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Prefix the message with context, keeping the variant.
    ///
    /// # Examples
    ///
    /// ```
    /// use hemmer_provider_cloudstack::ProviderError;
    ///
    /// let err = ProviderError::RemoteFailure("quota exceeded".to_string())
    ///     .context("Error creating template web");
    /// assert_eq!(err.message(), "Error creating template web: quota exceeded");
    /// ```
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        let wrap = |msg: String| format!("{}: {}", context, msg);
        match self {
            Self::NotFound(msg) => Self::NotFound(wrap(msg)),
            Self::RemoteFailure(msg) => Self::RemoteFailure(wrap(msg)),
            Self::DeadlineExceeded(msg) => Self::DeadlineExceeded(wrap(msg)),
            Self::Validation(msg) => Self::Validation(wrap(msg)),
            Self::Configuration(msg) => Self::Configuration(wrap(msg)),
            Self::UnknownResource(msg) => Self::UnknownResource(wrap(msg)),
            Self::InvalidRequest(msg) => Self::InvalidRequest(wrap(msg)),
            Self::Unimplemented(msg) => Self::Unimplemented(wrap(msg)),
            Self::Serialization(err) => Self::Serialization(err),
        }
    }
}

impl From<ApiError> for ProviderError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::NotFound(msg) => ProviderError::NotFound(msg),
            ApiError::Timeout(msg) => ProviderError::DeadlineExceeded(msg),
            ApiError::Config(msg) => ProviderError::Configuration(msg),
            other => ProviderError::RemoteFailure(other.to_string()),
        }
    }
}

impl From<ProviderError> for tonic::Status {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(msg) => tonic::Status::not_found(msg),
            ProviderError::RemoteFailure(msg) => tonic::Status::unavailable(msg),
            ProviderError::DeadlineExceeded(msg) => tonic::Status::deadline_exceeded(msg),
            ProviderError::Validation(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::Configuration(msg) => tonic::Status::failed_precondition(msg),
            ProviderError::UnknownResource(msg) => tonic::Status::not_found(msg),
            ProviderError::Serialization(err) => {
                tonic::Status::invalid_argument(format!("Serialization error: {}", err))
            },
            ProviderError::InvalidRequest(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::Unimplemented(msg) => tonic::Status::unimplemented(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProviderError::NotFound("template 123".to_string());
        assert_eq!(format!("{}", err), "Resource not found: template 123");

        let err = ProviderError::RemoteFailure("connection refused".to_string());
        assert_eq!(format!("{}", err), "Remote failure: connection refused");

        let err = ProviderError::DeadlineExceeded("template not ready".to_string());
        assert_eq!(format!("{}", err), "Deadline exceeded: template not ready");

        let err = ProviderError::UnknownResource("cloudstack_volume".to_string());
        assert_eq!(format!("{}", err), "Unknown resource type: cloudstack_volume");
    }

    #[test]
    fn test_error_to_status() {
        let status: tonic::Status = ProviderError::NotFound("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = ProviderError::RemoteFailure("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let status: tonic::Status = ProviderError::DeadlineExceeded("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);

        let status: tonic::Status = ProviderError::Validation("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status: tonic::Status = ProviderError::Configuration("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let status: tonic::Status = ProviderError::Unimplemented("test".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Unimplemented);
    }

    #[test]
    fn test_api_error_taxonomy() {
        let err: ProviderError = ApiError::NotFound("vm-1".to_string()).into();
        assert!(err.is_not_found());

        let err: ProviderError = ApiError::Timeout("job 42".to_string()).into();
        assert!(matches!(err, ProviderError::DeadlineExceeded(_)));

        let err: ProviderError = ApiError::Api {
            code: 530,
            text: "Internal error".to_string(),
        }
        .into();
        assert!(matches!(err, ProviderError::RemoteFailure(_)));
        assert!(err.message().contains("Internal error"));
    }

    #[test]
    fn test_context_keeps_variant() {
        let err = ProviderError::NotFound("gone".to_string()).context("reading template");
        assert!(err.is_not_found());
        assert_eq!(err.message(), "reading template: gone");
    }
}
