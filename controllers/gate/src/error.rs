//! Controller-specific error types.

use kube::Error as KubeError;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that can occur in the gate controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error other than not-found or conflict
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Object is gone (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write lost an optimistic concurrency race or the object exists (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Pod violates a marooned pod invariant
    #[error("Invalid pod {key}: {reason}")]
    InvalidPod { key: String, reason: String },

    /// VMI object lacks identifying metadata
    #[error("Invalid VMI: {0}")]
    InvalidVmi(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Patch or manifest serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics registry or endpoint failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Socket or server failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    /// Split 404 and 409 API responses out of the generic kube error.
    #[must_use]
    pub fn classify(err: KubeError) -> Self {
        match &err {
            KubeError::Api(status) if status.code == 404 => Self::NotFound(err.to_string()),
            KubeError::Api(status) if status.code == 409 => Self::Conflict(err.to_string()),
            _ => Self::Kube(err),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub(crate) fn invalid_pod(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPod {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// Log at a severity matching the error class.
    pub fn log(&self, context: &str) {
        match self {
            Self::NotFound(_) => debug!("{}: {}", context, self),
            Self::Conflict(_) => info!("{}: {}", context, self),
            Self::Watch(_) | Self::InvalidConfig(_) => warn!("{}: {}", context, self),
            Self::Kube(_)
            | Self::InvalidPod { .. }
            | Self::InvalidVmi(_)
            | Self::Serialization(_)
            | Self::Metrics(_)
            | Self::Io(_) => {
                error!("{}: {}", context, self);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> KubeError {
        KubeError::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} for test"),
            reason: reason.to_string(),
            code,
        }
        .into())
    }

    #[test]
    fn classify_maps_not_found_and_conflict() {
        assert!(ControllerError::classify(api_error(404, "NotFound")).is_not_found());
        assert!(ControllerError::classify(api_error(409, "Conflict")).is_conflict());
        assert!(matches!(
            ControllerError::classify(api_error(500, "InternalError")),
            ControllerError::Kube(_)
        ));
    }
}
