//! Error types for the local static provisioner
//!
//! Provides structured error types for all provisioner components including
//! configuration loading, cluster API access, volume probing, and cleanup.

use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors (fatal at startup)
    // =========================================================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage class {class} is misconfigured: {reason}")]
    StorageClassConfig { class: String, reason: String },

    #[error("Cannot resolve node {node}: {reason}")]
    NodeResolve { node: String, reason: String },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("API request timed out after {0:?}")]
    ApiTimeout(std::time::Duration),

    // =========================================================================
    // Volume Probe Errors
    // =========================================================================
    #[error("Probe of {path} failed: {reason}")]
    Probe { path: String, reason: String },

    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),

    // =========================================================================
    // Cleanup Errors
    // =========================================================================
    #[error("Cleanup of volume {pv} failed: {reason}")]
    CleanupFailed { pv: String, reason: String },

    #[error("Cleanup already in flight for volume {pv}")]
    CleanupInProgress { pv: String },

    #[error("No storage class {class} configured for volume {pv}")]
    ClassNotConfigured { class: String, pv: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for optimistic-concurrency conflicts: someone else wrote first.
    /// Idempotent callers treat this as success.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409)
    }

    /// True when the target object is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// True when the object being created already exists (409 with
    /// AlreadyExists reason, or any conflict on create).
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => {
                ae.code == 409 || ae.reason == "AlreadyExists"
            }
            _ => false,
        }
    }

    /// Transient API failures are retried with backoff; everything else in
    /// the Kube family (4xx validation) is treated as fatal for the item.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => ae.code >= 500 || ae.code == 429,
            Error::Kube(_) | Error::ApiTimeout(_) => true,
            _ => false,
        }
    }

    /// Errors that must abort startup rather than be retried per-item.
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::StorageClassConfig { .. }
        )
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: String::new(),
            reason: reason.into(),
            code,
        }))
    }

    #[test]
    fn test_conflict_classification() {
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        assert!(!api_error(404, "NotFound").is_conflict());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(!api_error(409, "Conflict").is_not_found());
    }

    #[test]
    fn test_transient_classification() {
        assert!(api_error(500, "InternalError").is_transient());
        assert!(api_error(429, "TooManyRequests").is_transient());
        assert!(!api_error(422, "Invalid").is_transient());
        assert!(!Error::Configuration("bad".into()).is_transient());
    }

    #[test]
    fn test_fatal_config() {
        assert!(Error::Configuration("bad".into()).is_fatal_config());
        assert!(Error::StorageClassConfig {
            class: "fast".into(),
            reason: "missing hostDir".into(),
        }
        .is_fatal_config());
        assert!(!api_error(500, "InternalError").is_fatal_config());
    }
}
