//! Error taxonomy shared by every Keel crate.
//!
//! Variants carry enough context to be surfaced verbatim in a status
//! condition: `reason()` gives the machine-readable code and `Display`
//! the human-readable message.

use thiserror::Error;

/// Main error type for Keel operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Network, timeout or server-busy failure talking to the resource store
    #[error("transient cluster error: {message}")]
    TransientCluster {
        /// Description of what failed
        message: String,
    },

    /// Version mismatch on write; the caller must re-read and retry
    #[error("conflict writing {object}: {message}")]
    Conflict {
        /// Object that could not be written
        object: String,
        /// Store-provided detail
        message: String,
    },

    /// The store refused the request (malformed payload, forbidden, invalid)
    #[error("request for {object} rejected: {message}")]
    Rejected {
        /// Object the request targeted
        object: String,
        /// Store-provided detail
        message: String,
    },

    /// Object does not exist
    #[error("{object} not found")]
    NotFound {
        /// Object that was looked up
        object: String,
    },

    /// Component spec failed validation; terminal until the spec changes
    #[error("validation error for {component}: {message}")]
    Validation {
        /// Component whose spec is invalid
        component: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g. "spec.targetNamespace")
        field: Option<String>,
    },

    /// A transform stage could not resolve a required substitution
    #[error("manifest transform error [{stage}]: {message}")]
    ManifestTransform {
        /// Pipeline stage that failed
        stage: String,
        /// Description of what failed
        message: String,
    },

    /// Applying a single manifest failed
    #[error("apply of {item} failed: {message}")]
    ManifestApply {
        /// Manifest identity
        item: String,
        /// Description of what failed
        message: String,
        /// Permanent failures are surfaced and not hot-retried
        permanent: bool,
    },

    /// A prerequisite component is not ready yet. Not a failure.
    #[error("{dependency} not ready")]
    DependencyNotReady {
        /// Blocking prerequisite kind
        dependency: String,
    },

    /// Teardown of owned resources failed; blocks finalizer removal
    #[error("finalization of {object} failed: {message}")]
    Finalization {
        /// Object being finalized
        object: String,
        /// Description of what failed
        message: String,
    },

    /// Fatal configuration error detected at startup (e.g. dependency cycle)
    #[error("configuration error: {message}")]
    Config {
        /// Description of the misconfiguration
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// The operation was abandoned because the process is shutting down
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientCluster { message: msg.into() }
    }

    pub fn conflict(object: impl ToString, msg: impl Into<String>) -> Self {
        Self::Conflict {
            object: object.to_string(),
            message: msg.into(),
        }
    }

    pub fn rejected(object: impl ToString, msg: impl Into<String>) -> Self {
        Self::Rejected {
            object: object.to_string(),
            message: msg.into(),
        }
    }

    pub fn not_found(object: impl ToString) -> Self {
        Self::NotFound {
            object: object.to_string(),
        }
    }

    /// Create a validation error with component context
    pub fn validation_for(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            component: component.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with component context and field path
    pub fn validation_for_field(
        component: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            component: component.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    pub fn transform(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ManifestTransform {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config { message: msg.into() }
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization { message: msg.into() }
    }

    pub fn finalization(object: impl ToString, msg: impl Into<String>) -> Self {
        Self::Finalization {
            object: object.to_string(),
            message: msg.into(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientCluster { .. } | Self::Conflict { .. } | Self::Finalization { .. } => true,
            Self::ManifestApply { permanent, .. } => !permanent,
            Self::DependencyNotReady { .. } => true,
            Self::Rejected { .. }
            | Self::NotFound { .. }
            | Self::Validation { .. }
            | Self::ManifestTransform { .. }
            | Self::Config { .. }
            | Self::Serialization { .. }
            | Self::Cancelled => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Machine-readable reason code used in status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TransientCluster { .. } => "TransientClusterError",
            Self::Conflict { .. } => "Conflict",
            Self::Rejected { .. } => "Rejected",
            Self::NotFound { .. } => "NotFound",
            Self::Validation { .. } => "ValidationError",
            Self::ManifestTransform { .. } => "ManifestTransformError",
            Self::ManifestApply { .. } => "ManifestApplyError",
            Self::DependencyNotReady { .. } => "DependencyNotReady",
            Self::Finalization { .. } => "FinalizationError",
            Self::Config { .. } => "ConfigurationError",
            Self::Serialization { .. } => "SerializationError",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
