//! Error types for upgrade operations.
//!
//! Defines a single crate-wide error enum with classification helpers that
//! drive retry and not-found-as-success behavior.

use std::time::Duration;

use thiserror::Error;

use crate::cloud::CloudError;

/// Error type for node-rollover operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Cloud resource API error
    #[error(transparent)]
    Cloud(#[from] CloudError),

    /// Cluster inventory is inconsistent with the desired cluster model
    #[error("cluster inventory error: {0}")]
    Inventory(String),

    /// The requested version transition is not a declared upgrade path
    #[error("version {from} cannot be upgraded to {to}")]
    UnsupportedUpgradePath { from: String, to: String },

    /// A malformed or unparsable resource name
    #[error("invalid resource name: {0}")]
    InvalidName(String),

    /// The deployment template is missing an expected variable or parameter
    #[error("template error: {0}")]
    Template(String),

    /// Validation error in the cluster model
    #[error("validation error: {0}")]
    Validation(String),

    /// A bounded wait elapsed before the operation completed
    #[error("{operation} did not complete within {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Construct a timeout error for a named operation.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Check if this error indicates a not-found condition.
    ///
    /// Deleting or deregistering something already gone is treated as success
    /// by callers, since absence is the end state the operation wants.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            Error::Cloud(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Check if this error is an optimistic-concurrency conflict on a
    /// Kubernetes object update (the object changed under us).
    pub fn is_resource_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Check if this error is eviction backpressure from a
    /// PodDisruptionBudget ("too many requests").
    pub fn is_too_many_requests(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 429)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Cloud(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for node-rollover operations
pub type Result<T> = std::result::Result<T, Error>;
