//! Controller-specific error types.
//!
//! This module defines error types specific to the OPNsense controller
//! that are not covered by upstream library errors.

use kube::Error as KubeError;
use opnsense_client::OpnSenseError;
use thiserror::Error;

/// Errors that can occur in the OPNsense controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// OPNsense API error
    #[error("OPNsense error: {0}")]
    OpnSense(#[from] OpnSenseError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Ownership store could not be read or written
    #[error("Ownership store error: {0}")]
    Store(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Plugin configuration could not be parsed
    #[error("Configuration parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A desired record references a record that does not exist on the appliance
    #[error("Unresolved link: {collection} record {record} references missing {target} record {name}")]
    UnresolvedLink {
        /// Collection of the referencing record
        collection: String,
        /// Name of the referencing record
        record: String,
        /// Collection the link points into
        target: String,
        /// Name that could not be resolved
        name: String,
    },

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metric registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Probe server I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    /// HTTP status code of the underlying appliance error, when there is one.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::OpnSense(e) => e.status_code(),
            _ => None,
        }
    }
}
