//! OPNsense client errors

use thiserror::Error;

/// Errors that can occur when interacting with the OPNsense API
#[derive(Debug, Error)]
pub enum OpnSenseError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// OPNsense answered with a non-success status code
    #[error("OPNsense API error ({status}): {message}")]
    Api {
        /// HTTP status code returned by the appliance
        status: u16,
        /// Response body or summary
        message: String,
    },

    /// OPNsense accepted the request but rejected the record
    /// (`{"result": "failed", "validations": {...}}`)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authentication failed (invalid key/secret or missing privileges)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid request (e.g., missing required fields)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl OpnSenseError {
    /// HTTP status code associated with the error, when there is one.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Api { status, .. } => Some(*status),
            Self::NotFound(_) => Some(404),
            Self::Authentication(_) => Some(401),
            Self::Validation(_) | Self::Serialization(_) | Self::InvalidRequest(_) => None,
        }
    }
}
