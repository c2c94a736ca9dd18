//! Defines the custom error types for the lead-attribution application.

use thiserror::Error;
use url::ParseError as UrlParseError;

/// The primary error type for capturing, resolving and pushing attribution.
#[derive(Error, Debug)]
pub(crate) enum AttributionError {
    /// The storage backend cannot be read or written (no browser context,
    /// unreadable state file, storage full).
    #[error("Storage Unavailable: {0}")]
    StorageUnavailable(String),

    /// Error making HTTP requests via reqwest (connect, timeout, body decode).
    #[error("Network Error: {0}")]
    Network(#[from] reqwest::Error),

    /// The CRM answered with a non-success status.
    #[error("CRM Error: Status={status}, Message='{message}'")]
    Crm {
        /// The HTTP status code returned by the CRM.
        status: u16,
        /// The message extracted from the CRM response body.
        message: String,
    },

    /// The remote endpoint answered but reported `success: false`.
    #[error("Request Rejected: {0}")]
    Rejected(String),

    /// A contact or value that was looked up does not exist.
    #[error("Not Found: {0}")]
    NotFound(String),

    /// Input data could not be parsed into the expected shape.
    #[error("Malformed Data: {0}")]
    Malformed(String),

    /// No email, phone or contact id was supplied for a contact operation.
    #[error("No contact identifier provided")]
    MissingIdentifier,

    /// Error occurring during configuration loading or validation.
    #[error("Configuration Error: {0}")]
    Config(String),

    /// Error during JSON serialization or deserialization.
    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error parsing a URL.
    #[error("URL Parsing Error: {0}")]
    UrlParse(#[from] UrlParseError),

    /// An underlying error that doesn't fit other categories, using anyhow.
    #[error("Generic Error: {0}")]
    Generic(#[from] anyhow::Error),
}

pub(crate) type Result<T> = std::result::Result<T, AttributionError>;
