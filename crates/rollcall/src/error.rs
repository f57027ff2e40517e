//! Error types for rollcall.
//!
//! This module defines all error types used throughout the rollcall crate.
//! Write-path errors surface to the caller as typed results; side-effect
//! errors (notification delivery, deferred sync) are absorbed and logged.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for rollcall operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Lookup Errors ===
    /// A referenced document is missing from the store.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up (e.g. "subject", "invitation code").
        entity: &'static str,
        /// The identifier that failed to resolve.
        id: String,
    },

    // === Invitation Code Errors ===
    /// The invitation code was already redeemed.
    #[error("invitation code already used")]
    CodeAlreadyUsed,

    /// The invitation code expired before redemption.
    #[error("invitation code expired")]
    CodeExpired,

    /// Could not draw a unique code within the collision budget.
    #[error("failed to generate a unique code after {attempts} attempts")]
    ExhaustedRetries {
        /// How many draws were attempted.
        attempts: u32,
    },

    // === Store Errors ===
    /// A transaction write-conflict; retryable for transient races.
    #[error("store write conflict: {0}")]
    WriteConflict(String),

    /// A document store operation failed.
    #[error("store error: {0}")]
    Store(String),

    // === Notification Errors ===
    /// The subject has no linked guardian to notify.
    #[error("no guardian linked to subject {subject_id}")]
    NoLinkedRecipient {
        /// Subject whose guardian link is missing.
        subject_id: String,
    },

    /// The recipient has no registered device token.
    #[error("recipient {recipient_id} has no device token")]
    NoDeliveryTarget {
        /// Recipient without a registered device.
        recipient_id: String,
    },

    /// The token endpoint rejected the credential exchange.
    #[error("token exchange failed ({status}): {body}")]
    TokenExchangeFailed {
        /// HTTP status returned by the token endpoint.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The push gateway rejected the notification request.
    #[error("push gateway rejected request ({status}): {body}")]
    NotificationFailed {
        /// HTTP status returned by the gateway.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    // === Credential Errors ===
    /// The service credential file could not be read or parsed.
    #[error("failed to load credential from {}: {message}", path.display())]
    CredentialLoad {
        /// Path to the credential file.
        path: PathBuf,
        /// Description of what went wrong.
        message: String,
    },

    /// The credential's private key could not be parsed or used for signing.
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O and Serialization Errors ===
    /// An HTTP request could not be completed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for rollcall operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a not-found error for the given entity kind and id.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Create a store error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create a write-conflict error.
    #[must_use]
    pub fn write_conflict(message: impl Into<String>) -> Self {
        Self::WriteConflict(message.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error is a transaction write-conflict.
    ///
    /// Redemption retries once on conflicts; everything else surfaces as-is.
    #[must_use]
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, Self::WriteConflict(_))
    }

    /// Check if this error means an invitation code cannot be redeemed
    /// (already used or expired), as opposed to a transient failure.
    #[must_use]
    pub fn is_code_consumed(&self) -> bool {
        matches!(self, Self::CodeAlreadyUsed | Self::CodeExpired)
    }
}
