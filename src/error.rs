//! Error taxonomy (kinds, not types) per the error handling design.
//!
//! Internal functions keep propagating `anyhow::Error` with `.context(..)` the
//! way the rest of this crate does; `ServiceError` exists only at the
//! boundary (JSON-RPC replies, REST responses) where a kind has to become a
//! concrete status code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthenticated: {0}")]
    Auth(String),

    #[error("security: {0}")]
    Security(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("backend unavailable: {0}")]
    Backend(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl ServiceError {
    pub fn http_status(&self) -> u16 {
        match self {
            ServiceError::Validation(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::Auth(_) => 401,
            ServiceError::Security(_) => 400,
            ServiceError::Transient(_) => 503,
            ServiceError::Backend(_) => 503,
            ServiceError::Fatal(_) => 500,
        }
    }

    /// JSON-RPC error code. Standard range for the kinds with a clean analog;
    /// the rest use the implementation-defined server-error range.
    pub fn rpc_code(&self) -> i64 {
        match self {
            ServiceError::Validation(_) => -32602, // invalid params
            ServiceError::NotFound(_) => -32001,
            ServiceError::Auth(_) => -32002,
            ServiceError::Security(_) => -32003,
            ServiceError::Transient(_) => -32004,
            ServiceError::Backend(_) => -32005,
            ServiceError::Fatal(_) => -32000, // generic server error
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Auth(_) => "auth",
            ServiceError::Security(_) => "security",
            ServiceError::Transient(_) => "transient",
            ServiceError::Backend(_) => "backend",
            ServiceError::Fatal(_) => "fatal",
        }
    }

    /// Redacted message, safe to put on an external surface.
    pub fn redacted_message(&self) -> String {
        crate::redact::redact(&self.to_string())
    }
}

/// Best-effort classification for errors that didn't originate as a typed
/// `ServiceError`. Defaults to `Fatal` — callers that know the kind up front
/// should construct `ServiceError` directly instead of routing through this.
impl From<anyhow::Error> for ServiceError {
    fn from(e: anyhow::Error) -> Self {
        let msg = e.to_string();
        let lower = msg.to_ascii_lowercase();
        if lower.contains("not found") || lower.contains("no such") {
            ServiceError::NotFound(msg)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            ServiceError::Transient(msg)
        } else if lower.contains("permission denied") || lower.contains("unauthorized") {
            ServiceError::Auth(msg)
        } else {
            ServiceError::Fatal(msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
