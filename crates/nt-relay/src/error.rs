//! Relay Error Types

use nt_common::{AuditTransitionError, NO_RESPONSE_MARKER};
use thiserror::Error;

/// Identity token could not be issued
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No credentials available: {0}")]
    MissingCredentials(String),

    #[error("Invalid credentials file {path}: {message}")]
    Credentials { path: String, message: String },

    #[error("Failed to sign token assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("Identity provider unreachable: {0}")]
    Transport(String),

    #[error("Identity provider returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Identity provider response did not contain a token")]
    EmptyToken,
}

/// The NLP call failed at the HTTP or network level
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("NLP API returned HTTP {status} for url {url}")]
    Status { url: String, status: u16, body: String },

    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String, timed_out: bool },

    #[error("NLP API returned HTTP {status} with a non-JSON body for url {url}: {message}")]
    InvalidBody { url: String, status: u16, body: String, message: String },
}

impl DispatchError {
    /// Response body when one was received, the no-response marker otherwise
    pub fn error_details(&self) -> String {
        match self {
            DispatchError::Status { body, .. } | DispatchError::InvalidBody { body, .. } => body.clone(),
            DispatchError::Transport { .. } => NO_RESPONSE_MARKER.to_string(),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            DispatchError::Status { status, .. } | DispatchError::InvalidBody { status, .. } => Some(*status),
            DispatchError::Transport { .. } => None,
        }
    }
}

/// Audit store read/write failure
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Audit record not found: {run_id}")]
    NotFound { run_id: String },

    #[error(transparent)]
    Transition(#[from] AuditTransitionError),
}

/// Failure of one relay invocation, returned to the hosting wrapper
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Audit store not available: {0}")]
    StoreUnavailable(String),

    #[error("Failed to issue authentication token: {0}")]
    Auth(#[from] AuthError),

    #[error("HTTP/network error invoking NLP API: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Audit store error: {0}")]
    Store(#[from] StoreError),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl RelayError {
    /// Diagnostic payload persisted alongside a failed audit record
    pub fn error_details(&self) -> Option<String> {
        match self {
            RelayError::Dispatch(e) => Some(e.error_details()),
            _ => None,
        }
    }

    /// Short label used for metrics and response bodies
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            RelayError::Auth(_) => "AUTH_ERROR",
            RelayError::Dispatch(_) => "DISPATCH_ERROR",
            RelayError::Store(_) => "STORE_ERROR",
            RelayError::Unexpected(_) => "UNEXPECTED_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
