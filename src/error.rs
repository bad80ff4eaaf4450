//! Error types for edgemux.
//!
//! This module provides a unified error type [`EdgemuxError`] for all edgemux
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! Errors are organized into the following categories:
//!
//! - **Client construction**: the resolver could not build a transport client
//! - **Upstream**: connection failures, HTTP error statuses, timeouts
//! - **Watch contract**: `Expired` (upstream invalidated our version) and
//!   `Gone` (a requested starting version is below the retained window)
//! - **Subscriber**: a slow consumer overflowed its delivery sink
//! - **Configuration**: invalid settings or missing configuration
//!
//! # Example
//!
//! ```rust
//! use edgemux::error::{EdgemuxError, Result};
//!
//! fn check_version(requested: u64, floor: u64) -> Result<()> {
//!     if requested < floor {
//!         return Err(EdgemuxError::Gone { requested, floor });
//!     }
//!     Ok(())
//! }
//!
//! fn handle_error(err: &EdgemuxError) {
//!     if err.is_retryable() {
//!         println!("Retrying operation...");
//!     } else {
//!         println!("Fatal error: {}", err);
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

/// Main error type for edgemux operations.
#[derive(Error, Debug)]
pub enum EdgemuxError {
    // Client construction errors
    #[error("failed to construct upstream client: {0}")]
    ClientConstruction(String),

    // Upstream errors
    #[error("upstream connection error: {0}")]
    UpstreamConnection(String),

    #[error("upstream request failed with status {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    // Watch contract signals
    #[error("watch expired at resource version {resource_version}")]
    Expired { resource_version: u64 },

    #[error("resource version {requested} is below the log floor {floor}")]
    Gone { requested: u64, floor: u64 },

    #[error("subscriber {session} overflowed its delivery sink")]
    SubscriberOverflow { session: String },

    // Lookup errors
    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    // Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Misc
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EdgemuxError {
    /// Check if the error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            EdgemuxError::UpstreamConnection(_)
            | EdgemuxError::Network(_)
            | EdgemuxError::Timeout(_)
            | EdgemuxError::Unavailable(_) => true,
            EdgemuxError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Check if the error is the watch-contract signal requiring the caller
    /// to re-List for a fresh anchor.
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            EdgemuxError::Gone { .. } | EdgemuxError::Expired { .. }
        )
    }
}

impl From<serde_json::Error> for EdgemuxError {
    fn from(e: serde_json::Error) -> Self {
        EdgemuxError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for EdgemuxError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EdgemuxError::Timeout(0)
        } else if e.is_connect() {
            EdgemuxError::UpstreamConnection(e.to_string())
        } else {
            EdgemuxError::Network(e.to_string())
        }
    }
}

/// Result type alias for edgemux operations.
pub type Result<T> = std::result::Result<T, EdgemuxError>;
