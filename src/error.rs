//! Error types for the storage reconciler
//!
//! The taxonomy mirrors the retry policy: transport errors abort a whole
//! batched call and are retried wholesale; per-element controller errors
//! are isolated to one identifier; backend provisioning errors carry an
//! explicit transient/terminal severity assigned by the adapter.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the reconciler
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Transport Errors (whole-batch, retried wholesale)
    // =========================================================================
    #[error("transport failure during {operation}: {reason}")]
    Transport { operation: String, reason: String },

    #[error("malformed {operation} reply: expected {expected} results, got {got}")]
    BatchShape {
        operation: String,
        expected: usize,
        got: usize,
    },

    #[error("payload codec error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Per-Entity Controller Errors
    // =========================================================================
    #[error("controller error: {0}")]
    Api(#[from] ApiError),

    // =========================================================================
    // Backend Provisioning Errors
    // =========================================================================
    #[error("backend error: {0}")]
    Backend(#[from] ProvisionError),

    #[error("unknown storage provider: {provider}")]
    UnknownProvider { provider: String },

    #[error("storage provider already registered: {provider}")]
    DuplicateProvider { provider: String },

    #[error("invalid parameters for {tag}: {reason}")]
    InvalidParams { tag: String, reason: String },

    // =========================================================================
    // Identifier Errors
    // =========================================================================
    #[error("invalid entity tag: {0:?}")]
    InvalidTag(String),

    // =========================================================================
    // Scope Teardown
    // =========================================================================
    #[error("{kind} watcher closed; scope terminated")]
    WatcherClosed { kind: String },
}

impl Error {
    /// Whether this error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport { .. } | Error::BatchShape { .. } | Error::Json(_) => true,
            Error::Api(err) => err.is_transient(),
            Error::Backend(err) => err.transient,
            Error::UnknownProvider { .. }
            | Error::DuplicateProvider { .. }
            | Error::InvalidParams { .. }
            | Error::InvalidTag(_)
            | Error::WatcherClosed { .. } => false,
        }
    }
}

// =============================================================================
// Controller Error
// =============================================================================

/// Machine-readable error codes carried by per-element controller errors.
pub mod codes {
    /// The entity does not exist (e.g. already removed).
    pub const NOT_FOUND: &str = "not-found";
    /// The entity exists but has no provisioning info yet.
    pub const NOT_PROVISIONED: &str = "not-provisioned";
    /// The controller could not satisfy the call right now.
    pub const TRY_AGAIN: &str = "try-again";
    /// The controller timed out internally.
    pub const TIMEOUT: &str = "timeout";
    /// The operation is not valid for the entity's current lifecycle state.
    pub const STALE_LIFE: &str = "stale-life";
}

/// A structured per-element error returned by the controller.
///
/// Distinct from [`Error::Transport`]: a transport failure means nothing in
/// the batch resolved, while an `ApiError` is isolated to one identifier.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Only codes known to be retryable classify as transient; anything
    /// unrecognised requires external intervention and is left in the
    /// controller-visible error slot.
    pub fn is_transient(&self) -> bool {
        matches!(self.code.as_str(), codes::TRY_AGAIN | codes::TIMEOUT)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == codes::NOT_FOUND
    }

    pub fn is_not_provisioned(&self) -> bool {
        self.code == codes::NOT_PROVISIONED
    }
}

// =============================================================================
// Backend Error
// =============================================================================

/// Failure reported by a storage backend adapter.
///
/// The adapter classifies the failure; the reconciler trusts the
/// classification for its retry decision.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProvisionError {
    pub message: String,
    pub transient: bool,
}

impl ProvisionError {
    /// A failure worth retrying on a later pass (capacity, timeout).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// A failure requiring external intervention (invalid parameters,
    /// unsupported operation).
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// Result type alias for the reconciler
pub type Result<T> = std::result::Result<T, Error>;
