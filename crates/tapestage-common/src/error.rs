//! Error types for tapestage
//!
//! This module defines the common error type used throughout the stager,
//! grouped into the classes the coordinator reacts to differently.

use crate::status::StatusCode;
use crate::types::{BoundedStringError, ReqId, RequestKind};
use thiserror::Error;

/// Common result type for tapestage operations
pub type Result<T> = std::result::Result<T, Error>;

/// How the coordinator treats an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Reported synchronously to the client, nothing was mutated
    User,
    /// Recoverable through garbage collection and bounded retry
    ResourceExhausted,
    /// Worker failure worth another dispatch
    TransientWorker,
    /// Spawn, IPC or persistence failure; the operation is rolled back
    FatalSystem,
    /// Kill or shutdown
    Cancelled,
    /// Namespace or other collaborator failure, fatal to one sub-request
    ExternalService,
    /// Broken internal invariant
    Logic,
}

/// Common error type for tapestage
#[derive(Debug, Error)]
pub enum Error {
    // User errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown pool: {0}")]
    UnknownPool(String),

    #[error("invalid name: {0}")]
    InvalidName(#[from] BoundedStringError),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request type {request_type} not accepted with magic {magic:#x}")]
    ProtocolMismatch { request_type: u32, magic: u32 },

    // Resource errors
    #[error("insufficient space in pool {pool}: required {required} bytes, available {available} bytes")]
    InsufficientSpace {
        pool: String,
        required: u64,
        available: u64,
    },

    #[error("stage catalog is full")]
    CatalogFull,

    #[error("temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    #[error("stager is not active: {0}")]
    NotActive(String),

    // Worker errors
    #[error("worker failed with exit code {code}")]
    WorkerFailed { code: i32 },

    #[error("failed to start worker: {0}")]
    Spawn(String),

    // System errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // Cancellation
    #[error("cancelled: {0}")]
    Cancelled(String),

    // External collaborators
    #[error("external service failure: {0}")]
    ExternalService(String),

    // Logic errors
    #[error("unknown request id {0}")]
    UnknownRequest(ReqId),

    #[error("illegal state {kind} with modifiers [{modifiers}]")]
    IllegalTransition { kind: RequestKind, modifiers: String },
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a persistence error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Classify the error for the coordinator
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidArgument(_)
            | Self::UnknownPool(_)
            | Self::InvalidName(_)
            | Self::PermissionDenied(_)
            | Self::NotFound(_)
            | Self::ProtocolMismatch { .. } => ErrorClass::User,

            Self::InsufficientSpace { .. }
            | Self::CatalogFull
            | Self::TemporarilyUnavailable(_)
            | Self::NotActive(_) => ErrorClass::ResourceExhausted,

            Self::WorkerFailed { .. } => ErrorClass::TransientWorker,

            Self::Spawn(_)
            | Self::Io(_)
            | Self::Store(_)
            | Self::Internal(_)
            | Self::Configuration(_)
            | Self::Serialization(_) => ErrorClass::FatalSystem,

            Self::Cancelled(_) => ErrorClass::Cancelled,

            Self::ExternalService(_) => ErrorClass::ExternalService,

            Self::UnknownRequest(_) | Self::IllegalTransition { .. } => ErrorClass::Logic,
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkerFailed { .. } | Self::TemporarilyUnavailable(_) | Self::Spawn(_)
        )
    }

    /// Check if this is a user error
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(self.class(), ErrorClass::User)
    }

    /// Get the status code reported to the client
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_)
            | Self::UnknownPool(_)
            | Self::InvalidName(_)
            | Self::PermissionDenied(_)
            | Self::NotFound(_)
            | Self::ProtocolMismatch { .. } => StatusCode::UserError,

            Self::InsufficientSpace { .. } | Self::CatalogFull => StatusCode::NoSpace,

            Self::TemporarilyUnavailable(_) => StatusCode::TemporarilyUnavailable,

            Self::NotActive(_) => StatusCode::NotActive,

            Self::WorkerFailed { code } => StatusCode::from_exit_code(*code),

            Self::Configuration(_) => StatusCode::ConfigError,

            Self::Cancelled(_) => StatusCode::Killed,

            Self::Spawn(_)
            | Self::Io(_)
            | Self::Store(_)
            | Self::Internal(_)
            | Self::Serialization(_)
            | Self::ExternalService(_)
            | Self::UnknownRequest(_)
            | Self::IllegalTransition { .. } => StatusCode::SystemError,
        }
    }
}
