//! CSI error types.
//!
//! All request-level failures are represented by the [`CsiError`] enum, which
//! derives [`thiserror::Error`] for ergonomic handling and implements
//! [`Serialize`]/[`Deserialize`] so errors can travel across the transport
//! layer. Every variant maps to a gRPC-style status code via
//! [`CsiError::code`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status codes reported at the RPC edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    OutOfRange,
    ResourceExhausted,
    Internal,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested volume (or volume path) was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A volume with the same name but a different size already exists.
    #[error("volume with name {name} but a different size already exists")]
    AlreadyExists {
        /// The conflicting volume name.
        name: String,
    },

    /// The requested capacity exceeds what the node can allocate.
    #[error("requested capacity is bigger than available: {available}")]
    OutOfRange {
        /// Free capacity in bytes at the time of the request.
        available: i64,
    },

    /// The node cannot satisfy the request with its current resources.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// The status code this error maps to at the RPC edge.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::OutOfRange { .. } => ErrorCode::OutOfRange,
            Self::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Self::Transport(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Create a [`CsiError::InvalidArgument`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn invalid_argument<E: std::fmt::Display>(e: E) -> Self {
        Self::InvalidArgument(e.to_string())
    }

    /// Create a [`CsiError::Transport`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::Transport(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}
