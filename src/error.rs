//! Unified error types for the cache.
//!
//! This module provides a structured error type for cache operations,
//! covering registration-phase argument problems, lifecycle violations,
//! reader lookups of unregistered paths, and internal invariant failures.

use std::time::Duration;
use thiserror::Error;

use crate::client::ClientError;

/// Unified error type for cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Invalid registration-phase parameter (bad path, empty host list)
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Lifecycle violation (register after start, duplicate path, start twice,
    /// start against an already-connected client)
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Reader looked up a path that was never registered
    #[error("path not registered: {0}")]
    UnknownPath(String),

    /// Internal invariant violated
    #[error("state error: {0}")]
    State(String),

    /// Error surfaced by the coordination client
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// The cache did not warm up within the configured timeout
    #[error("cache did not warm up within {0:?}")]
    WarmTimeout(Duration),
}

impl CacheError {
    /// Create an argument error
    pub fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    /// Create a lifecycle error
    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }

    /// Create an unknown-path error
    pub fn unknown_path(path: impl Into<String>) -> Self {
        Self::UnknownPath(path.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
