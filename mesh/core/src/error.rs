// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the mesh control plane.
///
/// The variants form a small taxonomy rather than one type per call site:
/// validation and conflict errors are terminal for the operation that raised
/// them, network errors are retried inside the store client and only surface
/// after exhaustion, and cancellation is propagated verbatim.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Optimistic-concurrency miss on a registry write. Callers retry with a
    /// fresh version or abandon the write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store request failed: {0}")]
    Network(String),

    /// The store rejected a statement or reported an error frame.
    #[error("store error: {0}")]
    Store(String),

    #[error("failed to decode registry row: {0}")]
    Decode(String),

    /// The change stream could not be re-established within the retry budget.
    #[error("subscription closed: {0}")]
    SubscriptionClosed(String),

    #[error("tunnel operation failed: {0}")]
    Tunnel(String),

    #[error("store runtime failed: {0}")]
    StoreRuntime(String),

    #[error("bootstrap did not complete within {0:?}")]
    BootstrapTimeout(Duration),

    #[error("operation cancelled")]
    Cancelled,
}

impl MeshError {
    /// True for failures that a caller may reasonably retry as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, MeshError::Network(_) | MeshError::Conflict(_))
    }
}

impl From<reqwest::Error> for MeshError {
    fn from(err: reqwest::Error) -> Self {
        // Status errors are the server speaking; everything else is the
        // network in the way.
        if err.is_status() {
            MeshError::Store(err.to_string())
        } else {
            MeshError::Network(err.to_string())
        }
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
