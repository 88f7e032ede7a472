// =============================================================================
// Trellis Matrix NextServer - Error Types
// =============================================================================
//
// Project: Trellis - Matrix NextServer Federation Ingest Engine
// Contributors: Trellis Development Team
// Date: 2025-06-14
// Version: 0.4.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Global error taxonomy for the federation ingest core. Fetch, eval and
//   key-cache code propagate these; the last underlying error of a request
//   is what its promise resolves with.
//
// =============================================================================

use std::io;

use thiserror::Error;

/// Trellis global error type
#[derive(Debug, Error)]
pub enum Error {
    /// Operation refused because the runlevel is not RUN.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// No viable origin remained for a fetch after exhausting `attempted`.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Event id mismatch, conformance failure or signature verification
    /// failure.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Per-attempt wall clock exceeded. Promoted to a retry; only surfaced
    /// once all origins are exhausted.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Wrapped HTTP/network error from the transport collaborator.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Bad server response: {0}")]
    BadServerResponse(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    BadConfig(String),

    #[error("Database error: {0}")]
    BadDatabase(String),

    #[error("Signature error: {0}")]
    Signatures(#[from] ruma::signatures::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn bad_database(message: impl Into<String>) -> Self {
        Self::BadDatabase(message.into())
    }

    pub fn bad_config(message: impl Into<String>) -> Self {
        Self::BadConfig(message.into())
    }
}

/// Trellis global result type
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let error = Error::NotFound("no origin for $x:remote".to_owned());
        assert!(error.to_string().contains("Not found"));
        assert!(error.to_string().contains("$x:remote"));
    }
}
