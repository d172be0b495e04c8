//! Crate error type.
//!
//! This module defines [`ClientError`] and the [`ClientResult`] alias used
//! across the crate, plus the mapping from errors to the process exit codes
//! downstream tooling keys on.

use slipstream_abr::ControlError;

use crate::transport::TransportError;

/// Result type used by this crate.
pub type ClientResult<T> = Result<T, ClientError>;

/// Unified error type for the `slipstream-client` crate.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Invalid parameters provided by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested ABR policy does not exist.
    #[error("unknown abr: {0}")]
    UnknownAbr(String),

    /// The server answered 404 for a request that had to succeed.
    #[error("HTTP 404 for {0}")]
    NotFound(String),

    /// A kept response carried no HTTP status at all.
    #[error("response carried no HTTP status")]
    MissingStatus,

    /// Errors related to invalid or unsupported manifest contents.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A kept download produced no frame timings; the transport contract
    /// guarantees at least one record for any received data.
    #[error("no frame timings recorded for a kept download")]
    MissingFrameTimings,

    /// Invariant violation inside the control policies.
    #[error(transparent)]
    Control(#[from] ControlError),

    /// The transport gave up (connection failure, too many rejects).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Session was cancelled by the host.
    #[error("session cancelled")]
    Cancelled,

    /// I/O error on the output sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Convenience helper for invalid manifest errors.
    pub fn invalid_manifest(msg: impl Into<String>) -> Self {
        ClientError::InvalidManifest(msg.into())
    }

    /// The process exit code this error maps to.
    ///
    /// The codes are contractual: `1` for argument, manifest and HTTP
    /// failures, `-1` for an unknown ABR, `-3` for the missing-frame-timings
    /// invariant, `-4` for a rebuffer beyond 100 s.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::UnknownAbr(_) => -1,
            ClientError::MissingFrameTimings => -3,
            ClientError::Control(ControlError::RebufferOverflow(_)) => -4,
            _ => 1,
        }
    }
}
