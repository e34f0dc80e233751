//! Error types for the ShardStor storage engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Storage Semantics
    // =========================================================================
    /// Placement cannot find enough fault-domain-disjoint nodes
    #[error("Insufficient nodes for placement: need {required}, {available} alive")]
    InsufficientNodes { required: usize, available: usize },

    /// A write collides with a different committed value at the same identity
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Checksum mismatch on stored or transferred data
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// Fewer than k valid shards remain for an object
    #[error("Unrecoverable loss for {object}: {available} valid shards, {required} required")]
    UnrecoverableLoss {
        object: String,
        available: usize,
        required: usize,
    },

    /// Object, shard or node does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Node and Quorum Errors
    // =========================================================================
    /// A node RPC did not answer in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A node refused or dropped the connection
    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    /// A node was declared dead and must re-register with a fresh identity
    #[error("Node {0} is dead")]
    NodeDead(String),

    /// A fan-out could not collect enough acknowledgements
    #[error("{operation} quorum not reached: {acks}/{required} acks (dominant failure: {dominant})")]
    QuorumNotReached {
        operation: String,
        acks: usize,
        required: usize,
        dominant: ErrorKind,
    },

    /// A coordinator operation ran past its deadline
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    // =========================================================================
    // Erasure Coding Errors
    // =========================================================================
    /// Invalid EC configuration
    #[error("Invalid EC configuration: {0}")]
    InvalidEcConfig(String),

    /// EC encoding failed
    #[error("EC encoding failed: {0}")]
    EcEncodingFailed(String),

    /// EC reconstruction failed
    #[error("EC reconstruction failed for {object}: {reason}")]
    EcReconstructionFailed { object: String, reason: String },

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Persisted shard bytes could not be parsed
    #[error("Invalid shard format: {0}")]
    InvalidShardFormat(String),

    /// RPC transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of errors, shared across the wire and used to
/// pick the dominant failure of a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Ok,
    NotFound,
    Conflict,
    Corrupt,
    Timeout,
    Unavailable,
    InsufficientNodes,
    UnrecoverableLoss,
    Quorum,
    Invalid,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Ok => "ok",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::InsufficientNodes => "insufficient_nodes",
            ErrorKind::UnrecoverableLoss => "unrecoverable_loss",
            ErrorKind::Quorum => "quorum",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InsufficientNodes { .. } => ErrorKind::InsufficientNodes,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Corrupt(_) => ErrorKind::Corrupt,
            Error::UnrecoverableLoss { .. } => ErrorKind::UnrecoverableLoss,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Timeout(_) | Error::DeadlineExceeded(_) => ErrorKind::Timeout,
            Error::NodeUnavailable(_) | Error::NodeDead(_) | Error::Transport(_) => {
                ErrorKind::Unavailable
            }
            Error::QuorumNotReached { .. } => ErrorKind::Quorum,
            Error::InvalidEcConfig(_)
            | Error::InvalidShardFormat(_)
            | Error::Config(_)
            | Error::DurationParse(_) => ErrorKind::Invalid,
            Error::EcEncodingFailed(_)
            | Error::EcReconstructionFailed { .. }
            | Error::Io(_)
            | Error::Json(_)
            | Error::Yaml(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Node-level failures that coordinators absorb while their threshold holds.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Unavailable | ErrorKind::Corrupt | ErrorKind::NotFound
        )
    }

    /// Rebuild an error from a wire kind and message.
    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::Conflict => Error::Conflict(message),
            ErrorKind::Corrupt => Error::Corrupt(message),
            ErrorKind::Timeout => Error::Timeout(message),
            ErrorKind::Unavailable => Error::NodeUnavailable(message),
            ErrorKind::Invalid => Error::Config(message),
            _ => Error::Internal(message),
        }
    }
}

/// Pick the most frequent failure kind among the errors of a fan-out.
///
/// Ties go to the kind seen first, so the result is stable for a given
/// response order. Returns `ErrorKind::Ok` for an empty slice.
pub fn reduce_errors(errors: &[Error]) -> ErrorKind {
    let mut counts: Vec<(ErrorKind, usize)> = Vec::new();
    for err in errors {
        let kind = err.kind();
        match counts.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, n)) => *n += 1,
            None => counts.push((kind, 1)),
        }
    }

    let mut best = (ErrorKind::Ok, 0usize);
    for (kind, n) in counts {
        if n > best.1 {
            best = (kind, n);
        }
    }
    best.0
}
