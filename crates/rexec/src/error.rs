use crate::types::RunId;
use std::fmt;

/// Phase of a run that a deadline applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Admission,
    Survey,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Admission => f.write_str("admission"),
            Phase::Survey => f.write_str("survey"),
        }
    }
}

/// Errors that can occur in the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("illegal parameters for operation {name}")]
    IllegalParams { name: String },

    #[error("port pool {pool} exhausted")]
    ExhaustedPool { pool: &'static str },

    #[error("{phase} deadline elapsed for run {run_id} without quorum")]
    Timeout { run_id: RunId, phase: Phase },

    #[error("run {run_id} was cancelled")]
    Cancelled { run_id: RunId },

    #[error("unknown command {cmd}/{opt}")]
    UnknownCommand { cmd: String, opt: String },

    #[error("operations must be registered under a non-empty name")]
    EmptyName,

    #[error("invalid argument mask {mask:?}")]
    InvalidMask { mask: String },

    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("transport error: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}
