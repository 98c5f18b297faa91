//! Transaction-level error kinds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::executor::Phase;
use super::types::{NodeRef, StreamId};

/// Serializable discriminant of a `LedgerError`, carried in responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    LockUnavailable,
    VerifyRejected,
    VoteRejected,
    QuorumNotReached,
    CommitFailed,
    PeerUnreachable,
    PostProcessFailed,
    PhaseTimeout,
    ContractNotFound,
    InvalidTransaction,
    Storage,
}

/// Errors that can end a transaction.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("stream(s) unavailable: {}", .0.join(", "))]
    LockUnavailable(Vec<StreamId>),

    #[error("{0}")]
    VerifyRejected(String),

    #[error("{0}")]
    VoteRejected(String),

    #[error("quorum not reached (votes={votes}, required={required})")]
    QuorumNotReached { votes: usize, required: usize },

    #[error("{0}")]
    CommitFailed(String),

    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: NodeRef, reason: String },

    #[error("post-process failed: {0}")]
    PostProcessFailed(String),

    #[error("{phase} timed out after {timeout:?}")]
    PhaseTimeout { phase: Phase, timeout: Duration },

    #[error("contract {0} not found")]
    ContractNotFound(String),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::LockUnavailable(_) => ErrorKind::LockUnavailable,
            LedgerError::VerifyRejected(_) => ErrorKind::VerifyRejected,
            LedgerError::VoteRejected(_) => ErrorKind::VoteRejected,
            LedgerError::QuorumNotReached { .. } => ErrorKind::QuorumNotReached,
            LedgerError::CommitFailed(_) => ErrorKind::CommitFailed,
            LedgerError::PeerUnreachable { .. } => ErrorKind::PeerUnreachable,
            LedgerError::PostProcessFailed(_) => ErrorKind::PostProcessFailed,
            LedgerError::PhaseTimeout { .. } => ErrorKind::PhaseTimeout,
            LedgerError::ContractNotFound(_) => ErrorKind::ContractNotFound,
            LedgerError::InvalidTransaction(_) => ErrorKind::InvalidTransaction,
            LedgerError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Only these are reported to the client as hard failures; everything
    /// else surfaces through the summary's error list.
    pub fn is_hard_failure(&self) -> bool {
        matches!(
            self,
            LedgerError::LockUnavailable(_) | LedgerError::QuorumNotReached { .. }
        )
    }
}
