//! Error types for the consensus server.
//!
//! [`RaftError`] is the single error enum surfaced to callers. The
//! client-visible verdicts (`NotLeader`, `DroppedEntry`,
//! `CommitStatusUnknown`, `ConfChangeInProgress`, ...) describe the fate
//! of an operation; `Io`/`Serialization` wrap collaborator failures,
//! which are fatal for the server loop.

use crate::types::ServerId;
use std::io;
use thiserror::Error;

/// Main error type for consensus operations.
#[derive(Error, Debug)]
pub enum RaftError {
    /// The operation is only valid on a leader. Carries the current
    /// leader if known so callers can redirect.
    #[error("not a leader (known leader: {leader:?})")]
    NotLeader { leader: Option<ServerId> },

    /// The submitted entry was overwritten by a newer leader.
    #[error("entry dropped by a newer leader")]
    DroppedEntry,

    /// The server lost track of the entry's fate: it stepped down or was
    /// aborted while the entry was in flight. The entry may or may not
    /// have been committed.
    #[error("commit status unknown")]
    CommitStatusUnknown,

    /// An earlier membership change has not finished yet.
    #[error("configuration change already in progress")]
    ConfChangeInProgress,

    /// The in-memory log is over `max_log_size`; submissions are refused
    /// until a snapshot shrinks it. Retryable.
    #[error("log is full ({limit} entries)")]
    LogFull { limit: usize },

    /// A stepdown or read barrier did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// The server has been aborted.
    #[error("server is stopped")]
    Stopped,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("log error: {0}")]
    Log(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RaftError {
    /// Whether retrying the operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. } | RaftError::LogFull { .. } | RaftError::Timeout
        )
    }
}

impl From<bincode::Error> for RaftError {
    fn from(e: bincode::Error) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

/// Result type alias for consensus operations.
pub type Result<T> = std::result::Result<T, RaftError>;
