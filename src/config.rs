//! Server tuning options.

use crate::error::{RaftError, Result};
use std::time::Duration;

/// Tunables of a single consensus participant.
///
/// Timing options are expressed in logical clock ticks; the server loop
/// converts ticks to wall time through `tick_interval`.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    /// Automatically snapshot the state machine after applying this many
    /// entries since the last snapshot.
    pub snapshot_threshold: u64,
    /// How many entries to leave in the log after taking a snapshot, so
    /// slightly lagging followers can still catch up without a snapshot
    /// transfer.
    pub snapshot_trailing: u64,
    /// Max size of the entries in a single append request, in bytes.
    pub append_request_threshold: usize,
    /// Max number of in-memory log entries after which new submissions
    /// are refused until a snapshot shrinks the log. Must be greater than
    /// `snapshot_trailing`, otherwise the log could never shrink below
    /// the admission limit.
    pub max_log_size: usize,
    /// Run the pre-vote round before a real election.
    pub enable_prevoting: bool,
    /// Base election timeout in ticks. The effective timeout is
    /// randomized per server over `[timeout, 2 * timeout)`.
    pub election_timeout_ticks: u64,
    /// Leader heartbeat cadence in ticks, conventionally a fifth of the
    /// election timeout.
    pub heartbeat_interval_ticks: u64,
    /// Wall-clock duration of one logical tick.
    pub tick_interval: Duration,
    /// Seed for the election randomizer. Only set by deterministic tests.
    pub election_seed: Option<u64>,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            snapshot_threshold: 1024,
            snapshot_trailing: 200,
            append_request_threshold: 100_000,
            max_log_size: 5000,
            enable_prevoting: true,
            election_timeout_ticks: 10,
            heartbeat_interval_ticks: 2,
            tick_interval: Duration::from_millis(100),
            election_seed: None,
        }
    }
}

impl RaftOptions {
    /// Check option consistency before starting a server.
    pub fn validate(&self) -> Result<()> {
        if self.max_log_size as u64 <= self.snapshot_trailing {
            return Err(RaftError::InvalidConfiguration(format!(
                "max_log_size ({}) must exceed snapshot_trailing ({})",
                self.max_log_size, self.snapshot_trailing
            )));
        }
        if self.election_timeout_ticks == 0 || self.heartbeat_interval_ticks == 0 {
            return Err(RaftError::InvalidConfiguration(
                "election and heartbeat intervals must be non-zero".into(),
            ));
        }
        if self.heartbeat_interval_ticks >= self.election_timeout_ticks {
            return Err(RaftError::InvalidConfiguration(format!(
                "heartbeat interval ({}) must be shorter than the election timeout ({})",
                self.heartbeat_interval_ticks, self.election_timeout_ticks
            )));
        }
        Ok(())
    }
}
