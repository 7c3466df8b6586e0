//! Leader-side replication bookkeeping.

use crate::types::{LogIndex, ServerId};
use std::collections::{BTreeMap, BTreeSet};

/// Per-follower replication state, reinitialized on election.
#[derive(Debug, Clone)]
pub(crate) struct Progress {
    /// Next index to send; optimistic, backed off on conflicts.
    pub next: LogIndex,
    /// Highest index known replicated on the follower. Monotonic within
    /// a leader term.
    pub matched: LogIndex,
    /// Heartbeat round at which a snapshot transfer was started, if one
    /// is in flight. While set, no appends are sent to the peer; the
    /// transfer is retried after an election timeout's worth of rounds.
    pub snapshot_inflight: Option<u64>,
    /// Highest heartbeat round the peer has answered.
    pub acked_round: u64,
}

impl Progress {
    pub fn new(last_log_index: LogIndex) -> Self {
        Self {
            next: last_log_index + 1,
            matched: 0,
            snapshot_inflight: None,
            acked_round: 0,
        }
    }
}

/// A read barrier waiting for quorum confirmation of leadership.
#[derive(Debug, Clone)]
pub(crate) struct PendingRead {
    pub ticket: u64,
    /// Commit index captured when the barrier was requested.
    pub index: LogIndex,
    /// Heartbeat round whose acknowledgement proves leadership at or
    /// after the request.
    pub round: u64,
    /// Follower that forwarded the barrier, or `None` for a local one.
    pub requester: Option<ServerId>,
}

/// Leadership transfer in progress.
#[derive(Debug, Clone)]
pub(crate) struct Transfer {
    /// Ticks left before the transfer fails with a timeout.
    pub ticks_left: u64,
    /// The follower that was sent `TimeoutNow`, once one caught up.
    pub target: Option<ServerId>,
    /// Whether a local `stepdown` promise awaits the outcome.
    pub waiter: bool,
}

/// Everything a leader tracks on top of the shared state.
#[derive(Debug)]
pub(crate) struct LeaderBook {
    pub progress: BTreeMap<ServerId, Progress>,
    /// Heartbeat round counter; bumped on every broadcast.
    pub round: u64,
    pub heartbeat_elapsed: u64,
    pub reads: Vec<PendingRead>,
    pub transfer: Option<Transfer>,
    /// Index of the dummy entry appended after C_new; its commit
    /// resolves the local configuration-change promise.
    pub conf_dummy_index: Option<LogIndex>,
    /// Whether a local `set_configuration` promise is pending.
    pub conf_waiter: bool,
    /// Consecutive ticks without a live quorum, for preemptive stepdown.
    pub no_quorum_ticks: u64,
}

impl LeaderBook {
    pub fn new(voters: &BTreeSet<ServerId>, own_id: ServerId, last_log_index: LogIndex) -> Self {
        let progress = voters
            .iter()
            .filter(|id| **id != own_id)
            .map(|id| (*id, Progress::new(last_log_index)))
            .collect();
        Self {
            progress,
            round: 0,
            heartbeat_elapsed: 0,
            reads: Vec::new(),
            transfer: None,
            conf_dummy_index: None,
            conf_waiter: false,
            no_quorum_ticks: 0,
        }
    }

    /// Make sure every voter has a progress slot (new members after a
    /// configuration append).
    pub fn ensure_members(
        &mut self,
        voters: &BTreeSet<ServerId>,
        own_id: ServerId,
        last_log_index: LogIndex,
    ) {
        for id in voters {
            if *id != own_id {
                self.progress
                    .entry(*id)
                    .or_insert_with(|| Progress::new(last_log_index));
            }
        }
    }

    /// Drop progress slots for servers no longer in the membership and
    /// return their ids.
    pub fn retain_members(&mut self, voters: &BTreeSet<ServerId>) -> Vec<ServerId> {
        let gone: Vec<ServerId> = self
            .progress
            .keys()
            .filter(|id| !voters.contains(id))
            .copied()
            .collect();
        for id in &gone {
            self.progress.remove(id);
        }
        gone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(tag: u8) -> ServerId {
        ServerId::from_bytes([tag; 16])
    }

    #[test]
    fn book_excludes_self() {
        let voters: BTreeSet<ServerId> = [id(1), id(2), id(3)].into_iter().collect();
        let book = LeaderBook::new(&voters, id(1), 7);
        assert_eq!(book.progress.len(), 2);
        assert_eq!(book.progress[&id(2)].next, 8);
        assert_eq!(book.progress[&id(2)].matched, 0);
    }

    #[test]
    fn membership_resync() {
        let voters: BTreeSet<ServerId> = [id(1), id(2)].into_iter().collect();
        let mut book = LeaderBook::new(&voters, id(1), 3);

        let wider: BTreeSet<ServerId> = [id(1), id(2), id(3)].into_iter().collect();
        book.ensure_members(&wider, id(1), 5);
        assert_eq!(book.progress.len(), 2);
        assert_eq!(book.progress[&id(3)].next, 6);

        let narrower: BTreeSet<ServerId> = [id(1), id(3)].into_iter().collect();
        let gone = book.retain_members(&narrower);
        assert_eq!(gone, vec![id(2)]);
        assert!(!book.progress.contains_key(&id(2)));
    }
}
