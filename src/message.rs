//! Wire message definitions.
//!
//! Serialization is the transport's concern; these types only carry the
//! protocol fields and derive `serde` so any transport can encode them.
//! Every message carries the sender's term. Pre-vote traffic carries a
//! *prospective* term (current + 1) and is exempt from the usual
//! higher-term adoption rule.

use crate::log::{LogEntry, SnapshotDescriptor};
use crate::types::{LogIndex, ServerId, Term};
use serde::{Deserialize, Serialize};

/// All messages exchanged between participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    PreVoteRequest(PreVoteRequest),
    PreVoteResponse(PreVoteResponse),
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntriesRequest(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshotRequest(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
    /// Leadership transfer: the recipient should campaign immediately.
    TimeoutNow(TimeoutNow),
    /// A follower forwarding a read barrier to the leader.
    ReadBarrierRequest(ReadBarrierRequest),
    ReadBarrierResponse(ReadBarrierResponse),
}

impl Message {
    /// The term the message was sent at.
    pub fn term(&self) -> Term {
        match self {
            Message::PreVoteRequest(m) => m.term,
            Message::PreVoteResponse(m) => m.term,
            Message::VoteRequest(m) => m.term,
            Message::VoteResponse(m) => m.term,
            Message::AppendEntriesRequest(m) => m.term,
            Message::AppendEntriesResponse(m) => m.term,
            Message::InstallSnapshotRequest(m) => m.term,
            Message::InstallSnapshotResponse(m) => m.term,
            Message::TimeoutNow(m) => m.term,
            Message::ReadBarrierRequest(m) => m.term,
            Message::ReadBarrierResponse(m) => m.term,
        }
    }

    /// Whether this is pre-vote traffic, which advertises a prospective
    /// term without committing to it.
    pub fn is_prevote(&self) -> bool {
        matches!(self, Message::PreVoteRequest(_) | Message::PreVoteResponse(_))
    }

    /// Whether the message can only originate from a current leader.
    pub fn is_from_leader(&self) -> bool {
        matches!(
            self,
            Message::AppendEntriesRequest(_)
                | Message::InstallSnapshotRequest(_)
                | Message::TimeoutNow(_)
        )
    }
}

/// Non-binding straw poll before a real election. `term` is the term the
/// sender *would* campaign at; the sender's own term is not incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreVoteRequest {
    pub term: Term,
    pub candidate: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreVoteResponse {
    /// The prospective term being answered, or the responder's higher
    /// term when rejecting a stale poll.
    pub term: Term,
    pub granted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: ServerId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader: ServerId,
    /// Index of the entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Entries to store; empty for a heartbeat.
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
    /// Heartbeat round counter, echoed in the response. Read barriers
    /// use it as evidence that a quorum answered a round issued at or
    /// after the barrier.
    pub round: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// On success: the responder's last matching index.
    pub last_index: LogIndex,
    /// On rejection: where the leader should resume, typically the first
    /// index of the conflicting term so `next_index` jumps back by more
    /// than one.
    pub conflict_index: Option<LogIndex>,
    /// Term of the conflicting entry, if any existed at `prev_log_index`.
    pub conflict_term: Option<Term>,
    /// Echo of the request's heartbeat round.
    pub round: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader: ServerId,
    pub snapshot: SnapshotDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    /// Echo of the installed snapshot's last included index; the leader
    /// resumes replication right after it.
    pub last_included_index: LogIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutNow {
    pub term: Term,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadBarrierRequest {
    pub term: Term,
    /// Correlation id chosen by the requester.
    pub ticket: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadBarrierResponse {
    pub term: Term,
    pub ticket: u64,
    /// The commit index the barrier established, or `None` when the
    /// responder was not a leader able to serve it.
    pub read_index: Option<LogIndex>,
}

/// A message addressed to a peer, produced by the decision core.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub to: ServerId,
    pub message: Message,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogEntry;

    #[test]
    fn vote_request_round_trip() {
        let req = VoteRequest {
            term: 5,
            candidate: ServerId::random(),
            last_log_index: 100,
            last_log_term: 4,
        };
        let bytes = bincode::serialize(&Message::VoteRequest(req)).unwrap();
        let back: Message = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, Message::VoteRequest(req));
        assert_eq!(back.term(), 5);
    }

    #[test]
    fn append_request_round_trip() {
        let leader = ServerId::random();
        let req = AppendEntriesRequest {
            term: 3,
            leader,
            prev_log_index: 7,
            prev_log_term: 2,
            entries: vec![LogEntry::command(3, 8, vec![1, 2, 3]), LogEntry::dummy(3, 9)],
            leader_commit: 6,
            round: 42,
        };
        let bytes = bincode::serialize(&req).unwrap();
        let back: AppendEntriesRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn prevote_classification() {
        let req = Message::PreVoteRequest(PreVoteRequest {
            term: 2,
            candidate: ServerId::random(),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(req.is_prevote());
        assert!(!req.is_from_leader());

        let hb = Message::AppendEntriesRequest(AppendEntriesRequest {
            term: 1,
            leader: ServerId::random(),
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
            round: 0,
        });
        assert!(hb.is_from_leader());
        assert!(!hb.is_prevote());
    }
}
