//! The pure decision core of a consensus participant.
//!
//! [`Fsm`] never blocks and never performs I/O. Every input — a wire
//! message, a clock tick, a client proposal, an I/O completion — mutates
//! the in-memory state and accumulates effects in an [`Output`] batch
//! that the server loop drains with [`Fsm::get_output`] and dispatches to
//! the collaborators. This split keeps every protocol rule testable with
//! a deterministic simulated clock and network.
//!
//! The ordering contract for one batch: persist `term_vote`, the suffix
//! truncation and `entries` durably *before* sending `messages`; a vote
//! or an append acknowledgement must never leave the server before the
//! state backing it is on stable storage.

use crate::config::RaftOptions;
use crate::error::{RaftError, Result};
use crate::log::{EntryPayload, LogEntry, RaftLog, SnapshotDescriptor};
use crate::membership::Configuration;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, InstallSnapshotRequest,
    InstallSnapshotResponse, Message, PreVoteRequest, PreVoteResponse, ReadBarrierRequest,
    ReadBarrierResponse, TimeoutNow, VoteRequest, VoteResponse,
};
use crate::progress::{LeaderBook, PendingRead, Transfer};
use crate::types::{LogIndex, ServerAddress, ServerId, Term};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// The role a participant currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive: answers RPCs, waits for heartbeats.
    Follower,
    /// Running the non-binding pre-vote poll.
    PreCandidate,
    /// Actively seeking election.
    Candidate,
    /// Handling client requests and replication.
    Leader,
}

impl Role {
    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leader)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::PreCandidate => write!(f, "pre-candidate"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// The effect batch produced by the decision core.
///
/// Field order mirrors dispatch order: persistence first, then outbound
/// messages, then state-machine work, then promise resolutions.
#[derive(Debug, Default)]
pub struct Output {
    /// Term and vote to fsync before anything is sent.
    pub term_vote: Option<(Term, Option<ServerId>)>,
    /// Truncate the persisted log suffix from this index (inclusive).
    pub truncate_log_from: Option<LogIndex>,
    /// Entries to persist (already appended to the in-memory log).
    pub entries: Vec<LogEntry>,
    /// A locally taken snapshot descriptor to persist.
    pub persist_snapshot: Option<SnapshotDescriptor>,
    /// A leader-sent snapshot: persist it and load it into the state
    /// machine.
    pub install_snapshot: Option<SnapshotDescriptor>,
    /// Truncate the persisted log prefix up to this index (inclusive).
    pub compact_log_to: Option<LogIndex>,
    /// Messages to send once the persistence above is durable.
    pub messages: Vec<Envelope>,
    /// Newly committed entries, to apply strictly in order.
    pub apply: Vec<LogEntry>,
    /// Ask the state machine for a snapshot of everything applied.
    pub snapshot_needed: bool,
    /// Members added by an appended configuration; hand to
    /// `Rpc::add_server`.
    pub peers_joined: Vec<ServerAddress>,
    /// Members gone after a committed configuration; hand to
    /// `Rpc::remove_server`.
    pub peers_left: Vec<ServerId>,
    /// Read barriers that established their index: `(ticket, index)`.
    /// The caller may read once `last_applied` reaches the index.
    pub reads_ready: Vec<(u64, LogIndex)>,
    /// Read barriers that failed, with a leader hint if known.
    pub reads_failed: Vec<(u64, Option<ServerId>)>,
    /// Outcome of the pending `set_configuration`, if it resolved.
    pub conf_change_result: Option<Result<()>>,
    /// Outcome of the pending `stepdown`, if it resolved.
    pub stepdown_result: Option<Result<()>>,
}

impl Output {
    pub fn is_empty(&self) -> bool {
        self.term_vote.is_none()
            && self.truncate_log_from.is_none()
            && self.entries.is_empty()
            && self.persist_snapshot.is_none()
            && self.install_snapshot.is_none()
            && self.compact_log_to.is_none()
            && self.messages.is_empty()
            && self.apply.is_empty()
            && !self.snapshot_needed
            && self.peers_joined.is_empty()
            && self.peers_left.is_empty()
            && self.reads_ready.is_empty()
            && self.reads_failed.is_empty()
            && self.conf_change_result.is_none()
            && self.stepdown_result.is_none()
    }
}

/// The deterministic consensus core.
pub struct Fsm {
    id: ServerId,
    opts: RaftOptions,

    // Persistent image (the server loop makes it durable).
    current_term: Term,
    voted_for: Option<ServerId>,
    log: RaftLog,

    // Volatile state.
    commit_index: LogIndex,
    last_applied: LogIndex,
    /// Highest index already handed out for apply; keeps `apply` batches
    /// disjoint.
    apply_cursor: LogIndex,
    role: Role,
    leader_id: Option<ServerId>,

    // Membership currently in force (the newest appended configuration).
    config: Configuration,
    config_index: LogIndex,

    // Timers, in ticks.
    election_elapsed: u64,
    randomized_election_timeout: u64,
    /// Ticks since a valid leader was last heard; gates pre-vote grants.
    leader_contact_elapsed: u64,

    // Election tallies.
    prevotes: BTreeSet<ServerId>,
    votes: BTreeSet<ServerId>,

    leader: Option<LeaderBook>,

    /// Latest failure-detector sample.
    dead: BTreeSet<ServerId>,

    /// A snapshot request is outstanding with the state machine.
    snapshot_pending: bool,
    next_ticket: u64,

    rng: StdRng,
    output: Output,
}

impl Fsm {
    /// Reconstruct the core from the persisted image.
    pub fn new(
        id: ServerId,
        opts: RaftOptions,
        current_term: Term,
        voted_for: Option<ServerId>,
        log: RaftLog,
    ) -> Result<Self> {
        opts.validate()?;
        let (config, config_index) = log.latest_configuration();
        if config.is_empty() {
            return Err(RaftError::InvalidConfiguration(
                "no seed configuration in snapshot or log".into(),
            ));
        }
        let commit_index = log.snapshot().last_included_index;
        let rng = match opts.election_seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ u64::from_le_bytes(id.as_bytes()[..8].try_into().unwrap_or([0; 8]))),
            None => StdRng::from_entropy(),
        };
        let election_timeout = opts.election_timeout_ticks;
        let mut fsm = Self {
            id,
            opts,
            current_term,
            voted_for,
            log,
            commit_index,
            last_applied: commit_index,
            apply_cursor: commit_index,
            role: Role::Follower,
            leader_id: None,
            config,
            config_index,
            election_elapsed: 0,
            randomized_election_timeout: 0,
            // A fresh server has not heard from anyone; do not let that
            // suppress the first election round.
            leader_contact_elapsed: election_timeout,
            prevotes: BTreeSet::new(),
            votes: BTreeSet::new(),
            leader: None,
            dead: BTreeSet::new(),
            snapshot_pending: false,
            next_ticket: 0,
            rng,
            output: Output::default(),
        };
        fsm.reset_election_timer();
        Ok(fsm)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<ServerId> {
        self.voted_for
    }

    pub fn leader_hint(&self) -> Option<ServerId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    pub fn last_log_idx_term(&self) -> (LogIndex, Term) {
        (self.log.last_index(), self.log.last_term())
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Every other member the failure detector should watch.
    pub fn peer_ids(&self) -> BTreeSet<ServerId> {
        let mut ids = self.config.voter_ids();
        ids.remove(&self.id);
        ids
    }

    /// Drain the accumulated effect batch.
    pub fn get_output(&mut self) -> Output {
        std::mem::take(&mut self.output)
    }

    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    /// One logical clock tick.
    pub fn tick(&mut self) {
        match self.role {
            Role::Leader => self.leader_tick(),
            _ => {
                self.election_elapsed += 1;
                self.leader_contact_elapsed = self.leader_contact_elapsed.saturating_add(1);
                if self.election_elapsed >= self.randomized_election_timeout {
                    self.on_election_timeout();
                }
            }
        }
    }

    /// Feed the latest failure-detector verdicts. Dead peers are skipped
    /// for payload and snapshot sends, and a leader that cannot reach a
    /// live quorum for a full election timeout steps down.
    pub fn update_liveness(&mut self, dead: BTreeSet<ServerId>) {
        self.dead = dead;
    }

    /// Submit a client command. Leader only; returns the slot the entry
    /// was appended at.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(Term, LogIndex)> {
        self.check_can_accept()?;
        if self.log.len() >= self.opts.max_log_size {
            return Err(RaftError::LogFull {
                limit: self.opts.max_log_size,
            });
        }
        let index = self.append_local(EntryPayload::Command(data.into()));
        self.replicate_all();
        self.maybe_commit();
        Ok((self.current_term, index))
    }

    /// Start a joint-consensus transition to `new_members`. The pending
    /// promise resolves through [`Output::conf_change_result`] once the
    /// trailing dummy entry commits.
    pub fn propose_configuration(&mut self, new_members: BTreeSet<ServerAddress>) -> Result<()> {
        self.check_can_accept()?;
        if new_members.is_empty() {
            return Err(RaftError::InvalidConfiguration(
                "cannot reconfigure to an empty member set".into(),
            ));
        }
        let book = self.leader.as_ref().ok_or(RaftError::Internal(
            "leader book missing on leader".into(),
        ))?;
        if self.config.is_joint()
            || self.config_index > self.commit_index
            || book.conf_dummy_index.is_some()
        {
            return Err(RaftError::ConfChangeInProgress);
        }
        if self.config.current == new_members {
            // Nothing to change; resolve immediately.
            self.output.conf_change_result = Some(Ok(()));
            return Ok(());
        }

        let old = self.config.current.clone();
        let joined: Vec<ServerAddress> = new_members.difference(&old).cloned().collect();
        let joint = Configuration::joint(old, new_members);
        self.output.peers_joined.extend(joined);
        self.append_local(EntryPayload::Configuration(joint));
        if let Some(book) = self.leader.as_mut() {
            book.conf_waiter = true;
        }
        info!(term = self.current_term, index = self.config_index, "started configuration change");
        self.replicate_all();
        self.maybe_commit();
        Ok(())
    }

    /// Request a read barrier. Returns a ticket resolved through
    /// [`Output::reads_ready`] / [`Output::reads_failed`].
    pub fn request_read_barrier(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        match self.role {
            Role::Leader => {
                self.register_read(ticket, None);
            }
            _ => match self.leader_id {
                Some(leader) => {
                    let msg = Message::ReadBarrierRequest(ReadBarrierRequest {
                        term: self.current_term,
                        ticket,
                    });
                    self.send(leader, msg);
                }
                None => {
                    self.output.reads_failed.push((ticket, None));
                }
            },
        }
        ticket
    }

    /// Begin a leadership transfer. The pending promise resolves through
    /// [`Output::stepdown_result`]: `Ok` once a new leader deposed us,
    /// `Err(Timeout)` if nobody took over within `timeout_ticks`.
    pub fn stepdown(&mut self, timeout_ticks: u64) -> Result<()> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader_id,
            });
        }
        let book = self.leader.as_mut().ok_or(RaftError::Internal(
            "leader book missing on leader".into(),
        ))?;
        if book.transfer.is_some() {
            return Err(RaftError::Internal(
                "leadership transfer already in progress".into(),
            ));
        }
        book.transfer = Some(Transfer {
            ticks_left: timeout_ticks.max(1),
            target: None,
            waiter: true,
        });
        info!(term = self.current_term, "stepping down, transferring leadership");
        self.replicate_all();
        self.try_transfer();
        Ok(())
    }

    /// Start an election immediately, skipping the pre-vote round.
    pub fn campaign(&mut self) {
        if self.role != Role::Leader && self.is_voter(self.id) {
            self.start_election();
        }
    }

    /// Make the election timer fire on the next tick.
    pub fn elapse_election(&mut self) {
        self.election_elapsed = self.randomized_election_timeout;
        self.leader_contact_elapsed = self
            .leader_contact_elapsed
            .max(self.opts.election_timeout_ticks);
    }

    /// I/O completion: the state machine finished applying up to
    /// `up_to`. May request a snapshot.
    pub fn applied(&mut self, up_to: LogIndex) {
        let up_to = up_to.min(self.commit_index);
        if up_to <= self.last_applied {
            return;
        }
        self.last_applied = up_to;
        let covered = self.log.snapshot().last_included_index;
        if !self.snapshot_pending
            && self.last_applied - covered >= self.opts.snapshot_threshold
        {
            self.snapshot_pending = true;
            self.output.snapshot_needed = true;
            debug!(
                last_applied = self.last_applied,
                covered, "requesting state machine snapshot"
            );
        }
    }

    /// I/O completion: the state machine produced its image. Builds the
    /// descriptor at `last_applied` and compacts the log head, keeping
    /// `snapshot_trailing` entries for lagging followers.
    pub fn snapshot_taken(&mut self, data: Vec<u8>) {
        self.snapshot_pending = false;
        let index = self.last_applied;
        if index <= self.log.snapshot().last_included_index {
            return;
        }
        let term = match self.log.term_at(index) {
            Some(t) => t,
            None => {
                warn!(index, "snapshot index fell out of the log window");
                return;
            }
        };
        let (configuration, _) = self.log.configuration_up_to(index);
        let descriptor = SnapshotDescriptor {
            last_included_index: index,
            last_included_term: term,
            configuration,
            data: data.into(),
        };
        self.log.set_snapshot(descriptor.clone());
        self.output.persist_snapshot = Some(descriptor);

        let keep_from = index.saturating_sub(self.opts.snapshot_trailing);
        if keep_from >= self.log.first_index() {
            self.log.compact(keep_from);
            self.output.compact_log_to = Some(keep_from);
        }
        info!(index, term, "took snapshot and compacted log");
    }

    /// Process one inbound wire message.
    pub fn step(&mut self, from: ServerId, message: Message) {
        let term = message.term();
        if message.is_prevote() {
            // Pre-vote traffic carries a prospective term; it never
            // inflates ours.
        } else if term > self.current_term {
            let leader = if message.is_from_leader() { Some(from) } else { None };
            self.become_follower(term, leader);
        } else if term < self.current_term {
            self.reject_stale(from, &message);
            return;
        }

        match message {
            Message::PreVoteRequest(req) => self.handle_prevote_request(from, req),
            Message::PreVoteResponse(resp) => self.handle_prevote_response(from, resp),
            Message::VoteRequest(req) => self.handle_vote_request(from, req),
            Message::VoteResponse(resp) => self.handle_vote_response(from, resp),
            Message::AppendEntriesRequest(req) => self.handle_append_request(from, req),
            Message::AppendEntriesResponse(resp) => self.handle_append_response(from, resp),
            Message::InstallSnapshotRequest(req) => self.handle_install_snapshot(from, req),
            Message::InstallSnapshotResponse(resp) => {
                self.handle_install_snapshot_response(from, resp)
            }
            Message::TimeoutNow(msg) => self.handle_timeout_now(from, msg),
            Message::ReadBarrierRequest(req) => self.handle_read_barrier_request(from, req),
            Message::ReadBarrierResponse(resp) => self.handle_read_barrier_response(from, resp),
        }
    }

    // ------------------------------------------------------------------
    // Role transitions
    // ------------------------------------------------------------------

    fn become_follower(&mut self, term: Term, leader: Option<ServerId>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.output.term_vote = Some((self.current_term, self.voted_for));
        }
        let was = self.role;
        if let Some(book) = self.leader.take() {
            // Settle the promises only a leader can hold.
            if book.conf_waiter {
                self.output.conf_change_result = Some(Err(RaftError::CommitStatusUnknown));
            }
            for read in book.reads {
                match read.requester {
                    Some(peer) => {
                        let msg = Message::ReadBarrierResponse(ReadBarrierResponse {
                            term: self.current_term,
                            ticket: read.ticket,
                            read_index: None,
                        });
                        self.send(peer, msg);
                    }
                    None => self.output.reads_failed.push((read.ticket, leader)),
                }
            }
            if let Some(transfer) = book.transfer {
                if transfer.waiter {
                    // A new leader took over; the transfer succeeded.
                    self.output.stepdown_result = Some(Ok(()));
                }
            }
        }
        self.role = Role::Follower;
        self.leader_id = leader;
        self.prevotes.clear();
        self.votes.clear();
        self.reset_election_timer();
        if leader.is_some() {
            self.leader_contact_elapsed = 0;
        }
        if was != Role::Follower {
            info!(term = self.current_term, leader = ?leader.map(|l| l.to_string()), "became follower");
        } else {
            debug!(term = self.current_term, leader = ?leader.map(|l| l.to_string()), "follower state refreshed");
        }
    }

    fn start_prevote(&mut self) {
        self.role = Role::PreCandidate;
        self.leader_id = None;
        self.prevotes.clear();
        self.prevotes.insert(self.id);
        self.reset_election_timer();
        let (last_log_index, last_log_term) = self.last_log_idx_term();
        debug!(term = self.current_term + 1, "starting pre-vote round");
        let peers: Vec<ServerId> = self.voting_peers();
        for peer in peers {
            let msg = Message::PreVoteRequest(PreVoteRequest {
                term: self.current_term + 1,
                candidate: self.id,
                last_log_index,
                last_log_term,
            });
            self.send(peer, msg);
        }
        if self.config.has_quorum(&self.prevotes) {
            self.start_election();
        }
    }

    fn start_election(&mut self) {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.output.term_vote = Some((self.current_term, self.voted_for));
        self.leader_id = None;
        self.votes.clear();
        self.votes.insert(self.id);
        self.reset_election_timer();
        info!(term = self.current_term, "starting election");
        let (last_log_index, last_log_term) = self.last_log_idx_term();
        let peers: Vec<ServerId> = self.voting_peers();
        for peer in peers {
            let msg = Message::VoteRequest(VoteRequest {
                term: self.current_term,
                candidate: self.id,
                last_log_index,
                last_log_term,
            });
            self.send(peer, msg);
        }
        if self.config.has_quorum(&self.votes) {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        let voters = self.config.voter_ids();
        self.leader = Some(LeaderBook::new(&voters, self.id, self.log.last_index()));
        info!(term = self.current_term, "won election, became leader");
        // An entry of the current term is needed before anything older
        // can commit; the dummy also gives the new term a commit signal.
        self.append_local(EntryPayload::Dummy);
        self.replicate_all();
        self.maybe_commit();
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        let base = self.opts.election_timeout_ticks;
        self.randomized_election_timeout = self.rng.gen_range(base..2 * base);
    }

    fn on_election_timeout(&mut self) {
        if !self.is_voter(self.id) {
            self.reset_election_timer();
            return;
        }
        match self.role {
            Role::Follower => {
                if self.opts.enable_prevoting {
                    self.start_prevote();
                } else {
                    self.start_election();
                }
            }
            // A failed pre-vote round falls back to follower and retries
            // from scratch after another timeout.
            Role::PreCandidate => self.become_follower(self.current_term, None),
            Role::Candidate => self.start_election(),
            Role::Leader => {}
        }
    }

    fn leader_tick(&mut self) {
        let Some(book) = self.leader.as_mut() else {
            return;
        };
        book.heartbeat_elapsed += 1;
        let heartbeat_due = book.heartbeat_elapsed >= self.opts.heartbeat_interval_ticks;
        if heartbeat_due {
            book.heartbeat_elapsed = 0;
        }

        // Transfer countdown.
        let mut transfer_expired = false;
        if let Some(transfer) = book.transfer.as_mut() {
            transfer.ticks_left = transfer.ticks_left.saturating_sub(1);
            transfer_expired = transfer.ticks_left == 0;
        }
        if transfer_expired {
            if let Some(transfer) = book.transfer.take() {
                warn!(term = self.current_term, "leadership transfer timed out");
                if transfer.waiter {
                    self.output.stepdown_result = Some(Err(RaftError::Timeout));
                }
            }
        }

        // Preemptive stepdown when the failure detector reports no live
        // quorum for a full election timeout.
        let mut alive: BTreeSet<ServerId> = self
            .config
            .voter_ids()
            .into_iter()
            .filter(|id| !self.dead.contains(id))
            .collect();
        alive.insert(self.id);
        let book = match self.leader.as_mut() {
            Some(b) => b,
            None => return,
        };
        if self.config.has_quorum(&alive) {
            book.no_quorum_ticks = 0;
        } else {
            book.no_quorum_ticks += 1;
            if book.no_quorum_ticks >= self.opts.election_timeout_ticks {
                warn!(term = self.current_term, "no live quorum, stepping down");
                self.become_follower(self.current_term, None);
                return;
            }
        }

        if heartbeat_due {
            self.replicate_all();
            self.try_transfer();
        }
    }

    // ------------------------------------------------------------------
    // Replication (leader side)
    // ------------------------------------------------------------------

    fn replicate_all(&mut self) {
        let Some(book) = self.leader.as_mut() else {
            return;
        };
        book.round += 1;
        let peers: Vec<ServerId> = book.progress.keys().copied().collect();
        for peer in peers {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, peer: ServerId) {
        let Some(book) = self.leader.as_mut() else {
            return;
        };
        let round = book.round;
        let Some(progress) = book.progress.get_mut(&peer) else {
            return;
        };
        if let Some(sent_round) = progress.snapshot_inflight {
            // Retry a transfer whose response never came back.
            if round.saturating_sub(sent_round) <= self.opts.election_timeout_ticks {
                return;
            }
            progress.snapshot_inflight = None;
        }
        let peer_dead = self.dead.contains(&peer);

        if progress.next < self.log.first_index() {
            // The entries the peer needs are gone; ship the snapshot.
            if peer_dead {
                return;
            }
            let snapshot = self.log.snapshot().clone();
            progress.snapshot_inflight = Some(round);
            debug!(
                peer = %peer,
                index = snapshot.last_included_index,
                "follower behind compacted log, sending snapshot"
            );
            let msg = Message::InstallSnapshotRequest(InstallSnapshotRequest {
                term: self.current_term,
                leader: self.id,
                snapshot,
            });
            self.send(peer, msg);
            return;
        }

        let prev_log_index = progress.next - 1;
        let prev_log_term = match self.log.term_at(prev_log_index) {
            Some(t) => t,
            None => {
                warn!(peer = %peer, prev_log_index, "no term for append proof");
                return;
            }
        };
        // Dead peers still get heartbeats (cheap, and the detector may be
        // wrong) but no payload.
        let entries = if peer_dead {
            Vec::new()
        } else {
            let next = progress.next;
            self.log.entries_from(next, self.opts.append_request_threshold)
        };
        if let (Some(book), true) = (self.leader.as_mut(), !entries.is_empty()) {
            if let Some(p) = book.progress.get_mut(&peer) {
                // Optimistically advance; conflict responses roll back.
                p.next = entries.last().map(|e| e.index + 1).unwrap_or(p.next);
            }
        }
        let msg = Message::AppendEntriesRequest(AppendEntriesRequest {
            term: self.current_term,
            leader: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
            round,
        });
        self.send(peer, msg);
    }

    fn handle_append_response(&mut self, from: ServerId, resp: AppendEntriesResponse) {
        if self.role != Role::Leader || resp.term != self.current_term {
            return;
        }
        let Some(book) = self.leader.as_mut() else {
            return;
        };
        let Some(progress) = book.progress.get_mut(&from) else {
            return;
        };
        // Any same-term response proves we were the leader for the
        // request's round; read barriers key off this.
        progress.acked_round = progress.acked_round.max(resp.round);

        if resp.success {
            progress.matched = progress.matched.max(resp.last_index);
            progress.next = progress.next.max(resp.last_index + 1);
            self.maybe_commit();
            self.check_reads();
            self.try_transfer();
        } else {
            // Jump `next` back using the follower's hint and retry
            // immediately; the hint skips whole conflicting-term runs.
            let fallback = progress.next.saturating_sub(1).max(1);
            let hinted = resp.conflict_index.unwrap_or(fallback).min(fallback);
            progress.next = hinted.max(progress.matched + 1);
            self.check_reads();
            self.send_append(from);
        }
    }

    fn handle_install_snapshot_response(&mut self, from: ServerId, resp: InstallSnapshotResponse) {
        if self.role != Role::Leader || resp.term != self.current_term {
            return;
        }
        let Some(book) = self.leader.as_mut() else {
            return;
        };
        let Some(progress) = book.progress.get_mut(&from) else {
            return;
        };
        progress.snapshot_inflight = None;
        progress.matched = progress.matched.max(resp.last_included_index);
        progress.next = progress.next.max(resp.last_included_index + 1);
        debug!(peer = %from, index = resp.last_included_index, "snapshot installed on follower");
        self.maybe_commit();
        // Ship whatever the log accumulated past the snapshot.
        self.send_append(from);
    }

    /// Advance the commit index to the highest slot a quorum of every
    /// active configuration has stored, provided a current-term entry is
    /// among them.
    fn maybe_commit(&mut self) {
        loop {
            let Some(book) = self.leader.as_ref() else {
                return;
            };
            let own_last = self.log.last_index();
            let committable = self.config.quorum_index(|id| {
                if id == self.id {
                    own_last
                } else {
                    book.progress.get(&id).map(|p| p.matched).unwrap_or(0)
                }
            });
            if committable <= self.commit_index {
                return;
            }
            // An entry from a prior term only commits transitively via an
            // entry of the current term (Raft §5.4.2).
            if self.log.term_at(committable) != Some(self.current_term) {
                return;
            }
            self.advance_commit(committable);
            // Committing may have appended follow-up entries (leaving a
            // joint configuration, trailing dummy); loop to re-evaluate.
        }
    }

    fn advance_commit(&mut self, to: LogIndex) {
        debug_assert!(to > self.commit_index);
        self.commit_index = to;
        debug!(term = self.current_term, commit_index = to, "commit index advanced");
        let newly = self.log.entries_range(self.apply_cursor + 1, to);
        self.apply_cursor = to;
        self.output.apply.extend(newly);

        if self.role == Role::Leader {
            self.after_leader_commit();
        }
    }

    /// Leader-side follow-ups once the commit index moved: drive the
    /// joint-consensus protocol forward and settle promises.
    fn after_leader_commit(&mut self) {
        // Phase 1 done: the joint entry committed; append C_new plus the
        // trailing dummy that gives callers a commit-time signal.
        if self.config.is_joint() && self.config_index <= self.commit_index {
            let simple = self.config.leave_joint();
            info!(term = self.current_term, "joint configuration committed, leaving joint phase");
            self.append_local(EntryPayload::Configuration(simple));
            let dummy_index = self.append_local(EntryPayload::Dummy);
            if let Some(book) = self.leader.as_mut() {
                book.conf_dummy_index = Some(dummy_index);
            }
            self.replicate_all();
        }

        // Phase 2 done: the simple configuration committed; drop the
        // departed members and step down if we are one of them.
        if !self.config.is_joint() && self.config_index <= self.commit_index {
            let voters = self.config.voter_ids();
            if let Some(book) = self.leader.as_mut() {
                let gone = book.retain_members(&voters);
                if !gone.is_empty() {
                    info!(departed = gone.len(), "configuration change removed members");
                    self.output.peers_left.extend(gone);
                }
            }
            if !self.config.contains(self.id) {
                info!(term = self.current_term, "removed from configuration, stepping down");
                self.become_follower(self.current_term, None);
                return;
            }
        }

        // The trailing dummy committed: the change is fully settled.
        let dummy_done = self
            .leader
            .as_ref()
            .and_then(|b| b.conf_dummy_index)
            .map_or(false, |idx| idx <= self.commit_index);
        if dummy_done {
            if let Some(book) = self.leader.as_mut() {
                book.conf_dummy_index = None;
                if book.conf_waiter {
                    book.conf_waiter = false;
                    self.output.conf_change_result = Some(Ok(()));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Follower side
    // ------------------------------------------------------------------

    fn handle_append_request(&mut self, from: ServerId, req: AppendEntriesRequest) {
        // A valid append at our term means there is a leader; candidates
        // and pre-candidates yield to it.
        if self.role != Role::Follower {
            self.become_follower(self.current_term, Some(from));
        }
        self.leader_id = Some(from);
        self.leader_contact_elapsed = 0;
        self.election_elapsed = 0;

        if !self.log.matches(req.prev_log_index, req.prev_log_term) {
            let (conflict_index, conflict_term) = self.conflict_hint(req.prev_log_index);
            debug!(
                leader = %from,
                prev_log_index = req.prev_log_index,
                prev_log_term = req.prev_log_term,
                ?conflict_index,
                "append rejected, log mismatch"
            );
            let msg = Message::AppendEntriesResponse(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                last_index: self.log.last_index(),
                conflict_index: Some(conflict_index),
                conflict_term,
                round: req.round,
            });
            self.send(from, msg);
            return;
        }

        let mut config_dirty = false;
        let last_new = req.prev_log_index + req.entries.len() as u64;
        for entry in req.entries {
            // Entries the snapshot already covers are settled.
            if entry.index <= self.log.snapshot().last_included_index {
                continue;
            }
            if let Some(term) = self.log.term_at(entry.index) {
                if term == entry.term {
                    // Identical replay; idempotent.
                    continue;
                }
                // Same index, different term: everything from here on is
                // stale. Committed entries never conflict (Log Matching).
                debug_assert!(entry.index > self.commit_index);
                self.log.truncate_from(entry.index);
                self.output.truncate_log_from = Some(
                    self.output
                        .truncate_log_from
                        .map_or(entry.index, |old| old.min(entry.index)),
                );
                config_dirty = true;
            }
            if let EntryPayload::Configuration(_) = &entry.payload {
                config_dirty = true;
            }
            if let Err(e) = self.log.append(entry.clone()) {
                warn!(error = %e, index = entry.index, "append from leader failed");
                break;
            }
            self.output.entries.push(entry);
        }
        if config_dirty {
            self.refresh_configuration();
        }

        let new_commit = req.leader_commit.min(last_new);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            let newly = self.log.entries_range(self.apply_cursor + 1, new_commit);
            self.apply_cursor = new_commit;
            self.output.apply.extend(newly);
        }

        let msg = Message::AppendEntriesResponse(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            last_index: last_new,
            conflict_index: None,
            conflict_term: None,
            round: req.round,
        });
        self.send(from, msg);
    }

    /// Where the leader should retry after a consistency-check failure:
    /// the first index of the conflicting term, or just past our log if
    /// the probed index is absent entirely.
    fn conflict_hint(&self, prev_log_index: LogIndex) -> (LogIndex, Option<Term>) {
        if prev_log_index > self.log.last_index() {
            return (self.log.last_index() + 1, None);
        }
        match self.log.term_at(prev_log_index) {
            Some(conflicting) => {
                let mut idx = prev_log_index;
                while idx > self.log.first_index()
                    && self.log.term_at(idx - 1) == Some(conflicting)
                {
                    idx -= 1;
                }
                (idx, Some(conflicting))
            }
            None => (self.log.last_index() + 1, None),
        }
    }

    fn handle_install_snapshot(&mut self, from: ServerId, req: InstallSnapshotRequest) {
        if self.role != Role::Follower {
            self.become_follower(self.current_term, Some(from));
        }
        self.leader_id = Some(from);
        self.leader_contact_elapsed = 0;
        self.election_elapsed = 0;

        let snapshot = req.snapshot;
        let index = snapshot.last_included_index;
        if index <= self.commit_index {
            // Stale transfer; just tell the leader where we are.
            let msg = Message::InstallSnapshotResponse(InstallSnapshotResponse {
                term: self.current_term,
                last_included_index: index,
            });
            self.send(from, msg);
            return;
        }

        info!(index, term = snapshot.last_included_term, "installing snapshot from leader");
        let suffix_retained = self.log.install_snapshot(snapshot.clone());
        if !suffix_retained {
            // Whatever the persisted log held past the snapshot boundary
            // diverged from the leader and must go with the window.
            self.output.truncate_log_from = Some(
                self.output
                    .truncate_log_from
                    .map_or(index + 1, |old| old.min(index + 1)),
            );
        }
        self.commit_index = index;
        self.last_applied = index;
        self.apply_cursor = self.apply_cursor.max(index);
        // Entries the snapshot covers must not be applied on top of it.
        self.output.apply.retain(|e| e.index > index);
        self.output.install_snapshot = Some(snapshot);
        self.refresh_configuration();

        let msg = Message::InstallSnapshotResponse(InstallSnapshotResponse {
            term: self.current_term,
            last_included_index: index,
        });
        self.send(from, msg);
    }

    /// Re-derive the effective membership after the log changed shape
    /// (truncation, configuration append, snapshot install).
    fn refresh_configuration(&mut self) {
        let (config, index) = self.log.latest_configuration();
        if index == self.config_index && config == self.config {
            return;
        }
        let old_ids = self.config.voter_ids();
        let joined: Vec<ServerAddress> = config
            .voter_ids()
            .difference(&old_ids)
            .filter_map(|id| config.address_of(*id).cloned())
            .collect();
        self.output.peers_joined.extend(joined);
        self.config = config;
        self.config_index = index;
        if let Some(book) = self.leader.as_mut() {
            book.ensure_members(&self.config.voter_ids(), self.id, self.log.last_index());
        }
    }

    // ------------------------------------------------------------------
    // Elections
    // ------------------------------------------------------------------

    fn handle_prevote_request(&mut self, from: ServerId, req: PreVoteRequest) {
        // The request advertises the term the candidate would campaign
        // at; anything not beyond our term is already stale.
        let granted = req.term > self.current_term
            && self.log.is_up_to_date(req.last_log_index, req.last_log_term)
            && self.leader_contact_elapsed >= self.opts.election_timeout_ticks;
        debug!(candidate = %from, term = req.term, granted, "pre-vote request");
        let term = if granted { req.term } else { self.current_term };
        let msg = Message::PreVoteResponse(PreVoteResponse { term, granted });
        self.send(from, msg);
    }

    fn handle_prevote_response(&mut self, from: ServerId, resp: PreVoteResponse) {
        if !resp.granted && resp.term > self.current_term {
            // The rejection carries a real, higher term.
            self.become_follower(resp.term, None);
            return;
        }
        if self.role != Role::PreCandidate || resp.term != self.current_term + 1 || !resp.granted {
            return;
        }
        self.prevotes.insert(from);
        if self.config.has_quorum(&self.prevotes) {
            debug!(term = self.current_term + 1, "pre-vote quorum reached");
            self.start_election();
        }
    }

    fn handle_vote_request(&mut self, from: ServerId, req: VoteRequest) {
        let can_vote = self.voted_for.is_none() || self.voted_for == Some(req.candidate);
        let granted = can_vote && self.log.is_up_to_date(req.last_log_index, req.last_log_term);
        if granted && self.voted_for.is_none() {
            self.voted_for = Some(req.candidate);
            // The grant must not leave before the vote is durable; the
            // loop persists `term_vote` ahead of `messages`.
            self.output.term_vote = Some((self.current_term, self.voted_for));
            self.election_elapsed = 0;
        }
        debug!(candidate = %from, term = req.term, granted, "vote request");
        let msg = Message::VoteResponse(VoteResponse {
            term: self.current_term,
            granted,
        });
        self.send(from, msg);
    }

    fn handle_vote_response(&mut self, from: ServerId, resp: VoteResponse) {
        if self.role != Role::Candidate || resp.term != self.current_term || !resp.granted {
            return;
        }
        self.votes.insert(from);
        if self.config.has_quorum(&self.votes) {
            self.become_leader();
        }
    }

    fn handle_timeout_now(&mut self, from: ServerId, msg: TimeoutNow) {
        if msg.term != self.current_term || !self.is_voter(self.id) {
            return;
        }
        info!(from = %from, term = msg.term, "told to campaign immediately");
        self.start_election();
    }

    // ------------------------------------------------------------------
    // Read barriers
    // ------------------------------------------------------------------

    fn register_read(&mut self, ticket: u64, requester: Option<ServerId>) {
        let index = self.commit_index;
        let Some(book) = self.leader.as_mut() else {
            return;
        };
        let round = book.round + 1;
        book.reads.push(PendingRead {
            ticket,
            index,
            round,
            requester,
        });
        // Force a fresh round so the barrier resolves promptly.
        self.replicate_all();
        self.check_reads();
    }

    /// Resolve barriers whose round has been answered by a quorum.
    fn check_reads(&mut self) {
        let Some(book) = self.leader.as_mut() else {
            return;
        };
        if book.reads.is_empty() {
            return;
        }
        let mut acked: BTreeSet<ServerId> = BTreeSet::new();
        acked.insert(self.id);
        let mut remaining = Vec::new();
        let reads = std::mem::take(&mut book.reads);
        let mut resolved = Vec::new();
        for read in reads {
            acked.clear();
            acked.insert(self.id);
            for (id, p) in &book.progress {
                if p.acked_round >= read.round {
                    acked.insert(*id);
                }
            }
            if self.config.has_quorum(&acked) {
                resolved.push(read);
            } else {
                remaining.push(read);
            }
        }
        book.reads = remaining;
        for read in resolved {
            debug!(ticket = read.ticket, index = read.index, "read barrier established");
            match read.requester {
                Some(peer) => {
                    let msg = Message::ReadBarrierResponse(ReadBarrierResponse {
                        term: self.current_term,
                        ticket: read.ticket,
                        read_index: Some(read.index),
                    });
                    self.send(peer, msg);
                }
                None => self.output.reads_ready.push((read.ticket, read.index)),
            }
        }
    }

    fn handle_read_barrier_request(&mut self, from: ServerId, req: ReadBarrierRequest) {
        if self.role == Role::Leader {
            self.register_read(req.ticket, Some(from));
        } else {
            let msg = Message::ReadBarrierResponse(ReadBarrierResponse {
                term: self.current_term,
                ticket: req.ticket,
                read_index: None,
            });
            self.send(from, msg);
        }
    }

    fn handle_read_barrier_response(&mut self, _from: ServerId, resp: ReadBarrierResponse) {
        match resp.read_index {
            Some(index) => self.output.reads_ready.push((resp.ticket, index)),
            None => self
                .output
                .reads_failed
                .push((resp.ticket, self.leader_id)),
        }
    }

    // ------------------------------------------------------------------
    // Leadership transfer
    // ------------------------------------------------------------------

    /// Send `TimeoutNow` to the most caught-up live voting follower once
    /// it fully matches our log.
    fn try_transfer(&mut self) {
        let Some(book) = self.leader.as_ref() else {
            return;
        };
        let Some(transfer) = book.transfer.as_ref() else {
            return;
        };
        if transfer.target.is_some() {
            return;
        }
        let last = self.log.last_index();
        let best = book
            .progress
            .iter()
            .filter(|(id, _)| self.config.contains(**id) && !self.dead.contains(*id))
            .max_by_key(|(_, p)| p.matched)
            .map(|(id, p)| (*id, p.matched));
        if let Some((target, matched)) = best {
            if matched == last {
                info!(target = %target, "follower caught up, sending timeout-now");
                if let Some(book) = self.leader.as_mut() {
                    if let Some(transfer) = book.transfer.as_mut() {
                        transfer.target = Some(target);
                    }
                }
                let msg = Message::TimeoutNow(TimeoutNow {
                    term: self.current_term,
                });
                self.send(target, msg);
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn check_can_accept(&self) -> Result<()> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader_id,
            });
        }
        if let Some(book) = self.leader.as_ref() {
            if let Some(transfer) = book.transfer.as_ref() {
                // Stepping down: no new entries.
                return Err(RaftError::NotLeader {
                    leader: transfer.target,
                });
            }
        }
        Ok(())
    }

    fn is_voter(&self, id: ServerId) -> bool {
        self.config.contains(id)
    }

    fn voting_peers(&self) -> Vec<ServerId> {
        self.config
            .voter_ids()
            .into_iter()
            .filter(|id| *id != self.id)
            .collect()
    }

    /// Append an entry at our own tail and stage it for persistence.
    fn append_local(&mut self, payload: EntryPayload) -> LogIndex {
        let index = self.log.last_index() + 1;
        let entry = LogEntry {
            term: self.current_term,
            index,
            payload,
        };
        if let Err(e) = self.log.append(entry.clone()) {
            // Only reachable if internal invariants are already broken.
            warn!(error = %e, index, "local append failed");
            return index;
        }
        if let EntryPayload::Configuration(_) = &entry.payload {
            self.refresh_configuration();
        }
        self.output.entries.push(entry);
        index
    }

    fn reject_stale(&mut self, from: ServerId, message: &Message) {
        match message {
            Message::VoteRequest(_) => {
                let msg = Message::VoteResponse(VoteResponse {
                    term: self.current_term,
                    granted: false,
                });
                self.send(from, msg);
            }
            Message::AppendEntriesRequest(req) => {
                let msg = Message::AppendEntriesResponse(AppendEntriesResponse {
                    term: self.current_term,
                    success: false,
                    last_index: self.log.last_index(),
                    conflict_index: None,
                    conflict_term: None,
                    round: req.round,
                });
                self.send(from, msg);
            }
            Message::InstallSnapshotRequest(_) => {
                let msg = Message::InstallSnapshotResponse(InstallSnapshotResponse {
                    term: self.current_term,
                    last_included_index: 0,
                });
                self.send(from, msg);
            }
            Message::ReadBarrierRequest(req) => {
                let msg = Message::ReadBarrierResponse(ReadBarrierResponse {
                    term: self.current_term,
                    ticket: req.ticket,
                    read_index: None,
                });
                self.send(from, msg);
            }
            _ => {}
        }
    }

    fn send(&mut self, to: ServerId, message: Message) {
        self.output.messages.push(Envelope { to, message });
    }
}
