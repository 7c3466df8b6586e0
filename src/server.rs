//! The server loop: owns the decision core and drives it.
//!
//! One cooperative task interleaves client commands, inbound RPC
//! messages, clock ticks and I/O completions through a single channel,
//! feeds them to the [`Fsm`] and dispatches each [`Output`] batch to the
//! collaborators. Client promises are kept as waiters keyed by
//! `(term, index)` and resolved as the commit and apply indices cross
//! them; a promise survives leader changes until it reaches a definitive
//! verdict.

use crate::config::RaftOptions;
use crate::error::{RaftError, Result};
use crate::failure::FailureDetector;
use crate::fsm::{Fsm, Output, Role};
use crate::log::{LogEntry, RaftLog, SnapshotDescriptor};
use crate::membership::Configuration;
use crate::message::Message;
use crate::persistence::Persistence;
use crate::rpc::Rpc;
use crate::types::{LogIndex, ServerAddress, ServerId, Term, WaitType};
use crate::StateMachine;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Commands delivered to the loop task.
enum Command {
    AddEntry {
        data: Vec<u8>,
        wait: WaitType,
        resp: oneshot::Sender<Result<()>>,
    },
    SetConfiguration {
        members: BTreeSet<ServerAddress>,
        resp: oneshot::Sender<Result<()>>,
    },
    ReadBarrier {
        resp: oneshot::Sender<Result<()>>,
    },
    Stepdown {
        timeout_ticks: u64,
        resp: oneshot::Sender<Result<()>>,
    },
    Inbound {
        from: ServerId,
        message: Message,
    },
    Tick {
        resp: Option<oneshot::Sender<()>>,
    },
    ElapseElection {
        resp: oneshot::Sender<()>,
    },
    Abort {
        resp: oneshot::Sender<()>,
    },
}

/// Snapshot of the observable server state, refreshed by the loop after
/// every processed event.
#[derive(Debug, Clone)]
struct StatusSnapshot {
    role: Role,
    term: Term,
    leader: Option<ServerId>,
    configuration: Configuration,
    last_log: (LogIndex, Term),
}

/// A promise waiting on an entry's fate.
struct EntryWaiter {
    term: Term,
    wait: WaitType,
    tx: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct Waiters {
    /// Entry promises, keyed by log index.
    entries: BTreeMap<LogIndex, Vec<EntryWaiter>>,
    /// Read barriers waiting for quorum confirmation, keyed by ticket.
    reads: HashMap<u64, oneshot::Sender<Result<()>>>,
    /// Confirmed barriers waiting for `last_applied` to catch up.
    read_applies: Vec<(LogIndex, oneshot::Sender<Result<()>>)>,
    conf_change: Option<oneshot::Sender<Result<()>>>,
    stepdown: Option<oneshot::Sender<Result<()>>>,
}

impl Waiters {
    /// Fail every pending promise; used on abort and on fatal errors.
    fn fail_all(&mut self) {
        for (_, waiters) in std::mem::take(&mut self.entries) {
            for w in waiters {
                let _ = w.tx.send(Err(RaftError::CommitStatusUnknown));
            }
        }
        for (_, tx) in std::mem::take(&mut self.reads) {
            let _ = tx.send(Err(RaftError::CommitStatusUnknown));
        }
        for (_, tx) in std::mem::take(&mut self.read_applies) {
            let _ = tx.send(Err(RaftError::CommitStatusUnknown));
        }
        if let Some(tx) = self.conf_change.take() {
            let _ = tx.send(Err(RaftError::CommitStatusUnknown));
        }
        if let Some(tx) = self.stepdown.take() {
            let _ = tx.send(Err(RaftError::CommitStatusUnknown));
        }
    }
}

/// A single participant of a replication group.
///
/// Created by [`RaftServer::start`], which loads persisted state,
/// restores the state machine and spawns the loop; no other method may
/// be called before `start` returns.
pub struct RaftServer {
    cmd_tx: mpsc::Sender<Command>,
    status: Arc<RwLock<StatusSnapshot>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RaftServer {
    /// Load persistent state and start the server.
    pub async fn start(
        id: ServerId,
        options: RaftOptions,
        rpc: Arc<dyn Rpc>,
        persistence: Arc<dyn Persistence>,
        failure_detector: Arc<dyn FailureDetector>,
        mut state_machine: Box<dyn StateMachine>,
    ) -> Result<Self> {
        options.validate()?;

        let (term, voted_for) = persistence.load_term_vote().await?.unwrap_or((0, None));
        let snapshot = persistence
            .load_snapshot()
            .await?
            .unwrap_or_else(|| SnapshotDescriptor::bootstrap(Configuration::simple(BTreeSet::new())));
        let entries = persistence.load_log().await?;

        if snapshot.last_included_index > 0 {
            state_machine.load_snapshot(&snapshot.data).await?;
        }

        let log = RaftLog::new(snapshot, entries)?;
        let mut fsm = Fsm::new(id, options.clone(), term, voted_for, log)?;

        // Replay whatever is known committed past the snapshot. On a
        // fresh restart the commit index equals the snapshot boundary,
        // so this is a no-op; it matters when an embedder persisted a
        // commit watermark through the snapshot itself.
        let replay = fsm
            .log()
            .entries_range(fsm.last_applied() + 1, fsm.commit_index());
        if !replay.is_empty() {
            let commands: Vec<LogEntry> = replay
                .iter()
                .filter(|e| e.command_data().is_some())
                .cloned()
                .collect();
            state_machine.apply(&commands).await;
            let up_to = fsm.commit_index();
            fsm.applied(up_to);
        }

        info!(
            server = %id,
            term = fsm.current_term(),
            last_log = fsm.last_log_idx_term().0,
            "server starting"
        );

        let status = Arc::new(RwLock::new(StatusSnapshot {
            role: fsm.role(),
            term: fsm.current_term(),
            leader: fsm.leader_hint(),
            configuration: fsm.configuration().clone(),
            last_log: fsm.last_log_idx_term(),
        }));

        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let task = ServerTask {
            fsm,
            waiters: Waiters::default(),
            rpc,
            persistence,
            failure_detector,
            state_machine,
            status: Arc::clone(&status),
            tick_interval: options.tick_interval,
        };
        let handle = tokio::spawn(task.run(cmd_rx));

        Ok(Self {
            cmd_tx,
            status,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Add a command to the replicated log. Must be called on a leader.
    ///
    /// The future resolves once the entry is committed or applied,
    /// depending on `wait`. It fails with [`RaftError::DroppedEntry`] if
    /// a newer leader overwrote the slot, and with
    /// [`RaftError::CommitStatusUnknown`] if this server lost track of
    /// the entry (stepdown with the entry in flight, snapshot covering
    /// the slot, abort).
    pub async fn add_entry(&self, data: Vec<u8>, wait: WaitType) -> Result<()> {
        self.request(|resp| Command::AddEntry { data, wait, resp })
            .await
    }

    /// Replace the cluster membership via joint consensus.
    ///
    /// Resolves once the transition (including its trailing dummy entry)
    /// committed. Because of that trailing entry a
    /// [`RaftError::CommitStatusUnknown`] outcome is possible even when
    /// the new configuration is durably in place; callers must treat it
    /// as "unknown", not "failed".
    pub async fn set_configuration(&self, members: BTreeSet<ServerAddress>) -> Result<()> {
        self.request(|resp| Command::SetConfiguration { members, resp })
            .await
    }

    /// Establish that subsequent local state-machine reads observe every
    /// entry committed before this call. On a follower the request is
    /// forwarded to the known leader.
    pub async fn read_barrier(&self) -> Result<()> {
        self.request(|resp| Command::ReadBarrier { resp }).await
    }

    /// Relinquish leadership to the most caught-up follower. Fails with
    /// [`RaftError::Timeout`] if no follower took over within
    /// `timeout_ticks` logical ticks.
    pub async fn stepdown(&self, timeout_ticks: u64) -> Result<()> {
        self.request(|resp| Command::Stepdown { timeout_ticks, resp })
            .await
    }

    /// Deliver an inbound transport message.
    pub async fn dispatch(&self, from: ServerId, message: Message) -> Result<()> {
        self.cmd_tx
            .send(Command::Inbound { from, message })
            .await
            .map_err(|_| RaftError::Stopped)
    }

    pub fn is_leader(&self) -> bool {
        self.status.read().role.is_leader()
    }

    pub fn get_current_term(&self) -> Term {
        self.status.read().term
    }

    /// The membership currently in force.
    pub fn get_configuration(&self) -> Configuration {
        self.status.read().configuration.clone()
    }

    /// The leader this server would redirect to, if known.
    pub fn leader_hint(&self) -> Option<ServerId> {
        self.status.read().leader
    }

    pub fn log_last_idx_term(&self) -> (LogIndex, Term) {
        self.status.read().last_log
    }

    /// Stop the server. Every pending promise fails with
    /// [`RaftError::CommitStatusUnknown`]; subsequent calls fail with
    /// [`RaftError::Stopped`].
    pub async fn abort(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Abort { resp: tx }).await.is_ok() {
            let _ = rx.await;
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // White-box test hooks; not part of the supported contract.

    /// Inject one logical clock tick.
    #[doc(hidden)]
    pub async fn tick(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Tick { resp: Some(tx) })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Make the election timer fire on the next tick.
    #[doc(hidden)]
    pub async fn elapse_election(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ElapseElection { resp: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Tick until the server is campaigning (or already leading).
    #[doc(hidden)]
    pub async fn wait_until_candidate(&self) {
        loop {
            let role = self.status.read().role;
            if matches!(role, Role::Candidate | Role::Leader) {
                return;
            }
            self.elapse_election().await;
            self.tick().await;
        }
    }

    /// Tick until an election concluded: either we lead or we follow a
    /// known leader.
    #[doc(hidden)]
    pub async fn wait_election_done(&self) {
        loop {
            {
                let status = self.status.read();
                if status.role.is_leader()
                    || (status.role == Role::Follower && status.leader.is_some())
                {
                    return;
                }
            }
            self.tick().await;
            tokio::task::yield_now().await;
        }
    }

    /// Wait until the log reaches `(index, term)`.
    #[doc(hidden)]
    pub async fn wait_log_idx_term(&self, index: LogIndex, term: Term) {
        loop {
            let (last_index, last_term) = self.status.read().last_log;
            if last_index >= index && last_term >= term {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| RaftError::Stopped)?;
        rx.await.map_err(|_| RaftError::Stopped)?
    }
}

/// State owned by the loop task.
struct ServerTask {
    fsm: Fsm,
    waiters: Waiters,
    rpc: Arc<dyn Rpc>,
    persistence: Arc<dyn Persistence>,
    failure_detector: Arc<dyn FailureDetector>,
    state_machine: Box<dyn StateMachine>,
    status: Arc<RwLock<StatusSnapshot>>,
    tick_interval: std::time::Duration,
}

impl ServerTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.on_tick();
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        None => break,
                        Some(Command::Abort { resp }) => {
                            info!(server = %self.fsm.id(), "server aborting");
                            self.waiters.fail_all();
                            let _ = resp.send(());
                            return;
                        }
                        Some(cmd) => self.on_command(cmd),
                    }
                }
            }

            if let Err(e) = self.drain_outputs().await {
                // Persistence and state-machine failures are fatal: the
                // durable state can no longer back the protocol.
                error!(server = %self.fsm.id(), error = %e, "fatal collaborator error, aborting");
                self.waiters.fail_all();
                return;
            }
            self.refresh_status();
        }
    }

    fn on_tick(&mut self) {
        let dead: BTreeSet<ServerId> = self
            .fsm
            .peer_ids()
            .into_iter()
            .filter(|id| !self.failure_detector.is_alive(*id))
            .collect();
        self.fsm.update_liveness(dead);
        self.fsm.tick();
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddEntry { data, wait, resp } => match self.fsm.propose(data) {
                Ok((term, index)) => {
                    self.waiters
                        .entries
                        .entry(index)
                        .or_default()
                        .push(EntryWaiter {
                            term,
                            wait,
                            tx: resp,
                        });
                }
                Err(e) => {
                    let _ = resp.send(Err(e));
                }
            },
            Command::SetConfiguration { members, resp } => {
                if self.waiters.conf_change.is_some() {
                    let _ = resp.send(Err(RaftError::ConfChangeInProgress));
                    return;
                }
                match self.fsm.propose_configuration(members) {
                    Ok(()) => self.waiters.conf_change = Some(resp),
                    Err(e) => {
                        let _ = resp.send(Err(e));
                    }
                }
            }
            Command::ReadBarrier { resp } => {
                let ticket = self.fsm.request_read_barrier();
                self.waiters.reads.insert(ticket, resp);
            }
            Command::Stepdown { timeout_ticks, resp } => {
                if self.waiters.stepdown.is_some() {
                    let _ = resp.send(Err(RaftError::Internal(
                        "stepdown already in progress".into(),
                    )));
                    return;
                }
                match self.fsm.stepdown(timeout_ticks) {
                    Ok(()) => self.waiters.stepdown = Some(resp),
                    Err(e) => {
                        let _ = resp.send(Err(e));
                    }
                }
            }
            Command::Inbound { from, message } => self.fsm.step(from, message),
            Command::Tick { resp } => {
                self.on_tick();
                if let Some(resp) = resp {
                    let _ = resp.send(());
                }
            }
            Command::ElapseElection { resp } => {
                self.fsm.elapse_election();
                let _ = resp.send(());
            }
            // Abort is intercepted by the select loop before dispatch.
            Command::Abort { resp } => {
                let _ = resp.send(());
            }
        }
    }

    /// Dispatch accumulated effect batches until the core is quiet.
    async fn drain_outputs(&mut self) -> Result<()> {
        while self.fsm.has_output() {
            let out = self.fsm.get_output();
            self.dispatch_output(out).await?;
        }
        Ok(())
    }

    async fn dispatch_output(&mut self, out: Output) -> Result<()> {
        // 1. Durable state, in dependency order. Messages citing it are
        //    only sent below, after everything returned.
        if let Some((term, voted_for)) = out.term_vote {
            self.persistence.store_term_vote(term, voted_for).await?;
        }
        if let Some(from) = out.truncate_log_from {
            self.persistence.truncate_log_suffix(from).await?;
            // Overwritten slots can never resolve as submitted.
            let dropped = self.waiters.entries.split_off(&from);
            for (_, waiters) in dropped {
                for w in waiters {
                    let _ = w.tx.send(Err(RaftError::DroppedEntry));
                }
            }
        }
        if !out.entries.is_empty() {
            self.persistence.store_log_entries(&out.entries).await?;
        }
        if let Some(snapshot) = &out.persist_snapshot {
            self.persistence.store_snapshot(snapshot).await?;
        }
        if let Some(snapshot) = &out.install_snapshot {
            self.persistence.store_snapshot(snapshot).await?;
            self.persistence
                .truncate_log_prefix(snapshot.last_included_index)
                .await?;
            self.state_machine.load_snapshot(&snapshot.data).await?;
            // Slots the snapshot covers were committed, but possibly not
            // with the terms our waiters submitted under.
            let keep = self
                .waiters
                .entries
                .split_off(&(snapshot.last_included_index + 1));
            let covered = std::mem::replace(&mut self.waiters.entries, keep);
            for (_, waiters) in covered {
                for w in waiters {
                    let _ = w.tx.send(Err(RaftError::CommitStatusUnknown));
                }
            }
            debug!(
                server = %self.fsm.id(),
                index = snapshot.last_included_index,
                "installed leader snapshot"
            );
        }
        if let Some(up_to) = out.compact_log_to {
            self.persistence.truncate_log_prefix(up_to).await?;
        }

        // 2. Membership plumbing for the transport. Failures are not
        //    fatal; replication retries will surface real problems.
        for address in out.peers_joined {
            if let Err(e) = self.rpc.add_server(address.clone()).await {
                warn!(peer = %address.id, error = %e, "transport add_server failed");
            }
        }
        for id in out.peers_left {
            if let Err(e) = self.rpc.remove_server(id).await {
                warn!(peer = %id, error = %e, "transport remove_server failed");
            }
        }

        // 3. Fire-and-forget sends, fanned out concurrently. Transient
        //    failures are swallowed; the periodic replication loop
        //    retries.
        if !out.messages.is_empty() {
            let sends = out.messages.into_iter().map(|envelope| {
                let rpc = Arc::clone(&self.rpc);
                async move {
                    if let Err(e) = rpc.send(envelope.to, envelope.message).await {
                        debug!(peer = %envelope.to, error = %e, "send failed");
                    }
                }
            });
            futures::future::join_all(sends).await;
        }

        // 4. Apply committed entries, resolving commit promises first
        //    and apply promises once the state machine returns.
        if !out.apply.is_empty() {
            for entry in &out.apply {
                self.resolve_entry_waiters(entry, WaitType::Committed);
            }
            let commands: Vec<LogEntry> = out
                .apply
                .iter()
                .filter(|e| e.command_data().is_some())
                .cloned()
                .collect();
            if !commands.is_empty() {
                self.state_machine.apply(&commands).await;
            }
            if let Some(last) = out.apply.last() {
                self.fsm.applied(last.index);
            }
            for entry in &out.apply {
                self.resolve_entry_waiters(entry, WaitType::Applied);
            }
        }

        // 5. Snapshot production, requested by the core once enough has
        //    been applied since the last one.
        if out.snapshot_needed {
            let data = self.state_machine.take_snapshot().await;
            self.fsm.snapshot_taken(data);
        }

        // 6. Read barriers: confirmed ones resolve as soon as the apply
        //    index caught up with the captured commit index.
        for (ticket, index) in out.reads_ready {
            if let Some(tx) = self.waiters.reads.remove(&ticket) {
                if index <= self.fsm.last_applied() {
                    let _ = tx.send(Ok(()));
                } else {
                    self.waiters.read_applies.push((index, tx));
                }
            }
        }
        for (ticket, leader) in out.reads_failed {
            if let Some(tx) = self.waiters.reads.remove(&ticket) {
                let _ = tx.send(Err(RaftError::NotLeader { leader }));
            }
        }
        let applied = self.fsm.last_applied();
        let mut still_waiting = Vec::new();
        for (index, tx) in std::mem::take(&mut self.waiters.read_applies) {
            if index <= applied {
                let _ = tx.send(Ok(()));
            } else {
                still_waiting.push((index, tx));
            }
        }
        self.waiters.read_applies = still_waiting;

        // 7. Configuration change and stepdown outcomes.
        if let Some(result) = out.conf_change_result {
            if let Some(tx) = self.waiters.conf_change.take() {
                let _ = tx.send(result);
            }
        }
        if let Some(result) = out.stepdown_result {
            if let Some(tx) = self.waiters.stepdown.take() {
                let _ = tx.send(result);
            }
        }

        Ok(())
    }

    /// Settle promises registered at this entry's index for the given
    /// phase. A waiter whose term does not match was overwritten.
    fn resolve_entry_waiters(&mut self, entry: &LogEntry, phase: WaitType) {
        let Some(waiters) = self.waiters.entries.remove(&entry.index) else {
            return;
        };
        let mut keep = Vec::new();
        for w in waiters {
            if w.term != entry.term {
                let _ = w.tx.send(Err(RaftError::DroppedEntry));
            } else if w.wait == phase {
                let _ = w.tx.send(Ok(()));
            } else {
                keep.push(w);
            }
        }
        if !keep.is_empty() {
            self.waiters.entries.insert(entry.index, keep);
        }
    }

    fn refresh_status(&self) {
        let mut status = self.status.write();
        status.role = self.fsm.role();
        status.term = self.fsm.current_term();
        status.leader = self.fsm.leader_hint();
        status.configuration = self.fsm.configuration().clone();
        status.last_log = self.fsm.last_log_idx_term();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::AlwaysAlive;
    use crate::persistence::MemoryPersistence;
    use crate::rpc::mock::CapturingRpc;
    use std::time::Duration;

    struct NullStateMachine;

    #[async_trait::async_trait]
    impl StateMachine for NullStateMachine {
        async fn apply(&mut self, _entries: &[LogEntry]) {}

        async fn take_snapshot(&mut self) -> Vec<u8> {
            Vec::new()
        }

        async fn load_snapshot(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn single_node_seed(id: ServerId) -> Configuration {
        Configuration::simple([ServerAddress::new(id, Vec::new())].into_iter().collect())
    }

    async fn start_single(id: ServerId) -> RaftServer {
        let persistence =
            MemoryPersistence::with_seed_configuration(single_node_seed(id)).unwrap();
        RaftServer::start(
            id,
            RaftOptions {
                tick_interval: Duration::from_millis(5),
                election_seed: Some(1),
                ..Default::default()
            },
            Arc::new(CapturingRpc::default()),
            Arc::new(persistence),
            Arc::new(AlwaysAlive),
            Box::new(NullStateMachine),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn single_node_becomes_leader_and_accepts_entries() {
        let id = ServerId::random();
        let server = start_single(id).await;

        server.wait_election_done().await;
        assert!(server.is_leader());

        server
            .add_entry(b"hello".to_vec(), WaitType::Committed)
            .await
            .unwrap();
        server
            .add_entry(b"world".to_vec(), WaitType::Applied)
            .await
            .unwrap();

        server.abort().await;
    }

    #[tokio::test]
    async fn calls_after_abort_fail_with_stopped() {
        let id = ServerId::random();
        let server = start_single(id).await;
        server.abort().await;

        let err = server
            .add_entry(b"x".to_vec(), WaitType::Committed)
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::Stopped));

        let err = server.read_barrier().await.unwrap_err();
        assert!(matches!(err, RaftError::Stopped));
    }

    #[tokio::test]
    async fn start_requires_a_seed_configuration() {
        let id = ServerId::random();
        let result = RaftServer::start(
            id,
            RaftOptions::default(),
            Arc::new(CapturingRpc::default()),
            Arc::new(MemoryPersistence::new()),
            Arc::new(AlwaysAlive),
            Box::new(NullStateMachine),
        )
        .await;
        assert!(matches!(
            result.err(),
            Some(RaftError::InvalidConfiguration(_))
        ));
    }
}
