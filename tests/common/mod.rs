//! Deterministic multi-node simulation harness.
//!
//! Drives a set of pure [`Fsm`] cores with an explicit clock and an
//! in-memory message switch, playing the roles of transport, persistence
//! and state machine. Safety invariants (Election Safety, Log Matching,
//! State Machine Safety, monotonicity) are asserted after every pump.

use conclave::fsm::{Fsm, Output};
use conclave::{
    Configuration, LogEntry, LogIndex, Message, RaftError, RaftLog, RaftOptions, ServerAddress,
    ServerId, SnapshotDescriptor, Term,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Stable, readable server ids: byte tag repeated through the uuid.
pub fn sid(tag: u8) -> ServerId {
    ServerId::from_bytes([tag; 16])
}

pub fn addr(tag: u8) -> ServerAddress {
    ServerAddress::new(sid(tag), vec![tag])
}

pub fn member_set(tags: &[u8]) -> BTreeSet<ServerAddress> {
    tags.iter().map(|t| addr(*t)).collect()
}

/// What a node's persistence would hold.
#[derive(Debug, Clone)]
pub struct SimStore {
    pub term: Term,
    pub voted_for: Option<ServerId>,
    pub log: Vec<LogEntry>,
    pub snapshot: SnapshotDescriptor,
}

impl SimStore {
    fn seeded(configuration: Configuration) -> Self {
        Self {
            term: 0,
            voted_for: None,
            log: Vec::new(),
            snapshot: SnapshotDescriptor::bootstrap(configuration),
        }
    }

    fn truncate_suffix(&mut self, from: LogIndex) {
        self.log.retain(|e| e.index < from);
    }

    fn truncate_prefix(&mut self, up_to: LogIndex) {
        self.log.retain(|e| e.index > up_to);
    }
}

/// Toy replicated application: remembers every applied command.
#[derive(Debug, Default, Clone)]
pub struct SimStateMachine {
    pub commands: Vec<Vec<u8>>,
}

impl SimStateMachine {
    fn apply(&mut self, entry: &LogEntry) {
        if let Some(data) = entry.command_data() {
            self.commands.push(data.to_vec());
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        bincode::serialize(&self.commands).unwrap()
    }

    fn restore(&mut self, data: &[u8]) {
        if data.is_empty() {
            self.commands.clear();
        } else {
            self.commands = bincode::deserialize(data).unwrap();
        }
    }

    /// Interpret `k=v` commands as map updates.
    pub fn kv(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for cmd in &self.commands {
            if let Ok(text) = std::str::from_utf8(cmd) {
                if let Some((k, v)) = text.split_once('=') {
                    map.insert(k.to_string(), v.to_string());
                }
            }
        }
        map
    }
}

pub struct SimNode {
    pub fsm: Fsm,
    pub store: SimStore,
    pub sm: SimStateMachine,
    /// Read barriers the core reported ready: `(ticket, index)`.
    pub reads_ready: Vec<(u64, LogIndex)>,
    /// Read barriers that failed, with the leader hint.
    pub reads_failed: Vec<(u64, Option<ServerId>)>,
    prev_term: Term,
    prev_commit: LogIndex,
}

pub struct Cluster {
    pub nodes: BTreeMap<ServerId, SimNode>,
    queue: VecDeque<(ServerId, ServerId, Message)>,
    partitioned: BTreeSet<ServerId>,
    /// term -> the single leader observed at that term.
    leaders_by_term: BTreeMap<Term, ServerId>,
    /// Every entry ever observed committed, by index.
    committed: BTreeMap<LogIndex, LogEntry>,
    /// Pairwise log checks are O(n^2 * len); bulk tests turn them off
    /// and audit once at the end.
    pub audit_logs_every_pump: bool,
}

impl Cluster {
    /// A fresh cluster of the given members, each seeded with the same
    /// bootstrap configuration and a distinct deterministic rng.
    pub fn new(tags: &[u8]) -> Self {
        Self::with_options(tags, |_| RaftOptions::default())
    }

    pub fn with_options(tags: &[u8], mut options_for: impl FnMut(u8) -> RaftOptions) -> Self {
        let configuration = Configuration::simple(member_set(tags));
        let mut nodes = BTreeMap::new();
        for tag in tags {
            let store = SimStore::seeded(configuration.clone());
            let options = RaftOptions {
                election_seed: Some(0xC0FFEE + *tag as u64),
                ..options_for(*tag)
            };
            let log = RaftLog::new(store.snapshot.clone(), Vec::new()).unwrap();
            let fsm = Fsm::new(sid(*tag), options, 0, None, log).unwrap();
            nodes.insert(
                sid(*tag),
                SimNode {
                    fsm,
                    store,
                    sm: SimStateMachine::default(),
                    reads_ready: Vec::new(),
                    reads_failed: Vec::new(),
                    prev_term: 0,
                    prev_commit: 0,
                },
            );
        }
        Self {
            nodes,
            queue: VecDeque::new(),
            partitioned: BTreeSet::new(),
            leaders_by_term: BTreeMap::new(),
            committed: BTreeMap::new(),
            audit_logs_every_pump: true,
        }
    }

    pub fn node(&self, tag: u8) -> &SimNode {
        &self.nodes[&sid(tag)]
    }

    /// Bring up a fresh, empty server that knows the given members as
    /// its seed configuration (the operator hands a joiner the current
    /// cluster layout). It becomes a voter only once a configuration
    /// naming it is appended.
    pub fn add_node(&mut self, tag: u8, known_members: &[u8]) {
        let configuration = Configuration::simple(member_set(known_members));
        let store = SimStore::seeded(configuration);
        let options = RaftOptions {
            election_seed: Some(0xC0FFEE + tag as u64),
            ..RaftOptions::default()
        };
        let log = RaftLog::new(store.snapshot.clone(), Vec::new()).unwrap();
        let fsm = Fsm::new(sid(tag), options, 0, None, log).unwrap();
        self.nodes.insert(
            sid(tag),
            SimNode {
                fsm,
                store,
                sm: SimStateMachine::default(),
                reads_ready: Vec::new(),
                reads_failed: Vec::new(),
                prev_term: 0,
                prev_commit: 0,
            },
        );
    }

    pub fn fsm(&self, tag: u8) -> &Fsm {
        &self.node(tag).fsm
    }

    pub fn partition(&mut self, tag: u8) {
        self.partitioned.insert(sid(tag));
    }

    pub fn heal(&mut self, tag: u8) {
        self.partitioned.remove(&sid(tag));
    }

    /// Drop everything still in flight (used with partitions to model
    /// message loss at the cut).
    pub fn drop_in_flight(&mut self) {
        self.queue.clear();
    }

    pub fn leader(&self) -> Option<ServerId> {
        let leaders: Vec<ServerId> = self
            .nodes
            .iter()
            .filter(|(id, n)| n.fsm.role().is_leader() && !self.partitioned.contains(id))
            .map(|(id, _)| *id)
            .collect();
        assert!(leaders.len() <= 1, "multiple connected leaders: {leaders:?}");
        leaders.into_iter().next()
    }

    pub fn leader_tag(&self) -> Option<u8> {
        self.leader().map(|id| id.as_bytes()[0])
    }

    /// Advance one logical tick on one node and collect its effects.
    pub fn tick(&mut self, tag: u8) {
        if let Some(node) = self.nodes.get_mut(&sid(tag)) {
            node.fsm.tick();
        }
        self.collect_outputs();
    }

    pub fn tick_all(&mut self) {
        let ids: Vec<ServerId> = self.nodes.keys().copied().collect();
        for id in ids {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.fsm.tick();
            }
        }
        self.collect_outputs();
    }

    pub fn elapse_election(&mut self, tag: u8) {
        if let Some(node) = self.nodes.get_mut(&sid(tag)) {
            node.fsm.elapse_election();
        }
    }

    pub fn campaign(&mut self, tag: u8) {
        if let Some(node) = self.nodes.get_mut(&sid(tag)) {
            node.fsm.campaign();
        }
        self.collect_outputs();
    }

    pub fn propose(&mut self, tag: u8, data: &[u8]) -> Result<(Term, LogIndex), RaftError> {
        let result = match self.nodes.get_mut(&sid(tag)) {
            Some(node) => node.fsm.propose(data.to_vec()),
            None => panic!("unknown node {tag}"),
        };
        self.collect_outputs();
        result
    }

    pub fn propose_configuration(
        &mut self,
        tag: u8,
        members: BTreeSet<ServerAddress>,
    ) -> Result<(), RaftError> {
        let result = match self.nodes.get_mut(&sid(tag)) {
            Some(node) => node.fsm.propose_configuration(members),
            None => panic!("unknown node {tag}"),
        };
        self.collect_outputs();
        result
    }

    /// Deliver every queued message (and whatever each delivery
    /// produces) until the network is quiet.
    pub fn pump(&mut self) {
        loop {
            self.collect_outputs();
            let Some((from, to, message)) = self.queue.pop_front() else {
                break;
            };
            if self.partitioned.contains(&from) || self.partitioned.contains(&to) {
                continue;
            }
            if let Some(node) = self.nodes.get_mut(&to) {
                node.fsm.step(from, message);
            }
        }
        self.audit();
    }

    /// Deliver only the queued messages from `from` to `to`, leaving the
    /// rest in flight. Lets tests force adversarial interleavings.
    pub fn deliver_pair(&mut self, from: u8, to: u8) {
        let (from, to) = (sid(from), sid(to));
        let mut rest = VecDeque::new();
        while let Some((f, t, message)) = self.queue.pop_front() {
            if f == from && t == to {
                if !self.partitioned.contains(&f) && !self.partitioned.contains(&t) {
                    if let Some(node) = self.nodes.get_mut(&t) {
                        node.fsm.step(f, message);
                    }
                }
            } else {
                rest.push_back((f, t, message));
            }
        }
        self.queue = rest;
        self.collect_outputs();
        self.audit();
    }

    /// Tick everything and pump until the cluster is fully quiescent.
    pub fn settle(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.tick_all();
            self.pump();
        }
    }

    /// Run election rounds until some connected node leads.
    pub fn elect_someone(&mut self, max_rounds: usize) -> u8 {
        for _ in 0..max_rounds {
            if let Some(tag) = self.leader_tag() {
                return tag;
            }
            self.tick_all();
            self.pump();
        }
        match self.leader_tag() {
            Some(tag) => tag,
            None => panic!("no leader elected after {max_rounds} rounds"),
        }
    }

    /// Collect effect batches from every node: persist, route, apply.
    fn collect_outputs(&mut self) {
        let ids: Vec<ServerId> = self.nodes.keys().copied().collect();
        loop {
            let mut progressed = false;
            for id in &ids {
                let out = {
                    let node = self.nodes.get_mut(id).unwrap();
                    if !node.fsm.has_output() {
                        continue;
                    }
                    node.fsm.get_output()
                };
                progressed = true;
                self.apply_output(*id, out);
            }
            if !progressed {
                break;
            }
        }
    }

    fn apply_output(&mut self, id: ServerId, out: Output) {
        let node = self.nodes.get_mut(&id).unwrap();

        // Persistence effects, in batch order.
        if let Some((term, voted_for)) = out.term_vote {
            node.store.term = term;
            node.store.voted_for = voted_for;
        }
        if let Some(from) = out.truncate_log_from {
            node.store.truncate_suffix(from);
        }
        for entry in &out.entries {
            node.store.log.push(entry.clone());
        }
        if let Some(snapshot) = &out.persist_snapshot {
            node.store.snapshot = snapshot.clone();
        }
        if let Some(snapshot) = &out.install_snapshot {
            node.store.snapshot = snapshot.clone();
            node.store.truncate_prefix(snapshot.last_included_index);
            node.sm.restore(&snapshot.data);
        }
        if let Some(up_to) = out.compact_log_to {
            node.store.truncate_prefix(up_to);
        }

        // Apply committed entries and acknowledge the completion.
        if !out.apply.is_empty() {
            for entry in &out.apply {
                node.sm.apply(entry);
            }
            let up_to = out.apply.last().unwrap().index;
            node.fsm.applied(up_to);
        }
        if out.snapshot_needed {
            let image = node.sm.snapshot();
            node.fsm.snapshot_taken(image);
        }
        node.reads_ready.extend(out.reads_ready.iter().copied());
        node.reads_failed.extend(out.reads_failed.iter().copied());

        // Record commits for the safety audit.
        for entry in &out.apply {
            if let Some(existing) = self.committed.get(&entry.index) {
                assert_eq!(
                    (existing.term, &existing.payload),
                    (entry.term, &entry.payload),
                    "two different entries committed at index {}",
                    entry.index
                );
            } else {
                self.committed.insert(entry.index, entry.clone());
            }
        }

        // Route messages.
        for envelope in out.messages {
            self.queue.push_back((id, envelope.to, envelope.message));
        }
    }

    /// Assert the §8 safety invariants over the current state.
    pub fn audit(&mut self) {
        for (id, node) in &mut self.nodes {
            // Monotonicity.
            let term = node.fsm.current_term();
            let commit = node.fsm.commit_index();
            assert!(term >= node.prev_term, "term regressed on {id}");
            assert!(commit >= node.prev_commit, "commit regressed on {id}");
            assert!(node.fsm.last_applied() <= commit);
            node.prev_term = term;
            node.prev_commit = commit;

            // Election Safety: at most one leader ever per term.
            if node.fsm.role().is_leader() {
                let prev = self.leaders_by_term.insert(term, *id);
                if let Some(prev) = prev {
                    assert_eq!(prev, *id, "two leaders in term {term}");
                }
            }
        }

        // Leader Completeness: every leader of a term at or past an
        // entry's commit term holds that entry (a stale leader cut off
        // before the commit is exempt until it learns the new term).
        for (id, node) in &self.nodes {
            if !node.fsm.role().is_leader() {
                continue;
            }
            let log = node.fsm.log();
            for (index, entry) in &self.committed {
                if node.fsm.current_term() < entry.term {
                    continue;
                }
                if *index <= log.snapshot().last_included_index {
                    continue;
                }
                match log.get(*index) {
                    Some(own) => assert_eq!(
                        (own.term, &own.payload),
                        (entry.term, &entry.payload),
                        "leader {id} lost committed entry {index}"
                    ),
                    None => panic!("leader {id} missing committed entry {index}"),
                }
            }
        }

        if self.audit_logs_every_pump {
            self.audit_log_matching();
        }
    }

    /// Log Matching: same (term, index) implies identical entries, on
    /// every pair of nodes.
    pub fn audit_log_matching(&self) {
        let ids: Vec<ServerId> = self.nodes.keys().copied().collect();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                let la = self.nodes[a].fsm.log();
                let lb = self.nodes[b].fsm.log();
                let lo = la.first_index().max(lb.first_index());
                let hi = la.last_index().min(lb.last_index());
                for index in lo..=hi {
                    let (ea, eb) = match (la.get(index), lb.get(index)) {
                        (Some(ea), Some(eb)) => (ea, eb),
                        _ => continue,
                    };
                    if ea.term == eb.term {
                        assert_eq!(
                            ea.payload, eb.payload,
                            "log matching violated at index {index} between {a} and {b}"
                        );
                    }
                }
            }
        }
    }

    /// State Machine Safety: any two applied command sequences are
    /// prefix-comparable.
    pub fn audit_state_machines(&self) {
        let machines: Vec<&SimStateMachine> = self.nodes.values().map(|n| &n.sm).collect();
        for (i, a) in machines.iter().enumerate() {
            for b in &machines[i + 1..] {
                let shorter = a.commands.len().min(b.commands.len());
                assert_eq!(
                    &a.commands[..shorter],
                    &b.commands[..shorter],
                    "state machines diverged"
                );
            }
        }
    }

    /// Rebuild one node from its persisted image, as a crash-restart
    /// would. The state machine restarts from the snapshot alone.
    pub fn restart(&mut self, tag: u8) {
        let id = sid(tag);
        let node = self.nodes.get_mut(&id).unwrap();
        let store = node.store.clone();
        let options = RaftOptions {
            election_seed: Some(0xC0FFEE + tag as u64),
            ..RaftOptions::default()
        };
        let log = RaftLog::new(store.snapshot.clone(), store.log.clone()).unwrap();
        let fsm = Fsm::new(id, options, store.term, store.voted_for, log).unwrap();
        let mut sm = SimStateMachine::default();
        sm.restore(&store.snapshot.data);
        node.fsm = fsm;
        node.sm = sm;
        node.reads_ready.clear();
        node.reads_failed.clear();
        node.prev_term = 0;
        node.prev_commit = 0;
    }
}
