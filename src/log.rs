//! The replicated log.
//!
//! [`RaftLog`] keeps the in-memory window of the log: a contiguous run of
//! entries starting at `first_index`, preceded by whatever the latest
//! snapshot already covers. The window supports suffix truncation (when a
//! leader overwrites a conflicting follower suffix) and prefix compaction
//! (when a snapshot replaces the head).

use crate::error::{RaftError, Result};
use crate::membership::Configuration;
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Payload variants carried by a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Opaque user bytes for the state machine.
    ///
    /// Arc-wrapped for O(1) cloning during replication fan-out.
    Command(#[serde(with = "arc_bytes")] Arc<Vec<u8>>),
    /// A full membership set; appending one makes it effective.
    Configuration(Configuration),
    /// Empty entry. A fresh leader appends one to force commit progress
    /// at its own term; configuration changes append one as a trailing
    /// commit-time signal.
    Dummy,
}

/// A single entry in the replicated log, immutable once appended at a
/// given index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term under which the entry was created.
    pub term: Term,
    /// The position of this entry in the log.
    pub index: LogIndex,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn command(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Command(Arc::new(data)),
        }
    }

    pub fn configuration(term: Term, index: LogIndex, configuration: Configuration) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Configuration(configuration),
        }
    }

    pub fn dummy(term: Term, index: LogIndex) -> Self {
        Self {
            term,
            index,
            payload: EntryPayload::Dummy,
        }
    }

    /// Serialized footprint, used to bound append request payloads.
    pub fn payload_bytes(&self) -> usize {
        bincode::serialized_size(self).map(|n| n as usize).unwrap_or(0)
    }

    /// The command bytes, for state machines; `None` for configuration
    /// and dummy entries.
    pub fn command_data(&self) -> Option<&[u8]> {
        match &self.payload {
            EntryPayload::Command(data) => Some(data.as_slice()),
            _ => None,
        }
    }
}

/// Serde helper for `Arc<Vec<u8>>` payloads: serialized as raw bytes,
/// deserialized into a fresh Arc.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// Descriptor of the latest snapshot: everything up to and including
/// `last_included_index` is captured by the opaque state-machine image.
///
/// A fresh cluster is bootstrapped by persisting an index-0 descriptor
/// that carries the seed configuration and an empty image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// The membership in force at `last_included_index`.
    pub configuration: Configuration,
    /// Opaque state-machine image.
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

impl SnapshotDescriptor {
    /// The bootstrap descriptor for a brand-new group.
    pub fn bootstrap(configuration: Configuration) -> Self {
        Self {
            last_included_index: 0,
            last_included_term: 0,
            configuration,
            data: Arc::new(Vec::new()),
        }
    }
}

/// The in-memory log window.
#[derive(Debug, Clone)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    /// Index of the first retained entry.
    first_index: LogIndex,
    /// Term of the entry at `first_index - 1`, recorded at compaction so
    /// consistency checks still work at the window boundary.
    truncated_term: Term,
    /// The latest snapshot. Its `last_included_index` may exceed
    /// `first_index - 1`: trailing retention keeps entries the snapshot
    /// already covers so lagging followers can catch up from the log.
    snapshot: SnapshotDescriptor,
}

impl RaftLog {
    /// Rebuild the log from a snapshot descriptor and the persisted
    /// entries. Entries the snapshot already covers (the trailing window
    /// kept for lagging followers) are skipped; the rest must follow the
    /// snapshot contiguously.
    pub fn new(snapshot: SnapshotDescriptor, entries: Vec<LogEntry>) -> Result<Self> {
        let boundary = snapshot.last_included_index;
        let mut log = Self {
            entries: VecDeque::new(),
            first_index: boundary + 1,
            truncated_term: snapshot.last_included_term,
            snapshot,
        };
        for entry in entries {
            if entry.index <= boundary {
                continue;
            }
            log.append(entry)?;
        }
        Ok(log)
    }

    pub fn last_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            self.first_index - 1
        } else {
            self.first_index + self.entries.len() as u64 - 1
        }
    }

    pub fn last_term(&self) -> Term {
        self.entries.back().map(|e| e.term).unwrap_or(self.truncated_term)
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> &SnapshotDescriptor {
        &self.snapshot
    }

    /// Append one entry; the index must follow the current tail.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(RaftError::Log(format!(
                "expected index {}, got {}",
                expected, entry.index
            )));
        }
        if entry.term < self.last_term() {
            return Err(RaftError::Log(format!(
                "term regression at index {}: {} after {}",
                entry.index,
                entry.term,
                self.last_term()
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    /// Term of the entry at `index`, if known. Index 0 is the sentinel
    /// before the log and always has term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index + 1 == self.first_index {
            return Some(self.truncated_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Entries starting at `start`, bounded by `max_bytes` of payload.
    /// Always yields at least one entry when any is available, so a
    /// single oversized entry still replicates.
    pub fn entries_from(&self, start: LogIndex, max_bytes: usize) -> Vec<LogEntry> {
        if start > self.last_index() {
            return Vec::new();
        }
        let start = start.max(self.first_index);
        let offset = (start - self.first_index) as usize;
        let mut out = Vec::new();
        let mut bytes = 0usize;
        for entry in self.entries.iter().skip(offset) {
            let size = entry.payload_bytes();
            if !out.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            out.push(entry.clone());
        }
        out
    }

    /// Entries in the inclusive range `[start, end]`.
    pub fn entries_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        if start > end || start > self.last_index() {
            return Vec::new();
        }
        let start = start.max(self.first_index);
        let offset = (start - self.first_index) as usize;
        self.entries
            .iter()
            .skip(offset)
            .take_while(|e| e.index <= end)
            .cloned()
            .collect()
    }

    /// Drop all entries from `index` (inclusive) onwards. Only legal for
    /// uncommitted indices; the caller enforces that.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index < self.first_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate((index - self.first_index) as usize);
    }

    /// Whether our log matches the leader's consistency proof.
    pub fn matches(&self, prev_index: LogIndex, prev_term: Term) -> bool {
        if prev_index == 0 {
            return true;
        }
        // Anything the snapshot covers was committed and therefore
        // matches by the Log Matching property.
        if prev_index <= self.snapshot.last_included_index {
            return true;
        }
        match self.term_at(prev_index) {
            Some(term) => term == prev_term,
            None => false,
        }
    }

    /// Whether a candidate with the given last entry is at least as
    /// up-to-date as this log (Raft §5.4.1).
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        if last_term != self.last_term() {
            last_term > self.last_term()
        } else {
            last_index >= self.last_index()
        }
    }

    /// Compact the window head up to `up_to` (inclusive). The entry at
    /// `up_to` must be present so the boundary term survives.
    pub fn compact(&mut self, up_to: LogIndex) {
        if up_to < self.first_index || up_to > self.last_index() {
            return;
        }
        let boundary_term = match self.term_at(up_to) {
            Some(t) => t,
            None => return,
        };
        let remove = (up_to - self.first_index + 1) as usize;
        for _ in 0..remove {
            self.entries.pop_front();
        }
        self.first_index = up_to + 1;
        self.truncated_term = boundary_term;
    }

    /// Record a freshly taken local snapshot. The log window is left
    /// intact; the caller compacts separately to keep a trailing run.
    pub fn set_snapshot(&mut self, snapshot: SnapshotDescriptor) {
        self.snapshot = snapshot;
    }

    /// Install a snapshot received from the leader. If the log already
    /// has the entry the snapshot ends at (same index and term), the
    /// suffix beyond it is retained; otherwise the whole window is
    /// replaced. Returns whether the suffix survived.
    pub fn install_snapshot(&mut self, snapshot: SnapshotDescriptor) -> bool {
        let idx = snapshot.last_included_index;
        let matching_suffix =
            self.term_at(idx) == Some(snapshot.last_included_term) && idx >= self.first_index;
        if matching_suffix {
            self.compact(idx);
        } else {
            self.entries.clear();
            self.first_index = idx + 1;
            self.truncated_term = snapshot.last_included_term;
        }
        self.snapshot = snapshot;
        matching_suffix
    }

    /// The membership currently in force: the newest configuration entry
    /// in the window, or the snapshot's.
    pub fn latest_configuration(&self) -> (Configuration, LogIndex) {
        self.configuration_up_to(self.last_index())
    }

    /// The membership in force at `index`.
    pub fn configuration_up_to(&self, index: LogIndex) -> (Configuration, LogIndex) {
        for entry in self.entries.iter().rev() {
            if entry.index > index {
                continue;
            }
            if let EntryPayload::Configuration(conf) = &entry.payload {
                return (conf.clone(), entry.index);
            }
        }
        (
            self.snapshot.configuration.clone(),
            self.snapshot.last_included_index,
        )
    }
}
