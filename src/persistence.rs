//! Durable storage seam.
//!
//! The concrete backend (disk layout, key-value store) lives outside the
//! crate; the server only needs the operations below. Every `store_*` and
//! `truncate_*` call must be durable before it returns: the server sends
//! messages that cite the stored state immediately afterwards.

use crate::error::Result;
use crate::log::{LogEntry, SnapshotDescriptor};
use crate::membership::Configuration;
use crate::types::{LogIndex, ServerId, Term};
use async_trait::async_trait;
use parking_lot::Mutex;

/// Persistent state operations of a single participant.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Overwrite the term/vote record.
    async fn store_term_vote(&self, term: Term, voted_for: Option<ServerId>) -> Result<()>;

    /// Append entries to the log. Indices are contiguous with what is
    /// already stored.
    async fn store_log_entries(&self, entries: &[LogEntry]) -> Result<()>;

    /// Overwrite the snapshot record.
    async fn store_snapshot(&self, snapshot: &SnapshotDescriptor) -> Result<()>;

    /// Drop stored entries with `index <= up_to` (log head compaction).
    async fn truncate_log_prefix(&self, up_to: LogIndex) -> Result<()>;

    /// Drop stored entries with `index >= from` (conflict repair).
    async fn truncate_log_suffix(&self, from: LogIndex) -> Result<()>;

    async fn load_term_vote(&self) -> Result<Option<(Term, Option<ServerId>)>>;

    /// All entries after the snapshot, in index order.
    async fn load_log(&self) -> Result<Vec<LogEntry>>;

    async fn load_snapshot(&self) -> Result<Option<SnapshotDescriptor>>;
}

#[derive(Default)]
struct MemoryState {
    term_vote: Option<Vec<u8>>,
    log: Vec<Vec<u8>>,
    /// Index of the first element of `log`.
    log_offset: LogIndex,
    snapshot: Option<Vec<u8>>,
}

/// In-memory [`Persistence`] for tests, simulations and embedders that
/// accept losing state on restart.
///
/// Everything is stored as encoded bytes and decoded on load, so the
/// serialization path is exercised exactly like a real backend would.
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                log_offset: 1,
                ..Default::default()
            }),
        }
    }

    /// Bootstrap storage for the first start of a fresh group: an
    /// index-0 snapshot carrying the seed configuration.
    pub fn with_seed_configuration(configuration: Configuration) -> Result<Self> {
        let this = Self::new();
        let descriptor = SnapshotDescriptor::bootstrap(configuration);
        {
            let mut state = this.state.lock();
            state.snapshot = Some(bincode::serialize(&descriptor)?);
        }
        Ok(this)
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn store_term_vote(&self, term: Term, voted_for: Option<ServerId>) -> Result<()> {
        let bytes = bincode::serialize(&(term, voted_for))?;
        self.state.lock().term_vote = Some(bytes);
        Ok(())
    }

    async fn store_log_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let mut state = self.state.lock();
        for entry in entries {
            let expected = state.log_offset + state.log.len() as u64;
            if entry.index != expected {
                return Err(crate::error::RaftError::Log(format!(
                    "non-contiguous store: expected {}, got {}",
                    expected, entry.index
                )));
            }
            state.log.push(bincode::serialize(entry)?);
        }
        Ok(())
    }

    async fn store_snapshot(&self, snapshot: &SnapshotDescriptor) -> Result<()> {
        let bytes = bincode::serialize(snapshot)?;
        self.state.lock().snapshot = Some(bytes);
        Ok(())
    }

    async fn truncate_log_prefix(&self, up_to: LogIndex) -> Result<()> {
        let mut state = self.state.lock();
        if up_to < state.log_offset {
            return Ok(());
        }
        let remove = ((up_to - state.log_offset + 1) as usize).min(state.log.len());
        state.log.drain(..remove);
        state.log_offset = up_to + 1;
        Ok(())
    }

    async fn truncate_log_suffix(&self, from: LogIndex) -> Result<()> {
        let mut state = self.state.lock();
        if from < state.log_offset {
            state.log.clear();
            return Ok(());
        }
        let keep = (from - state.log_offset) as usize;
        state.log.truncate(keep);
        Ok(())
    }

    async fn load_term_vote(&self) -> Result<Option<(Term, Option<ServerId>)>> {
        let state = self.state.lock();
        match &state.term_vote {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    async fn load_log(&self) -> Result<Vec<LogEntry>> {
        let state = self.state.lock();
        state
            .log
            .iter()
            .map(|bytes| bincode::deserialize(bytes).map_err(Into::into))
            .collect()
    }

    async fn load_snapshot(&self) -> Result<Option<SnapshotDescriptor>> {
        let state = self.state.lock();
        match &state.snapshot {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn seed() -> Configuration {
        Configuration::simple(BTreeSet::new())
    }

    #[tokio::test]
    async fn term_vote_round_trip() {
        let store = MemoryPersistence::new();
        assert!(store.load_term_vote().await.unwrap().is_none());

        let id = ServerId::random();
        store.store_term_vote(5, Some(id)).await.unwrap();
        assert_eq!(store.load_term_vote().await.unwrap(), Some((5, Some(id))));

        store.store_term_vote(6, None).await.unwrap();
        assert_eq!(store.load_term_vote().await.unwrap(), Some((6, None)));
    }

    #[tokio::test]
    async fn log_round_trip_and_truncations() {
        let store = MemoryPersistence::new();
        let entries = vec![
            LogEntry::command(1, 1, vec![1]),
            LogEntry::command(1, 2, vec![2]),
            LogEntry::command(2, 3, vec![3]),
            LogEntry::command(2, 4, vec![4]),
        ];
        store.store_log_entries(&entries).await.unwrap();
        assert_eq!(store.load_log().await.unwrap(), entries);

        // Suffix truncation drops 3 and 4.
        store.truncate_log_suffix(3).await.unwrap();
        assert_eq!(store.load_log().await.unwrap().len(), 2);

        // Appends continue from index 3.
        store
            .store_log_entries(&[LogEntry::command(3, 3, vec![9])])
            .await
            .unwrap();
        // Prefix truncation keeps only the tail.
        store.truncate_log_prefix(2).await.unwrap();
        let remaining = store.load_log().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].index, 3);
    }

    #[tokio::test]
    async fn rejects_non_contiguous_store() {
        let store = MemoryPersistence::new();
        let res = store
            .store_log_entries(&[LogEntry::command(1, 5, vec![])])
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let store = MemoryPersistence::new();
        assert!(store.load_snapshot().await.unwrap().is_none());

        let descriptor = SnapshotDescriptor {
            last_included_index: 10,
            last_included_term: 2,
            configuration: seed(),
            data: std::sync::Arc::new(vec![1, 2, 3]),
        };
        store.store_snapshot(&descriptor).await.unwrap();
        assert_eq!(store.load_snapshot().await.unwrap(), Some(descriptor));
    }

    #[tokio::test]
    async fn seeded_store_carries_bootstrap_snapshot() {
        let store = MemoryPersistence::with_seed_configuration(seed()).unwrap();
        let snap = store.load_snapshot().await.unwrap().unwrap();
        assert_eq!(snap.last_included_index, 0);
        assert_eq!(snap.last_included_term, 0);
    }
}
