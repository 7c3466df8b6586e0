//! Core identifier types shared across the crate.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raft term number. 0 means "no term yet".
pub type Term = u64;

/// Raft log position. Indexing starts at 1; 0 is the sentinel for
/// "before the log".
pub type LogIndex = u64;

/// Opaque 128-bit identifier of a group participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl ServerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The first uuid group is enough to tell servers apart in logs.
        let s = self.0.to_string();
        write!(f, "{}", &s[..8])
    }
}

/// Address record of a group member: the id plus opaque connection
/// information handed to the transport when the member joins.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddress {
    pub id: ServerId,
    /// Connection info/credentials, interpreted only by the `Rpc` layer.
    #[serde(with = "serde_bytes")]
    pub info: Vec<u8>,
}

impl ServerAddress {
    pub fn new(id: ServerId, info: Vec<u8>) -> Self {
        Self { id, info }
    }
}

/// What a client waits for when submitting an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitType {
    /// Resolve once the entry is committed at the submitted (term, index).
    Committed,
    /// Resolve after the state machine has applied the entry.
    Applied,
}
