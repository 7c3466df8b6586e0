//! Failure detection seam.
//!
//! The detector's ping cadence and timeout policy live outside the
//! crate. The server samples it once per tick: a leader skips payload
//! and snapshot sends to dead peers and steps down preemptively when a
//! live quorum has been missing for a full election timeout.

use crate::types::ServerId;
use parking_lot::RwLock;
use std::collections::BTreeSet;

/// Liveness oracle for group members.
pub trait FailureDetector: Send + Sync {
    fn is_alive(&self, id: ServerId) -> bool;
}

/// Detector that considers every peer alive. The protocol timeouts still
/// handle failures; this merely disables the send-suppression hints.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAlive;

impl FailureDetector for AlwaysAlive {
    fn is_alive(&self, _id: ServerId) -> bool {
        true
    }
}

/// Detector whose verdicts are set explicitly; useful for tests and for
/// wiring an external membership service.
#[derive(Debug, Default)]
pub struct StaticFailureDetector {
    dead: RwLock<BTreeSet<ServerId>>,
}

impl StaticFailureDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dead(&self, id: ServerId) {
        self.dead.write().insert(id);
    }

    pub fn mark_alive(&self, id: ServerId) {
        self.dead.write().remove(&id);
    }
}

impl FailureDetector for StaticFailureDetector {
    fn is_alive(&self, id: ServerId) -> bool {
        !self.dead.read().contains(&id)
    }
}
