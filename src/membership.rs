//! Cluster membership and quorum arithmetic.
//!
//! A configuration is either *simple* (one voter set) or *joint* (the
//! union of an old and a new set during a membership transition). In a
//! joint configuration every quorum decision — votes, commit advancement,
//! read-barrier acknowledgements — requires a majority in **both** sets.

use crate::types::{LogIndex, ServerAddress, ServerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The membership of the group, as recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// The target voter set (C_new while joint).
    pub current: BTreeSet<ServerAddress>,
    /// The outgoing voter set (C_old); present only while joint.
    pub previous: Option<BTreeSet<ServerAddress>>,
}

impl Configuration {
    /// A simple configuration over one voter set.
    pub fn simple(current: BTreeSet<ServerAddress>) -> Self {
        Self {
            current,
            previous: None,
        }
    }

    /// The joint configuration entered when transitioning from `old` to
    /// `new`.
    pub fn joint(old: BTreeSet<ServerAddress>, new: BTreeSet<ServerAddress>) -> Self {
        Self {
            current: new,
            previous: Some(old),
        }
    }

    /// Leave the joint phase, keeping only the target set.
    pub fn leave_joint(&self) -> Self {
        Self {
            current: self.current.clone(),
            previous: None,
        }
    }

    pub fn is_joint(&self) -> bool {
        self.previous.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.previous.as_ref().map_or(true, |p| p.is_empty())
    }

    /// All ids that participate in quorum decisions (union of both sets).
    pub fn voter_ids(&self) -> BTreeSet<ServerId> {
        let mut ids: BTreeSet<ServerId> = self.current.iter().map(|a| a.id).collect();
        if let Some(prev) = &self.previous {
            ids.extend(prev.iter().map(|a| a.id));
        }
        ids
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.current.iter().any(|a| a.id == id)
            || self
                .previous
                .as_ref()
                .map_or(false, |p| p.iter().any(|a| a.id == id))
    }

    /// Whether `id` is a voter of the target set.
    pub fn in_current(&self, id: ServerId) -> bool {
        self.current.iter().any(|a| a.id == id)
    }

    /// Address record for `id`, if it is a member.
    pub fn address_of(&self, id: ServerId) -> Option<&ServerAddress> {
        self.current
            .iter()
            .find(|a| a.id == id)
            .or_else(|| self.previous.as_ref().and_then(|p| p.iter().find(|a| a.id == id)))
    }

    /// Whether the given supporters form a quorum. In a joint
    /// configuration a majority of each component set is required.
    pub fn has_quorum(&self, supporters: &BTreeSet<ServerId>) -> bool {
        set_has_majority(&self.current, supporters)
            && self
                .previous
                .as_ref()
                .map_or(true, |prev| set_has_majority(prev, supporters))
    }

    /// The highest index replicated on a quorum, given each voter's match
    /// index. In a joint configuration this is the minimum of the two
    /// per-set quorum indices, so advancing requires both majorities.
    pub fn quorum_index(&self, index_of: impl Fn(ServerId) -> LogIndex) -> LogIndex {
        let current = set_quorum_index(&self.current, &index_of);
        match &self.previous {
            Some(prev) => current.min(set_quorum_index(prev, &index_of)),
            None => current,
        }
    }
}

fn set_has_majority(set: &BTreeSet<ServerAddress>, supporters: &BTreeSet<ServerId>) -> bool {
    if set.is_empty() {
        return true;
    }
    let votes = set.iter().filter(|a| supporters.contains(&a.id)).count();
    votes >= set.len() / 2 + 1
}

fn set_quorum_index(
    set: &BTreeSet<ServerAddress>,
    index_of: &impl Fn(ServerId) -> LogIndex,
) -> LogIndex {
    if set.is_empty() {
        return LogIndex::MAX;
    }
    let mut indices: Vec<LogIndex> = set.iter().map(|a| index_of(a.id)).collect();
    indices.sort_unstable();
    indices.reverse();
    // The index at position quorum-1 is the highest index that at least a
    // majority of the set has stored.
    indices[set.len() / 2]
}
