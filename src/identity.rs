//! Repo identity: the process-lifetime identity of a single synchronizer instance.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerKind {
    User,
    Service,
}

/// Identity of a repo (our own, or a remote peer's once established).
///
/// `peer_id` is carried as a string on the wire but compared numerically
/// where possible — the handshake tie-break (§4.4) and directory/sync
/// ordering both need a total order over peer ids, and IDs are
/// conventionally small decimal integers minted by whichever process
/// creates the repo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoIdentity {
    pub peer_id: String,
    pub name: String,
    pub kind: PeerKind,
}

impl RepoIdentity {
    pub fn new(peer_id: impl Into<String>, name: impl Into<String>, kind: PeerKind) -> Self {
        Self {
            peer_id: peer_id.into(),
            name: name.into(),
            kind,
        }
    }

    /// Total order over peer ids: numeric comparison when both ids parse
    /// as `u64`, falling back to lexicographic comparison otherwise so the
    /// ordering stays total even for non-numeric ids used in tests.
    pub fn id_cmp(a: &str, b: &str) -> Ordering {
        match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => a.cmp(b),
        }
    }

    pub fn sorts_before(&self, other: &str) -> bool {
        Self::id_cmp(&self.peer_id, other) == Ordering::Less
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_compare_numerically_not_lexically() {
        assert_eq!(RepoIdentity::id_cmp("9", "10"), Ordering::Less);
        assert_eq!(RepoIdentity::id_cmp("10", "9"), Ordering::Greater);
    }

    #[test]
    fn non_numeric_ids_fall_back_to_lexicographic() {
        assert_eq!(RepoIdentity::id_cmp("alice", "bob"), Ordering::Less);
    }
}
