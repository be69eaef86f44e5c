use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::endpoint::NodeId;

/// 64-bit identity of a configuration, derived deterministically from the
/// set of current member identifiers.
///
/// Two nodes holding the same membership view compute the same value, which
/// is what lets receivers fence stale or future messages without exchanging
/// full member lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigurationId(u64);

impl ConfigurationId {
    /// Digest of an empty configuration; every history starts here.
    pub const ZERO: Self = Self(0xcbf2_9ce4_8422_2325);

    /// Folds the member identifiers into a digest. Order-insensitive: the
    /// identifiers are sorted before folding.
    pub fn from_identifiers<I>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut sorted: Vec<NodeId> = identifiers.into_iter().collect();
        sorted.sort_unstable();
        let mut digest = Self::ZERO.0;
        for id in sorted {
            digest = fold_u128(digest, id.as_u128());
        }
        Self(digest)
    }

    /// Raw digest value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConfigurationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

fn fold_u128(mut digest: u64, value: u128) -> u64 {
    const FNV_PRIME: u64 = 0x1000_0000_01b3;
    for byte in value.to_le_bytes() {
        digest ^= u64::from(byte);
        digest = digest.wrapping_mul(FNV_PRIME);
    }
    digest
}

/// Outcome of comparing two configuration histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationComparison {
    /// Heads match; the nodes are in the same configuration.
    Equal,
    /// The remote history extends the local one; the local side can fast
    /// forward to it.
    FastForwardRight,
    /// The local history extends the remote one; the remote side is behind.
    FastForwardLeft,
    /// The histories share no digest; reconciliation requires a full sync.
    NoCommonAncestor,
    /// Both histories advanced past a common ancestor; a merge is required.
    Merge,
}

/// Append-only log of configuration digests and the membership operations
/// that produced each successor.
///
/// This is a conflict classifier for remote coordination: it answers how two
/// configurations relate, and leaves resolution to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    history: Vec<ConfigurationId>,
    operations: Vec<Vec<NodeId>>,
    identifiers_seen: HashSet<NodeId>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

impl Configuration {
    /// Creates a history holding only the zero digest.
    #[must_use]
    pub fn new() -> Self {
        Self {
            history: vec![ConfigurationId::ZERO],
            operations: Vec::new(),
            identifiers_seen: HashSet::new(),
        }
    }

    /// Latest digest in the history.
    #[must_use]
    pub fn head(&self) -> ConfigurationId {
        *self
            .history
            .last()
            .expect("configuration history is never empty")
    }

    /// Records a batch of membership operations and appends the digest of
    /// the resulting identifier set.
    pub fn record(&mut self, operations: Vec<NodeId>) {
        debug_assert!(!operations.is_empty());
        self.identifiers_seen.extend(operations.iter().copied());
        self.operations.push(operations);
        let digest = ConfigurationId::from_identifiers(self.identifiers_seen.iter().copied());
        self.history.push(digest);
    }

    /// Full digest history, oldest first, for exchanging with a peer.
    #[must_use]
    pub fn history(&self) -> &[ConfigurationId] {
        &self.history
    }

    /// Classifies the relationship between this history and a remote one.
    ///
    /// Walks the remote history from its head backwards looking for the
    /// first digest present locally; that digest is the diverging commit.
    #[must_use]
    pub fn compare(&self, remote: &[ConfigurationId]) -> ConfigurationComparison {
        let Some(&remote_head) = remote.last() else {
            return ConfigurationComparison::NoCommonAncestor;
        };
        if self.head() == remote_head {
            return ConfigurationComparison::Equal;
        }

        let local: HashSet<ConfigurationId> = self.history.iter().copied().collect();
        let Some(diverging) = remote.iter().rev().copied().find(|id| local.contains(id)) else {
            return ConfigurationComparison::NoCommonAncestor;
        };
        if diverging == self.head() {
            ConfigurationComparison::FastForwardRight
        } else if diverging == remote_head {
            ConfigurationComparison::FastForwardLeft
        } else {
            ConfigurationComparison::Merge
        }
    }
}
