use std::collections::{HashMap, HashSet};

use crate::configuration::ConfigurationId;
use crate::endpoint::{Endpoint, NodeId};
use crate::error::MembershipError;

/// Ordered membership of the current configuration plus the K observer
/// rings derived from it.
///
/// Each ring is an independent total ordering of the member set keyed by
/// `(ring_hash(seed_r, endpoint), endpoint)`. The observers of a member are
/// drawn one per ring from its ring predecessors, skipping members already
/// chosen on earlier rings so that a member of a cluster larger than K
/// always has exactly K distinct observers. The subject relation is the
/// exact inverse, so an observer's monitoring duties and a subject's
/// expected report count always agree.
///
/// Rings are maintained incrementally on add/remove; at the cluster sizes
/// of interest (<= 10^4) the per-ring binary search is noise.
#[derive(Debug, Clone)]
pub struct MembershipView {
    k: usize,
    rings: Vec<Vec<(u64, Endpoint)>>,
    identifiers: HashMap<Endpoint, NodeId>,
    identifiers_seen: HashSet<NodeId>,
    cached_configuration_id: Option<ConfigurationId>,
}

impl MembershipView {
    /// Creates an empty view with `k` rings.
    #[must_use]
    pub fn new(k: usize) -> Self {
        debug_assert!(k > 0);
        Self {
            k,
            rings: vec![Vec::new(); k],
            identifiers: HashMap::new(),
            identifiers_seen: HashSet::new(),
            cached_configuration_id: None,
        }
    }

    /// Builds a view from a full membership listing, as received in a join
    /// response.
    pub fn from_members<I>(k: usize, members: I) -> Result<Self, MembershipError>
    where
        I: IntoIterator<Item = (Endpoint, NodeId)>,
    {
        let mut view = Self::new(k);
        for (endpoint, node_id) in members {
            view.add(endpoint, node_id)?;
        }
        Ok(view)
    }

    /// Number of observer rings.
    #[must_use]
    pub const fn k(&self) -> usize {
        self.k
    }

    /// Number of members in the current configuration.
    #[must_use]
    pub fn size(&self) -> usize {
        self.identifiers.len()
    }

    /// True when the endpoint is a member of the current configuration.
    #[must_use]
    pub fn is_host_present(&self, endpoint: &Endpoint) -> bool {
        self.identifiers.contains_key(endpoint)
    }

    /// True when the identifier was admitted in this or any previous
    /// configuration seen by this node.
    #[must_use]
    pub fn is_identifier_present(&self, node_id: &NodeId) -> bool {
        self.identifiers_seen.contains(node_id)
    }

    /// Admits a member.
    ///
    /// Rejects an endpoint already in the ring and any identifier that was
    /// ever admitted before, matching the join protocol's status codes.
    pub fn add(&mut self, endpoint: Endpoint, node_id: NodeId) -> Result<(), MembershipError> {
        if self.identifiers.contains_key(&endpoint) {
            return Err(MembershipError::HostAlreadyInRing(endpoint));
        }
        if self.identifiers_seen.contains(&node_id) {
            return Err(MembershipError::IdAlreadyInRing(node_id));
        }
        for (ring, entries) in self.rings.iter_mut().enumerate() {
            let key = ring_hash(ring_seed(ring), &endpoint);
            let position = entries
                .binary_search_by(|(entry_key, entry)| (*entry_key, entry).cmp(&(key, &endpoint)))
                .unwrap_err();
            entries.insert(position, (key, endpoint.clone()));
        }
        self.identifiers.insert(endpoint, node_id);
        self.identifiers_seen.insert(node_id);
        self.cached_configuration_id = None;
        Ok(())
    }

    /// Removes a member, returning its identifier. A no-op for endpoints
    /// that are not present.
    pub fn remove(&mut self, endpoint: &Endpoint) -> Option<NodeId> {
        let node_id = self.identifiers.remove(endpoint)?;
        for (ring, entries) in self.rings.iter_mut().enumerate() {
            let key = ring_hash(ring_seed(ring), endpoint);
            if let Ok(position) = entries
                .binary_search_by(|(entry_key, entry)| (*entry_key, entry).cmp(&(key, endpoint)))
            {
                entries.remove(position);
            }
        }
        self.cached_configuration_id = None;
        Some(node_id)
    }

    /// Member endpoints in ring-0 order.
    #[must_use]
    pub fn members(&self) -> Vec<Endpoint> {
        self.rings[0].iter().map(|(_, e)| e.clone()).collect()
    }

    /// Member `(endpoint, identifier)` pairs in ring-0 order, used to stream
    /// the full configuration to joiners.
    #[must_use]
    pub fn member_identifiers(&self) -> Vec<(Endpoint, NodeId)> {
        self.rings[0]
            .iter()
            .map(|(_, e)| (e.clone(), self.identifiers[e]))
            .collect()
    }

    /// Identifier of a current member.
    #[must_use]
    pub fn identifier_of(&self, endpoint: &Endpoint) -> Option<NodeId> {
        self.identifiers.get(endpoint).copied()
    }

    /// Immediate successor of `endpoint` on the given ring; the last member
    /// wraps to the first. This is the raw ring primitive underneath the
    /// observer/subject relation.
    pub fn ring_successor(
        &self,
        endpoint: &Endpoint,
        ring: usize,
    ) -> Result<Endpoint, MembershipError> {
        let entries = &self.rings[ring];
        let position = self.ring_position(endpoint, ring)?;
        Ok(entries[(position + 1) % entries.len()].1.clone())
    }

    /// The K observers monitoring this member, indexed by ring.
    ///
    /// Slot r starts at the immediate ring-r predecessor and walks backwards
    /// past members already chosen for earlier slots, so the slots name
    /// exactly K distinct members whenever the cluster is larger than K and
    /// all |V|-1 other members otherwise. In a view of one the member
    /// observes itself on every ring.
    pub fn observers_of(&self, endpoint: &Endpoint) -> Result<Vec<Endpoint>, MembershipError> {
        let mut positions = Vec::with_capacity(self.k);
        for ring in 0..self.k {
            positions.push(self.ring_position(endpoint, ring)?);
        }
        Ok(self.select_observers(endpoint, &positions))
    }

    /// The K observers a joiner would have after being admitted, computed by
    /// hypothetically inserting it into each ring. Used by join phase 1; the
    /// view itself is not mutated.
    pub fn expected_observers_of(
        &self,
        joiner: &Endpoint,
    ) -> Result<Vec<Endpoint>, MembershipError> {
        if self.identifiers.is_empty() {
            return Err(MembershipError::InvariantViolation(
                "expected observers requested on an empty view".to_string(),
            ));
        }
        let mut positions = Vec::with_capacity(self.k);
        for (ring, entries) in self.rings.iter().enumerate() {
            let key = ring_hash(ring_seed(ring), joiner);
            let position = entries
                .binary_search_by(|(entry_key, entry)| (*entry_key, entry).cmp(&(key, joiner)))
                .unwrap_or_else(|insertion| insertion);
            positions.push(position);
        }
        Ok(self.select_observers_hypothetical(joiner, &positions))
    }

    /// The monitoring duties of this member as `(ring, subject)` pairs: the
    /// exact inverse of [`observers_of`](Self::observers_of) across the
    /// whole view.
    pub fn subjects_of(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Vec<(u32, Endpoint)>, MembershipError> {
        if !self.is_host_present(endpoint) {
            return Err(MembershipError::NodeNotInRing(endpoint.clone()));
        }
        let mut subjects = Vec::new();
        for (_, member) in &self.rings[0] {
            let observers = self.observers_of(member)?;
            for (ring, observer) in observers.iter().enumerate() {
                if observer == endpoint {
                    subjects.push((ring as u32, member.clone()));
                }
            }
        }
        Ok(subjects)
    }

    /// Digest identifying the current configuration. Memoised per view and
    /// invalidated on mutation; a pure function of the member identifiers.
    pub fn configuration_id(&mut self) -> ConfigurationId {
        if let Some(id) = self.cached_configuration_id {
            return id;
        }
        let id = ConfigurationId::from_identifiers(self.identifiers.values().copied());
        self.cached_configuration_id = Some(id);
        id
    }

    fn ring_position(&self, endpoint: &Endpoint, ring: usize) -> Result<usize, MembershipError> {
        let key = ring_hash(ring_seed(ring), endpoint);
        self.rings[ring]
            .binary_search_by(|(entry_key, entry)| (*entry_key, entry).cmp(&(key, endpoint)))
            .map_err(|_| MembershipError::NodeNotInRing(endpoint.clone()))
    }

    // `positions[r]` is the member's own index on ring r; candidates are the
    // len-1 other members walked backwards from it.
    fn select_observers(&self, endpoint: &Endpoint, positions: &[usize]) -> Vec<Endpoint> {
        let mut chosen: HashSet<&Endpoint> = HashSet::with_capacity(self.k);
        let mut slots = Vec::with_capacity(self.k);
        for (ring, &position) in positions.iter().enumerate() {
            let entries = &self.rings[ring];
            let len = entries.len();
            let fallback = &entries[(position + len - 1) % len].1;
            let mut pick = fallback;
            for step in 1..len {
                let candidate = &entries[(position + len - step) % len].1;
                if candidate != endpoint && !chosen.contains(candidate) {
                    pick = candidate;
                    break;
                }
            }
            chosen.insert(pick);
            slots.push(pick.clone());
        }
        slots
    }

    // `positions[r]` is the joiner's hypothetical insertion index on ring r;
    // every existing entry is a candidate.
    fn select_observers_hypothetical(
        &self,
        joiner: &Endpoint,
        positions: &[usize],
    ) -> Vec<Endpoint> {
        let mut chosen: HashSet<&Endpoint> = HashSet::with_capacity(self.k);
        let mut slots = Vec::with_capacity(self.k);
        for (ring, &position) in positions.iter().enumerate() {
            let entries = &self.rings[ring];
            let len = entries.len();
            let fallback = &entries[(position + len - 1) % len].1;
            let mut pick = fallback;
            for step in 1..=len {
                let candidate = &entries[(position + len - step) % len].1;
                if candidate != joiner && !chosen.contains(candidate) {
                    pick = candidate;
                    break;
                }
            }
            chosen.insert(pick);
            slots.push(pick.clone());
        }
        slots
    }
}

/// Seed for ring `ring`; a compiled-in sequence, identical on every node.
fn ring_seed(ring: usize) -> u64 {
    // splitmix64 over the ring index keeps the seeds distinct without
    // shipping a table.
    let mut z = (ring as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Stable seeded hash of an endpoint, shared by every node so all rings
/// agree on the same orderings.
fn ring_hash(seed: u64, endpoint: &Endpoint) -> u64 {
    const FNV_PRIME: u64 = 0x1000_0000_01b3;
    let mut hash = seed ^ 0xcbf2_9ce4_8422_2325;
    for byte in endpoint.host.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    for byte in endpoint.port.to_le_bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    const K: usize = 10;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1", port)
    }

    fn populated_view(n: u16) -> MembershipView {
        let mut view = MembershipView::new(K);
        for port in 0..n {
            view.add(endpoint(5000 + port), NodeId::generate()).unwrap();
        }
        view
    }

    #[test]
    fn single_member_observes_itself_on_every_ring() {
        let view = populated_view(1);
        let only = endpoint(5000);
        let observers = view.observers_of(&only).unwrap();
        assert_eq!(observers.len(), K);
        assert!(observers.iter().all(|o| *o == only));
        let subjects = view.subjects_of(&only).unwrap();
        assert_eq!(subjects.len(), K);
        assert!(subjects.iter().all(|(_, s)| *s == only));
    }

    #[test]
    fn large_view_yields_k_distinct_observers() {
        let view = populated_view(100);
        for port in 0..100 {
            let member = endpoint(5000 + port);
            let observers = view.observers_of(&member).unwrap();
            assert_eq!(observers.len(), K);
            let distinct: HashSet<_> = observers.iter().collect();
            assert_eq!(distinct.len(), K, "observers of {member} collide");
            assert!(!observers.contains(&member));
        }
    }

    #[test]
    fn small_view_observers_cover_all_other_members() {
        let view = populated_view(4);
        for port in 0..4 {
            let member = endpoint(5000 + port);
            let observers = view.observers_of(&member).unwrap();
            assert_eq!(observers.len(), K);
            let distinct: HashSet<_> = observers.iter().cloned().collect();
            assert_eq!(distinct.len(), 3);
            assert!(!distinct.contains(&member));
        }
    }

    #[test]
    fn subjects_invert_the_observer_relation() {
        let view = populated_view(20);
        for port in 0..20 {
            let member = endpoint(5000 + port);
            for (ring, subject) in view.subjects_of(&member).unwrap() {
                let observers = view.observers_of(&subject).unwrap();
                assert_eq!(observers[ring as usize], member);
            }
        }
        // Every member is monitored through exactly K slots in total.
        let mut slots_per_subject: HashMap<Endpoint, usize> = HashMap::new();
        for port in 0..20 {
            for (_, subject) in view.subjects_of(&endpoint(5000 + port)).unwrap() {
                *slots_per_subject.entry(subject).or_insert(0) += 1;
            }
        }
        for port in 0..20 {
            assert_eq!(slots_per_subject[&endpoint(5000 + port)], K);
        }
    }

    #[test]
    fn rings_are_permutations_of_the_member_set() {
        let view = populated_view(25);
        let members: HashSet<_> = view.members().into_iter().collect();
        assert_eq!(members.len(), 25);
        for ring in 0..K {
            let ordering: Vec<_> = view.rings[ring].iter().map(|(_, e)| e.clone()).collect();
            assert_eq!(ordering.len(), 25);
            assert_eq!(ordering.iter().cloned().collect::<HashSet<_>>(), members);
        }
    }

    #[test]
    fn rings_disagree_on_order() {
        let view = populated_view(50);
        let first: Vec<_> = view.rings[0].iter().map(|(_, e)| e.clone()).collect();
        let differing = (1..K).filter(|ring| {
            let other: Vec<_> = view.rings[*ring].iter().map(|(_, e)| e.clone()).collect();
            other != first
        });
        assert!(differing.count() > 0, "all rings produced identical orders");
    }

    #[test]
    fn add_rejects_duplicate_host_and_identifier() {
        let mut view = populated_view(3);
        let err = view.add(endpoint(5000), NodeId::generate()).unwrap_err();
        assert!(matches!(err, MembershipError::HostAlreadyInRing(_)));

        let seen = view.identifier_of(&endpoint(5001)).unwrap();
        let err = view.add(endpoint(6000), seen).unwrap_err();
        assert!(matches!(err, MembershipError::IdAlreadyInRing(_)));
    }

    #[test]
    fn identifier_stays_rejected_after_removal() {
        let mut view = populated_view(3);
        let removed = endpoint(5001);
        let id = view.remove(&removed).unwrap();
        assert!(!view.is_host_present(&removed));
        let err = view.add(removed, id).unwrap_err();
        assert!(matches!(err, MembershipError::IdAlreadyInRing(_)));
    }

    #[test]
    fn remove_is_noop_for_absent_endpoint() {
        let mut view = populated_view(3);
        assert!(view.remove(&endpoint(9999)).is_none());
        assert_eq!(view.size(), 3);
    }

    #[test]
    fn expected_observers_match_observers_after_admission() {
        let mut view = populated_view(30);
        let joiner = endpoint(7777);
        let expected = view.expected_observers_of(&joiner).unwrap();
        view.add(joiner.clone(), NodeId::generate()).unwrap();
        let actual = view.observers_of(&joiner).unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn configuration_id_is_a_pure_function_of_identifiers() {
        let mut left = MembershipView::new(K);
        let mut right = MembershipView::new(K);
        let members: Vec<_> = (0..8)
            .map(|port| (endpoint(5000 + port), NodeId::generate()))
            .collect();
        for (e, id) in &members {
            left.add(e.clone(), *id).unwrap();
        }
        for (e, id) in members.iter().rev() {
            right.add(e.clone(), *id).unwrap();
        }
        assert_eq!(left.configuration_id(), right.configuration_id());
        assert_eq!(left.configuration_id(), left.configuration_id());
    }

    #[test]
    fn configuration_id_changes_on_mutation() {
        let mut view = populated_view(5);
        let before = view.configuration_id();
        view.remove(&endpoint(5002));
        assert_ne!(before, view.configuration_id());
    }

    #[test]
    fn successor_wraps_around_the_ring() {
        let view = populated_view(4);
        for ring in 0..K {
            let ordering: Vec<_> = view.rings[ring].iter().map(|(_, e)| e.clone()).collect();
            let last = ordering.last().unwrap();
            assert_eq!(view.ring_successor(last, ring).unwrap(), ordering[0]);
        }
    }
}
