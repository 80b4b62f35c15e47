//! Kademlia-style routing table.
//!
//! Peers live in buckets keyed by the common-prefix-length between their
//! 256-bit routing target and the local peer's. Each bucket holds up to `k`
//! peers ordered by recency of last successful contact, least recent first.
//! A full bucket never silently drops the incumbent: [`RoutingTable::add`]
//! surfaces a [`PendingAdd`] so the engine can ping the least-recent peer
//! and only evict it when the ping fails.
//!
//! The table references peers by ID and serialized address; it does not own
//! connections or track liveness itself.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::keys::PeerId;

/// Bucket count: one per bit of the 256-bit routing target.
const BUCKET_COUNT: usize = 256;

/// XOR distance between two routing targets.
pub fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Lexicographic comparison of two XOR distances.
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> Ordering {
    a.cmp(b)
}

/// Bucket index for `other` relative to `local`: the position of the first
/// differing bit. Identical targets land in the last bucket.
pub fn bucket_index(local: &[u8; 32], other: &[u8; 32]) -> usize {
    let dist = xor_distance(local, other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    BUCKET_COUNT - 1
}

/// Contact information for a peer: its ID and a serialized endpoint address.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's identity multihash.
    pub id: PeerId,
    /// Serialized transport address for connecting to this peer.
    pub addr: String,
}

impl PeerInfo {
    pub fn new(id: PeerId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

/// A single bucket: peers in recency order, least recently seen first.
#[derive(Debug, Default, Clone)]
struct Bucket {
    peers: Vec<PeerInfo>,
}

impl Bucket {
    fn position(&self, id: &PeerId) -> Option<usize> {
        self.peers.iter().position(|p| &p.id == id)
    }

    fn touch(&mut self, peer: PeerInfo, k: usize) -> AddOutcome {
        if let Some(pos) = self.position(&peer.id) {
            let mut existing = self.peers.remove(pos);
            existing.addr = peer.addr;
            self.peers.push(existing);
            return AddOutcome::Refreshed;
        }
        if self.peers.len() < k {
            self.peers.push(peer);
            return AddOutcome::Added;
        }
        let least_recent = self
            .peers
            .first()
            .cloned()
            .expect("full bucket is not empty");
        AddOutcome::Full(PendingAdd {
            least_recent,
            newcomer: peer,
        })
    }

    fn refresh(&mut self, id: &PeerId) -> bool {
        if let Some(pos) = self.position(id) {
            let existing = self.peers.remove(pos);
            self.peers.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &PeerId) -> bool {
        if let Some(pos) = self.position(id) {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Result of offering a peer to the table.
#[derive(Debug)]
pub enum AddOutcome {
    /// The peer was inserted at the most-recently-seen end.
    Added,
    /// The peer was already present and moved to the most-recent end.
    Refreshed,
    /// The bucket is full; the engine should ping `least_recent` and apply
    /// the result via [`RoutingTable::apply_ping_result`].
    Full(PendingAdd),
}

/// A deferred bucket update awaiting a liveness probe of the least-recent
/// incumbent.
#[derive(Clone, Debug)]
pub struct PendingAdd {
    pub least_recent: PeerInfo,
    pub newcomer: PeerInfo,
}

/// The per-node routing table.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: PeerId,
    local_target: [u8; 32],
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: PeerId, k: usize) -> Self {
        let local_target = local_id.dht_target();
        Self {
            local_id,
            local_target,
            k,
            buckets: vec![Bucket::default(); BUCKET_COUNT],
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    fn bucket_for(&self, target: &[u8; 32]) -> usize {
        bucket_index(&self.local_target, target)
    }

    /// Offer a peer to the table. The local peer is never inserted.
    pub fn add(&mut self, peer: PeerInfo) -> AddOutcome {
        if peer.id == self.local_id {
            return AddOutcome::Refreshed;
        }
        let idx = self.bucket_for(&peer.id.dht_target());
        self.buckets[idx].touch(peer, self.k)
    }

    /// Apply the outcome of pinging the least-recent incumbent of a full
    /// bucket: alive peers are kept (and refreshed), dead ones are evicted
    /// in favour of the newcomer.
    pub fn apply_ping_result(&mut self, pending: PendingAdd, alive: bool) {
        let idx = self.bucket_for(&pending.least_recent.id.dht_target());
        let bucket = &mut self.buckets[idx];
        if alive {
            bucket.refresh(&pending.least_recent.id);
            return;
        }
        bucket.remove(&pending.least_recent.id);
        if bucket.position(&pending.newcomer.id).is_none() && bucket.peers.len() < self.k {
            bucket.peers.push(pending.newcomer);
        }
    }

    /// Mark a successful interaction with a peer, moving it to the
    /// most-recent end of its bucket.
    pub fn update(&mut self, id: &PeerId) -> bool {
        let idx = self.bucket_for(&id.dht_target());
        self.buckets[idx].refresh(id)
    }

    /// Remove a peer, typically after repeated RPC failures.
    pub fn remove(&mut self, id: &PeerId) -> bool {
        let idx = self.bucket_for(&id.dht_target());
        self.buckets[idx].remove(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        let idx = self.bucket_for(&id.dht_target());
        self.buckets[idx].position(id).is_some()
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerInfo> {
        let idx = self.bucket_for(&id.dht_target());
        self.buckets[idx]
            .position(id)
            .map(|pos| self.buckets[idx].peers[pos].clone())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `n` peers sorted by ascending XOR distance to `target`.
    ///
    /// Equal distances (impossible unless IDs collide) preserve insertion
    /// order because the sort is stable.
    pub fn nearest(&self, target: &[u8; 32], n: usize) -> Vec<PeerInfo> {
        let mut all: Vec<PeerInfo> = self
            .buckets
            .iter()
            .flat_map(|b| b.peers.iter().cloned())
            .collect();
        all.sort_by(|a, b| {
            let da = xor_distance(&a.id.dht_target(), target);
            let db = xor_distance(&b.id.dht_target(), target);
            distance_cmp(&da, &db)
        });
        all.truncate(n);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multihash::Multihash;

    fn peer(tag: &str) -> PeerInfo {
        let id = PeerId(Multihash::sha2_256(tag.as_bytes()));
        PeerInfo::new(id, format!("addr-{tag}"))
    }

    #[test]
    fn xor_distance_and_cmp() {
        let mut a = [0u8; 32];
        a[0] = 0b1010_1010;
        let mut b = [0u8; 32];
        b[0] = 0b0101_0101;
        assert_eq!(xor_distance(&a, &b)[0], 0xff);
        assert_eq!(xor_distance(&a, &a), [0u8; 32]);

        let mut near = [0u8; 32];
        near[5] = 1;
        let mut far = [0u8; 32];
        far[4] = 1;
        assert_eq!(distance_cmp(&near, &far), Ordering::Less);
    }

    #[test]
    fn bucket_index_is_first_differing_bit() {
        let local = [0u8; 32];
        let mut other = [0u8; 32];
        other[0] = 0b1000_0000;
        assert_eq!(bucket_index(&local, &other), 0);
        let mut other = [0u8; 32];
        other[1] = 0b0001_0000;
        assert_eq!(bucket_index(&local, &other), 11);
        assert_eq!(bucket_index(&local, &local), 255);
    }

    #[test]
    fn buckets_never_exceed_capacity() {
        let local = peer("local");
        let mut table = RoutingTable::new(local.id.clone(), 4);
        for i in 0..64 {
            table.add(peer(&format!("peer-{i}")));
        }
        for bucket in &table.buckets {
            assert!(bucket.peers.len() <= 4);
        }
    }

    #[test]
    fn nearest_returns_peers_by_ascending_distance() {
        let local = peer("local");
        let mut table = RoutingTable::new(local.id.clone(), 20);
        let peers: Vec<PeerInfo> = (0..12).map(|i| peer(&format!("peer-{i}"))).collect();
        for p in &peers {
            table.add(p.clone());
        }

        let target = PeerId(Multihash::sha2_256(b"target")).dht_target();
        let nearest = table.nearest(&target, 5);
        assert_eq!(nearest.len(), 5);

        let mut expected = peers.clone();
        expected.sort_by(|a, b| {
            distance_cmp(
                &xor_distance(&a.id.dht_target(), &target),
                &xor_distance(&b.id.dht_target(), &target),
            )
        });
        let expected_ids: Vec<&PeerId> = expected.iter().take(5).map(|p| &p.id).collect();
        let got_ids: Vec<&PeerId> = nearest.iter().map(|p| &p.id).collect();
        assert_eq!(got_ids, expected_ids);
    }

    #[test]
    fn full_bucket_defers_to_ping_result() {
        let local = peer("local");
        let mut table = RoutingTable::new(local.id.clone(), 1);

        // Keep offering peers until two of them collide in a bucket.
        let mut deferred = None;
        for i in 0..256 {
            if let AddOutcome::Full(pending) = table.add(peer(&format!("candidate-{i}"))) {
                deferred = Some(pending);
                break;
            }
        }
        let pending = deferred.expect("two peers share a bucket within 256 tries");
        let incumbent = pending.least_recent.clone();
        let newcomer = pending.newcomer.clone();

        // Incumbent alive: newcomer is discarded.
        table.apply_ping_result(pending.clone(), true);
        assert!(table.contains(&incumbent.id));
        assert!(!table.contains(&newcomer.id));

        // Incumbent dead: evicted in favour of the newcomer.
        table.apply_ping_result(pending, false);
        assert!(!table.contains(&incumbent.id));
        assert!(table.contains(&newcomer.id));
    }

    #[test]
    fn update_and_remove_touch_recency() {
        let local = peer("local");
        let mut table = RoutingTable::new(local.id.clone(), 20);
        let a = peer("a");
        let b = peer("b");
        table.add(a.clone());
        table.add(b.clone());

        assert!(table.update(&a.id));
        assert!(!table.update(&peer("stranger").id));

        assert!(table.remove(&b.id));
        assert!(!table.contains(&b.id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn local_peer_is_never_inserted() {
        let local = peer("local");
        let mut table = RoutingTable::new(local.id.clone(), 20);
        table.add(local.clone());
        assert!(table.is_empty());
    }
}
