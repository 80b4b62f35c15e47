//! Provider records: soft claims that a peer can serve a content key.
//!
//! A provider record is advisory. Peers may advertise keys they no longer
//! hold, so consumers retry other providers on failure. Records expire after
//! [`PROVIDER_TTL`]; the reaper runs opportunistically on access rather than
//! on a timer. Per-key lists are capped, evicting the oldest entry first.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use crate::multihash::Key;
use crate::routing::PeerInfo;

/// How long a provider record remains valid.
pub const PROVIDER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum providers tracked per key.
pub const MAX_PROVIDERS_PER_KEY: usize = 256;

#[derive(Clone, Debug)]
struct ProviderEntry {
    peer: PeerInfo,
    added_at: Instant,
}

/// In-memory provider tracking for the DHT.
#[derive(Debug)]
pub struct ProviderStore {
    entries: HashMap<Key, Vec<ProviderEntry>>,
    ttl: Duration,
}

impl Default for ProviderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderStore {
    pub fn new() -> Self {
        Self::with_ttl(PROVIDER_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Record that `peer` provides `key`. Re-announcing refreshes the entry's
    /// expiry; a full list evicts its oldest entry.
    pub fn add(&mut self, key: &Key, peer: PeerInfo) {
        let now = Instant::now();
        let ttl = self.ttl;
        let entries = self.entries.entry(key.clone()).or_default();
        entries.retain(|e| now.duration_since(e.added_at) < ttl);

        if let Some(existing) = entries.iter_mut().find(|e| e.peer.id == peer.id) {
            existing.peer = peer;
            existing.added_at = now;
            return;
        }
        if entries.len() >= MAX_PROVIDERS_PER_KEY {
            // Entries are appended in arrival order, so the head is oldest.
            entries.remove(0);
        }
        entries.push(ProviderEntry {
            peer,
            added_at: now,
        });
    }

    /// Unexpired providers for `key`, oldest first. Reaps expired entries as
    /// a side effect.
    pub fn get(&mut self, key: &Key) -> Vec<PeerInfo> {
        let now = Instant::now();
        let ttl = self.ttl;
        let providers: Vec<PeerInfo> = match self.entries.get_mut(key) {
            Some(entries) => {
                entries.retain(|e| now.duration_since(e.added_at) < ttl);
                entries.iter().map(|e| e.peer.clone()).collect()
            }
            None => Vec::new(),
        };
        if providers.is_empty() {
            self.entries.remove(key);
        }
        providers
    }

    /// Number of keys with at least one (possibly expired) record.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }
}
