//! The DHT engine: iterative Kademlia queries over an abstract transport.
//!
//! Every lookup drives the same state machine: a shortlist of the `k`
//! closest peers seen so far, up to `alpha` outstanding RPCs at a time,
//! replies merged in arrival order, and termination when a satisfactory
//! result arrives, when the closest peers have all been queried without
//! progress, or when the caller's token or deadline fires. Per-peer
//! failures are transient: they are logged, fed to routing-table eviction,
//! and never surfaced to the caller directly.
//!
//! The engine is transport-agnostic via [`DhtNetwork`], so tests drive it
//! with an in-memory mock while production uses the iroh QUIC transport in
//! [`crate::net`].

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use lru::LruCache;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::keys::PeerId;
use crate::multihash::Key;
use crate::providers::ProviderStore;
use crate::routing::{distance_cmp, xor_distance, AddOutcome, PeerInfo, RoutingTable};

/// Result width and replication factor.
pub const K_VALUE: usize = 20;

/// Lookup concurrency.
pub const ALPHA_VALUE: usize = 3;

/// Per-peer RPC deadline.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(4);

/// Default query deadline when the caller does not set one.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Liveness probe deadline.
pub const PING_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the local record cache.
const RECORD_CACHE_ENTRIES: usize = 100_000;

/// Tunable engine parameters.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    pub rpc_timeout: Duration,
    pub query_timeout: Duration,
    pub ping_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: K_VALUE,
            alpha: ALPHA_VALUE,
            rpc_timeout: RPC_TIMEOUT,
            query_timeout: QUERY_TIMEOUT,
            ping_timeout: PING_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("routing table has no peers")]
    NoPeers,
    #[error("not found")]
    NotFound,
    #[error("query deadline exceeded")]
    Timeout,
    #[error("query cancelled")]
    Cancelled,
    #[error("record failed validation: {0}")]
    ValidationFailed(String),
    #[error("put_value failed on every candidate peer")]
    PutFailed,
    #[error("transient rpc failure: {0}")]
    Transient(String),
}

/// Transport abstraction for the six DHT RPCs.
///
/// Implementations carry their own connection handling; the engine layers
/// deadlines on top and treats any error as a transient per-peer failure.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// Liveness probe.
    async fn ping(&self, to: &PeerInfo) -> Result<()>;

    /// Ask `to` for peers near `target`.
    async fn find_node(&self, to: &PeerInfo, target: Key) -> Result<Vec<PeerInfo>>;

    /// Ask `to` for the value of `key`, or closer peers.
    async fn get_value(&self, to: &PeerInfo, key: Key) -> Result<(Option<Vec<u8>>, Vec<PeerInfo>)>;

    /// Store a record on `to`.
    async fn put_value(&self, to: &PeerInfo, key: Key, value: Vec<u8>) -> Result<()>;

    /// Announce `provider` as serving `key`.
    async fn add_provider(&self, to: &PeerInfo, key: Key, provider: PeerInfo) -> Result<()>;

    /// Ask `to` for providers of `key`; also returns closer peers.
    async fn get_providers(
        &self,
        to: &PeerInfo,
        key: Key,
    ) -> Result<(Vec<PeerInfo>, Vec<PeerInfo>)>;
}

type ValidateFn = Box<dyn Fn(&Key, &[u8]) -> Result<()> + Send + Sync>;
type SelectFn = Box<dyn Fn(&Key, &[Vec<u8>]) -> usize + Send + Sync>;

/// Validation and conflict resolution for one key prefix.
pub struct RecordValidator {
    validate: ValidateFn,
    select: Option<SelectFn>,
}

impl RecordValidator {
    pub fn new(validate: impl Fn(&Key, &[u8]) -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            validate: Box::new(validate),
            select: None,
        }
    }

    pub fn with_selector(
        mut self,
        select: impl Fn(&Key, &[Vec<u8>]) -> usize + Send + Sync + 'static,
    ) -> Self {
        self.select = Some(Box::new(select));
        self
    }
}

/// Pluggable record validation keyed by key prefix (`/pk/`, `/ipns/`).
///
/// Bare multihash keys are content addresses served by providers, not
/// values, so they pass through unvalidated. A namespaced key with no
/// registered validator is rejected outright.
#[derive(Default)]
pub struct ValidatorRegistry {
    by_prefix: std::collections::HashMap<&'static str, RecordValidator>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, prefix: &'static str, validator: RecordValidator) {
        self.by_prefix.insert(prefix, validator);
    }

    pub fn validate(&self, key: &Key, value: &[u8]) -> Result<()> {
        match key.prefix() {
            None => Ok(()),
            Some(prefix) => match self.by_prefix.get(prefix) {
                Some(v) => (v.validate)(key, value),
                None => Err(anyhow!("no validator registered for prefix {prefix}")),
            },
        }
    }

    /// Index of the preferred record among `values`. Defaults to the first.
    pub fn select(&self, key: &Key, values: &[Vec<u8>]) -> usize {
        if values.len() < 2 {
            return 0;
        }
        if let Some(prefix) = key.prefix() {
            if let Some(RecordValidator {
                select: Some(select),
                ..
            }) = self.by_prefix.get(prefix)
            {
                return (select)(key, values).min(values.len() - 1);
            }
        }
        0
    }
}

enum ProbeReply<T> {
    /// The peer answered with closer peers only.
    Peers(Vec<PeerInfo>),
    /// The peer answered with a terminal result plus closer peers.
    Found(T, Vec<PeerInfo>),
    /// The peer answered but its payload was rejected; keep searching
    /// without penalizing the peer in the routing table.
    Skip,
}

struct LookupOutcome<T> {
    found: Vec<T>,
    closest: Vec<PeerInfo>,
}

/// Shortlist bookkeeping for one iterative query.
struct LookupState {
    target: [u8; 32],
    local: PeerId,
    k: usize,
    shortlist: Vec<PeerInfo>,
    seen: HashSet<PeerId>,
    queried: HashSet<PeerId>,
}

impl LookupState {
    fn new(target: [u8; 32], seeds: Vec<PeerInfo>, k: usize, local: PeerId) -> Self {
        let mut state = Self {
            target,
            local,
            k,
            shortlist: Vec::new(),
            seen: HashSet::new(),
            queried: HashSet::new(),
        };
        state.merge(seeds);
        state
    }

    /// The nearest un-queried shortlist member, marked queried.
    fn next_candidate(&mut self) -> Option<PeerInfo> {
        let peer = self
            .shortlist
            .iter()
            .find(|p| !self.queried.contains(&p.id))
            .cloned()?;
        self.queried.insert(peer.id.clone());
        Some(peer)
    }

    /// Fold newly discovered peers into the shortlist, truncating to the k
    /// closest. Returns true when the closest known peer got closer.
    fn merge(&mut self, peers: Vec<PeerInfo>) -> bool {
        let best_before = self.best_distance();
        for peer in peers {
            if peer.id == self.local {
                continue;
            }
            if self.seen.insert(peer.id.clone()) {
                self.shortlist.push(peer);
            }
        }
        let target = self.target;
        self.shortlist.sort_by(|a, b| {
            let da = xor_distance(&a.id.dht_target(), &target);
            let db = xor_distance(&b.id.dht_target(), &target);
            distance_cmp(&da, &db)
        });
        self.shortlist.truncate(self.k);
        match (best_before, self.best_distance()) {
            (Some(before), Some(after)) => distance_cmp(&after, &before) == std::cmp::Ordering::Less,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    /// Forget a peer that failed to answer so it cannot linger in the
    /// final closest set.
    fn drop_peer(&mut self, id: &PeerId) {
        self.shortlist.retain(|p| &p.id != id);
    }

    fn best_distance(&self) -> Option<[u8; 32]> {
        self.shortlist
            .first()
            .map(|p| xor_distance(&p.id.dht_target(), &self.target))
    }
}

/// A DHT node: routing table, record cache, provider store, and the
/// transport used to reach other peers.
pub struct Dht<N: DhtNetwork> {
    id: PeerId,
    self_info: PeerInfo,
    config: DhtConfig,
    routing: Arc<RwLock<RoutingTable>>,
    records: Arc<Mutex<LruCache<Key, Vec<u8>>>>,
    providers: Arc<RwLock<ProviderStore>>,
    network: Arc<N>,
    validators: Arc<ValidatorRegistry>,
}

impl<N: DhtNetwork> Clone for Dht<N> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            self_info: self.self_info.clone(),
            config: self.config.clone(),
            routing: self.routing.clone(),
            records: self.records.clone(),
            providers: self.providers.clone(),
            network: self.network.clone(),
            validators: self.validators.clone(),
        }
    }
}

impl<N: DhtNetwork> Dht<N> {
    pub fn new(
        id: PeerId,
        addr: impl Into<String>,
        network: N,
        validators: ValidatorRegistry,
        config: DhtConfig,
    ) -> Self {
        let self_info = PeerInfo::new(id.clone(), addr);
        let cap = NonZeroUsize::new(RECORD_CACHE_ENTRIES).expect("capacity is non-zero");
        Self {
            routing: Arc::new(RwLock::new(RoutingTable::new(id.clone(), config.k))),
            records: Arc::new(Mutex::new(LruCache::new(cap))),
            providers: Arc::new(RwLock::new(ProviderStore::new())),
            network: Arc::new(network),
            validators: Arc::new(validators),
            id,
            self_info,
            config,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn self_info(&self) -> PeerInfo {
        self.self_info.clone()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Record a peer we interacted with. When its bucket is full, the
    /// least-recent incumbent is pinged in the background and only evicted
    /// if the ping fails.
    pub async fn observe_peer(&self, peer: PeerInfo) {
        if peer.id == self.id {
            return;
        }
        let outcome = {
            let mut routing = self.routing.write().await;
            routing.add(peer)
        };
        if let AddOutcome::Full(pending) = outcome {
            let routing = self.routing.clone();
            let network = self.network.clone();
            let ping_timeout = self.config.ping_timeout;
            tokio::spawn(async move {
                let alive = matches!(
                    timeout(ping_timeout, network.ping(&pending.least_recent)).await,
                    Ok(Ok(()))
                );
                if !alive {
                    debug!(peer = %pending.least_recent.id, "evicting unresponsive peer");
                }
                let mut routing = routing.write().await;
                routing.apply_ping_result(pending, alive);
            });
        }
    }

    async fn observe_all(&self, peers: &[PeerInfo]) {
        for peer in peers {
            self.observe_peer(peer.clone()).await;
        }
    }

    async fn get_local(&self, key: &Key) -> Option<Vec<u8>> {
        let mut records = self.records.lock().await;
        records.get(key).cloned()
    }

    /// Store a record locally. When a record for the key already exists the
    /// selector decides which survives, so a stale-but-valid record can
    /// never displace a newer one.
    async fn put_local(&self, key: &Key, value: Vec<u8>) {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(key) {
            let candidates = vec![existing.clone(), value.clone()];
            if self.validators.select(key, &candidates) == 0 {
                return;
            }
        }
        records.put(key.clone(), value);
    }

    // ── Inbound RPC handlers ────────────────────────────────────────────

    pub async fn handle_ping(&self, from: &PeerInfo) {
        self.observe_peer(from.clone()).await;
    }

    pub async fn handle_find_node(&self, from: &PeerInfo, target: &Key) -> Vec<PeerInfo> {
        self.observe_peer(from.clone()).await;
        let routing = self.routing.read().await;
        routing.nearest(&target.dht_target(), self.config.k)
    }

    pub async fn handle_get_value(
        &self,
        from: &PeerInfo,
        key: &Key,
    ) -> (Option<Vec<u8>>, Vec<PeerInfo>) {
        self.observe_peer(from.clone()).await;
        if let Some(value) = self.get_local(key).await {
            return (Some(value), Vec::new());
        }
        let routing = self.routing.read().await;
        (None, routing.nearest(&key.dht_target(), self.config.k))
    }

    /// Validate and store an inbound record. Invalid records are rejected
    /// and never stored.
    pub async fn handle_put_value(
        &self,
        from: &PeerInfo,
        key: &Key,
        value: Vec<u8>,
    ) -> Result<()> {
        self.observe_peer(from.clone()).await;
        if let Err(err) = self.validators.validate(key, &value) {
            warn!(key = %key, from = %from.id, "rejecting invalid record: {err:#}");
            return Err(err);
        }
        self.put_local(key, value).await;
        Ok(())
    }

    pub async fn handle_add_provider(&self, from: &PeerInfo, key: &Key, provider: PeerInfo) {
        self.observe_peer(from.clone()).await;
        trace!(key = %key, provider = %provider.id, "provider record added");
        let mut providers = self.providers.write().await;
        providers.add(key, provider);
    }

    pub async fn handle_get_providers(
        &self,
        from: &PeerInfo,
        key: &Key,
    ) -> (Vec<PeerInfo>, Vec<PeerInfo>) {
        self.observe_peer(from.clone()).await;
        let provs = {
            let mut providers = self.providers.write().await;
            providers.get(key)
        };
        let routing = self.routing.read().await;
        let closer = routing.nearest(&key.dht_target(), self.config.k);
        (provs, closer)
    }

    // ── Iterative query driver ──────────────────────────────────────────

    /// Drive one iterative query: keep up to `alpha` probes in flight,
    /// merge replies in arrival order, and stop when a terminal result has
    /// arrived, when `alpha` consecutive replies made no progress, or when
    /// the candidate set is exhausted.
    async fn run_lookup<T, F, Fut>(
        &self,
        target: [u8; 32],
        seeds: Vec<PeerInfo>,
        token: &CancellationToken,
        mut probe: F,
    ) -> Result<LookupOutcome<T>, DhtError>
    where
        F: FnMut(PeerInfo) -> Fut,
        Fut: std::future::Future<Output = Result<ProbeReply<T>>>,
    {
        let alpha = self.config.alpha.max(1);
        let mut state = LookupState::new(target, seeds, self.config.k, self.id.clone());
        let mut pending = FuturesUnordered::new();
        let mut found = Vec::new();
        let mut stalled = 0usize;

        loop {
            if token.is_cancelled() {
                return Err(DhtError::Cancelled);
            }
            while pending.len() < alpha && found.is_empty() && stalled < alpha {
                let Some(peer) = state.next_candidate() else {
                    break;
                };
                let fut = probe(peer.clone());
                pending.push(async move { (peer, fut.await) });
            }
            if pending.is_empty() {
                break;
            }

            let (peer, result) = tokio::select! {
                _ = token.cancelled() => return Err(DhtError::Cancelled),
                Some(done) = pending.next() => done,
            };

            match result {
                Ok(ProbeReply::Found(value, closer)) => {
                    self.observe_all(&closer).await;
                    state.merge(closer);
                    found.push(value);
                }
                Ok(ProbeReply::Peers(closer)) => {
                    self.observe_all(&closer).await;
                    {
                        let mut routing = self.routing.write().await;
                        routing.update(&peer.id);
                    }
                    if state.merge(closer) {
                        stalled = 0;
                    } else {
                        stalled += 1;
                    }
                }
                Ok(ProbeReply::Skip) => {
                    stalled += 1;
                }
                Err(err) => {
                    debug!(peer = %peer.id, "query rpc failed: {err:#}");
                    state.drop_peer(&peer.id);
                    let mut routing = self.routing.write().await;
                    routing.remove(&peer.id);
                }
            }
        }

        Ok(LookupOutcome {
            found,
            closest: state.shortlist,
        })
    }

    async fn seeds_for(&self, target: &[u8; 32]) -> Vec<PeerInfo> {
        let routing = self.routing.read().await;
        routing.nearest(target, self.config.k)
    }

    /// Iteratively locate the k closest peers to `key`.
    pub async fn closest_peers(
        &self,
        key: &Key,
        token: &CancellationToken,
    ) -> Result<Vec<PeerInfo>, DhtError> {
        let target = key.dht_target();
        let seeds = self.seeds_for(&target).await;
        if seeds.is_empty() {
            return Err(DhtError::NoPeers);
        }
        let network = self.network.clone();
        let rpc_timeout = self.config.rpc_timeout;
        let key = key.clone();
        let lookup = self.run_lookup::<(), _, _>(target, seeds, token, move |peer| {
            let network = network.clone();
            let key = key.clone();
            async move {
                match timeout(rpc_timeout, network.find_node(&peer, key)).await {
                    Ok(Ok(peers)) => Ok(ProbeReply::Peers(peers)),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(anyhow!("rpc deadline exceeded")),
                }
            }
        });
        let outcome = timeout(self.config.query_timeout, lookup)
            .await
            .map_err(|_| DhtError::Timeout)??;
        Ok(outcome.closest)
    }

    // ── Public operations ───────────────────────────────────────────────

    /// Store a record on the k closest peers to `key`.
    ///
    /// Succeeds if any peer accepted the record; partial propagation is
    /// logged, not surfaced. A node with an empty routing table stores the
    /// record locally only.
    pub async fn put_value(
        &self,
        key: &Key,
        value: Vec<u8>,
        token: &CancellationToken,
    ) -> Result<(), DhtError> {
        self.validators
            .validate(key, &value)
            .map_err(|e| DhtError::ValidationFailed(e.to_string()))?;
        self.put_local(key, value.clone()).await;

        let closest = match self.closest_peers(key, token).await {
            Ok(peers) => peers,
            Err(DhtError::NoPeers) => {
                warn!(key = %key, "no peers to replicate record to");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let sends = closest.iter().take(self.config.k).map(|peer| {
            let network = self.network.clone();
            let key = key.clone();
            let value = value.clone();
            let rpc_timeout = self.config.rpc_timeout;
            async move {
                matches!(
                    timeout(rpc_timeout, network.put_value(peer, key, value)).await,
                    Ok(Ok(()))
                )
            }
        });
        let results = futures::future::join_all(sends).await;
        let stored = results.iter().filter(|ok| **ok).count();
        debug!(key = %key, stored, total = results.len(), "put_value fan-out");
        if stored == 0 && !results.is_empty() {
            return Err(DhtError::PutFailed);
        }
        Ok(())
    }

    /// Fetch a record, preferring the local cache and validating everything
    /// that arrives from the network. Invalid replies abort that candidate
    /// and the search continues with other peers.
    pub async fn get_value(
        &self,
        key: &Key,
        token: &CancellationToken,
    ) -> Result<Vec<u8>, DhtError> {
        if let Some(value) = self.get_local(key).await {
            return Ok(value);
        }

        let target = key.dht_target();
        let seeds = self.seeds_for(&target).await;
        if seeds.is_empty() {
            return Err(DhtError::NoPeers);
        }

        let network = self.network.clone();
        let validators = self.validators.clone();
        let rpc_timeout = self.config.rpc_timeout;
        let probe_key = key.clone();
        let lookup = self.run_lookup(target, seeds, token, move |peer| {
            let network = network.clone();
            let validators = validators.clone();
            let key = probe_key.clone();
            async move {
                match timeout(rpc_timeout, network.get_value(&peer, key.clone())).await {
                    Ok(Ok((Some(value), _closer))) => match validators.validate(&key, &value) {
                        Ok(()) => Ok(ProbeReply::Found(value, Vec::new())),
                        Err(err) => {
                            warn!(key = %key, peer = %peer.id, "discarding invalid record: {err:#}");
                            Ok(ProbeReply::Skip)
                        }
                    },
                    Ok(Ok((None, closer))) => Ok(ProbeReply::Peers(closer)),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(anyhow!("rpc deadline exceeded")),
                }
            }
        });
        let outcome = timeout(self.config.query_timeout, lookup)
            .await
            .map_err(|_| DhtError::Timeout)??;

        let mut found = outcome.found;
        if found.is_empty() {
            return Err(DhtError::NotFound);
        }
        let best = self.validators.select(key, &found);
        let value = found.swap_remove(best);
        self.put_local(key, value.clone()).await;
        Ok(value)
    }

    /// Announce locally and to the k closest peers that this node provides
    /// `key`.
    pub async fn provide(&self, key: &Key, token: &CancellationToken) -> Result<(), DhtError> {
        {
            let mut providers = self.providers.write().await;
            providers.add(key, self.self_info.clone());
        }

        let closest = match self.closest_peers(key, token).await {
            Ok(peers) => peers,
            Err(DhtError::NoPeers) => {
                warn!(key = %key, "no peers to announce provider record to");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let sends = closest.iter().take(self.config.k).map(|peer| {
            let network = self.network.clone();
            let key = key.clone();
            let provider = self.self_info.clone();
            let rpc_timeout = self.config.rpc_timeout;
            async move {
                matches!(
                    timeout(rpc_timeout, network.add_provider(peer, key, provider)).await,
                    Ok(Ok(()))
                )
            }
        });
        let results = futures::future::join_all(sends).await;
        let announced = results.iter().filter(|ok| **ok).count();
        debug!(key = %key, announced, total = results.len(), "provider fan-out");
        Ok(())
    }

    /// Stream providers for `key`, local records first, then discoveries
    /// from an iterative query. Each distinct peer is yielded at most once
    /// per invocation; the stream closes once `count` providers were
    /// yielded, all paths are exhausted, or the token fires.
    pub fn find_providers(
        &self,
        key: Key,
        count: usize,
        token: CancellationToken,
    ) -> mpsc::Receiver<PeerInfo> {
        let (tx, rx) = mpsc::channel(count.max(1));
        let dht = self.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(dht.config.query_timeout);
            tokio::pin!(deadline);
            tokio::select! {
                _ = dht.stream_providers(key, count, tx) => {}
                _ = &mut deadline => {}
                _ = token.cancelled() => {}
            }
        });
        rx
    }

    async fn stream_providers(&self, key: Key, count: usize, tx: mpsc::Sender<PeerInfo>) {
        let mut yielded: HashSet<PeerId> = HashSet::new();

        let local = {
            let mut providers = self.providers.write().await;
            providers.get(&key)
        };
        for peer in local {
            if yielded.insert(peer.id.clone()) {
                if tx.send(peer).await.is_err() {
                    return;
                }
                if yielded.len() >= count {
                    return;
                }
            }
        }

        let target = key.dht_target();
        let seeds = self.seeds_for(&target).await;
        let alpha = self.config.alpha.max(1);
        let mut state = LookupState::new(target, seeds, self.config.k, self.id.clone());
        let mut pending = FuturesUnordered::new();

        loop {
            while pending.len() < alpha {
                let Some(peer) = state.next_candidate() else {
                    break;
                };
                let network = self.network.clone();
                let key = key.clone();
                let rpc_timeout = self.config.rpc_timeout;
                pending.push(async move {
                    let reply = match timeout(rpc_timeout, network.get_providers(&peer, key)).await
                    {
                        Ok(Ok(reply)) => Ok(reply),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(anyhow!("rpc deadline exceeded")),
                    };
                    (peer, reply)
                });
            }
            let Some((peer, result)) = pending.next().await else {
                return;
            };
            match result {
                Ok((provs, closer)) => {
                    self.observe_all(&closer).await;
                    {
                        let mut routing = self.routing.write().await;
                        routing.update(&peer.id);
                    }
                    state.merge(closer);
                    for provider in provs {
                        {
                            let mut providers = self.providers.write().await;
                            providers.add(&key, provider.clone());
                        }
                        if yielded.insert(provider.id.clone()) {
                            if tx.send(provider).await.is_err() {
                                return;
                            }
                            if yielded.len() >= count {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    debug!(peer = %peer.id, "get_providers failed: {err:#}");
                    state.drop_peer(&peer.id);
                    let mut routing = self.routing.write().await;
                    routing.remove(&peer.id);
                }
            }
        }
    }

    /// Locate a peer by ID: short-circuits on routing-table membership,
    /// otherwise walks closer peers until one identifying as `id` shows up.
    pub async fn find_peer(
        &self,
        id: &PeerId,
        token: &CancellationToken,
    ) -> Result<PeerInfo, DhtError> {
        {
            let routing = self.routing.read().await;
            if let Some(info) = routing.get(id) {
                return Ok(info);
            }
        }

        let key = Key::block(id.as_multihash());
        let target = key.dht_target();
        let seeds = self.seeds_for(&target).await;
        if seeds.is_empty() {
            return Err(DhtError::NoPeers);
        }

        let network = self.network.clone();
        let rpc_timeout = self.config.rpc_timeout;
        let wanted = id.clone();
        let lookup = self.run_lookup(target, seeds, token, move |peer| {
            let network = network.clone();
            let key = key.clone();
            let wanted = wanted.clone();
            async move {
                match timeout(rpc_timeout, network.find_node(&peer, key)).await {
                    Ok(Ok(peers)) => {
                        if let Some(hit) = peers.iter().find(|p| p.id == wanted) {
                            Ok(ProbeReply::Found(hit.clone(), peers))
                        } else {
                            Ok(ProbeReply::Peers(peers))
                        }
                    }
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(anyhow!("rpc deadline exceeded")),
                }
            }
        });
        let outcome = timeout(self.config.query_timeout, lookup)
            .await
            .map_err(|_| DhtError::Timeout)??;
        outcome.found.into_iter().next().ok_or(DhtError::NotFound)
    }

    /// Liveness probe with the short ping deadline.
    pub async fn ping(&self, peer: &PeerInfo) -> Result<(), DhtError> {
        match timeout(self.config.ping_timeout, self.network.ping(peer)).await {
            Ok(Ok(())) => {
                let mut routing = self.routing.write().await;
                routing.update(&peer.id);
                Ok(())
            }
            Ok(Err(err)) => Err(DhtError::Transient(err.to_string())),
            Err(_) => Err(DhtError::Timeout),
        }
    }

    /// Number of peers currently in the routing table.
    pub async fn routing_size(&self) -> usize {
        let routing = self.routing.read().await;
        routing.len()
    }
}
