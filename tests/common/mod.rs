#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{Mutex, RwLock};

use dagfs::dht::{Dht, DhtConfig, DhtNetwork, ValidatorRegistry};
use dagfs::keys::PeerId;
use dagfs::multihash::{Key, Multihash, SHA2_256_CODE};
use dagfs::routing::PeerInfo;

/// In-memory transport that routes RPCs straight to the target node's
/// inbound handlers, with injectable per-peer failures.
#[derive(Clone)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
    self_info: PeerInfo,
    failures: Arc<Mutex<HashSet<PeerId>>>,
    contacted: Arc<Mutex<HashSet<PeerId>>>,
    pings: Arc<Mutex<Vec<PeerId>>>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>, self_info: PeerInfo) -> Self {
        Self {
            registry,
            self_info,
            failures: Arc::new(Mutex::new(HashSet::new())),
            contacted: Arc::new(Mutex::new(HashSet::new())),
            pings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_failure(&self, peer: PeerId, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(peer);
        } else {
            failures.remove(&peer);
        }
    }

    /// Distinct peers this node sent any RPC to.
    pub async fn contacted_peers(&self) -> usize {
        let contacted = self.contacted.lock().await;
        contacted.len()
    }

    pub async fn ping_calls(&self) -> Vec<PeerId> {
        let pings = self.pings.lock().await;
        pings.clone()
    }

    async fn should_fail(&self, peer: &PeerId) -> bool {
        let failures = self.failures.lock().await;
        failures.contains(peer)
    }

    async fn record_contact(&self, peer: &PeerId) {
        let mut contacted = self.contacted.lock().await;
        contacted.insert(peer.clone());
    }
}

/// Maps peer IDs to their engines so test nodes can reach each other.
#[derive(Default)]
pub struct NetworkRegistry {
    peers: RwLock<HashMap<PeerId, Dht<TestNetwork>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, dht: &Dht<TestNetwork>) {
        let mut peers = self.peers.write().await;
        peers.insert(dht.id().clone(), dht.clone());
    }

    pub async fn get(&self, id: &PeerId) -> Option<Dht<TestNetwork>> {
        let peers = self.peers.read().await;
        peers.get(id).cloned()
    }
}

#[async_trait::async_trait]
impl DhtNetwork for TestNetwork {
    async fn ping(&self, to: &PeerInfo) -> Result<()> {
        if self.should_fail(&to.id).await {
            return Err(anyhow!("injected network failure"));
        }
        {
            let mut pings = self.pings.lock().await;
            pings.push(to.id.clone());
        }
        match self.registry.get(&to.id).await {
            Some(peer) => {
                peer.handle_ping(&self.self_info).await;
                Ok(())
            }
            None => Err(anyhow!("peer not reachable")),
        }
    }

    async fn find_node(&self, to: &PeerInfo, target: Key) -> Result<Vec<PeerInfo>> {
        if self.should_fail(&to.id).await {
            return Err(anyhow!("injected network failure"));
        }
        self.record_contact(&to.id).await;
        if let Some(peer) = self.registry.get(&to.id).await {
            Ok(peer.handle_find_node(&self.self_info, &target).await)
        } else {
            Ok(Vec::new())
        }
    }

    async fn get_value(&self, to: &PeerInfo, key: Key) -> Result<(Option<Vec<u8>>, Vec<PeerInfo>)> {
        if self.should_fail(&to.id).await {
            return Err(anyhow!("injected network failure"));
        }
        self.record_contact(&to.id).await;
        if let Some(peer) = self.registry.get(&to.id).await {
            Ok(peer.handle_get_value(&self.self_info, &key).await)
        } else {
            Ok((None, Vec::new()))
        }
    }

    async fn put_value(&self, to: &PeerInfo, key: Key, value: Vec<u8>) -> Result<()> {
        if self.should_fail(&to.id).await {
            return Err(anyhow!("injected network failure"));
        }
        self.record_contact(&to.id).await;
        match self.registry.get(&to.id).await {
            Some(peer) => peer.handle_put_value(&self.self_info, &key, value).await,
            None => Err(anyhow!("peer not reachable")),
        }
    }

    async fn add_provider(&self, to: &PeerInfo, key: Key, provider: PeerInfo) -> Result<()> {
        if self.should_fail(&to.id).await {
            return Err(anyhow!("injected network failure"));
        }
        self.record_contact(&to.id).await;
        if let Some(peer) = self.registry.get(&to.id).await {
            peer.handle_add_provider(&self.self_info, &key, provider)
                .await;
        }
        Ok(())
    }

    async fn get_providers(
        &self,
        to: &PeerInfo,
        key: Key,
    ) -> Result<(Vec<PeerInfo>, Vec<PeerInfo>)> {
        if self.should_fail(&to.id).await {
            return Err(anyhow!("injected network failure"));
        }
        self.record_contact(&to.id).await;
        if let Some(peer) = self.registry.get(&to.id).await {
            Ok(peer.handle_get_providers(&self.self_info, &key).await)
        } else {
            Ok((Vec::new(), Vec::new()))
        }
    }
}

pub struct TestNode {
    pub dht: Dht<TestNetwork>,
    pub network: TestNetwork,
}

impl TestNode {
    pub async fn new(registry: Arc<NetworkRegistry>, index: u32, config: DhtConfig) -> Self {
        Self::with_validators(registry, index, config, ValidatorRegistry::new()).await
    }

    pub async fn with_validators(
        registry: Arc<NetworkRegistry>,
        index: u32,
        config: DhtConfig,
        validators: ValidatorRegistry,
    ) -> Self {
        let info = make_peer(index);
        let network = TestNetwork::new(registry.clone(), info.clone());
        let dht = Dht::new(
            info.id.clone(),
            info.addr.clone(),
            network.clone(),
            validators,
            config,
        );
        registry.register(&dht).await;
        Self { dht, network }
    }

    pub fn info(&self) -> PeerInfo {
        self.dht.self_info()
    }
}

/// A peer ID whose routing target is exactly `target`.
pub fn peer_id_from_target(target: [u8; 32]) -> PeerId {
    PeerId(Multihash::wrap(SHA2_256_CODE, &target).expect("sha2-256 framing"))
}

pub fn make_target(index: u32) -> [u8; 32] {
    let mut target = [0u8; 32];
    target[..4].copy_from_slice(&index.to_be_bytes());
    target
}

pub fn make_peer(index: u32) -> PeerInfo {
    PeerInfo::new(
        peer_id_from_target(make_target(index)),
        format!("node-{index}"),
    )
}
