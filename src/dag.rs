//! The Merkle-DAG object model.
//!
//! A [`DagNode`] carries opaque `data` plus an ordered sequence of named
//! [`DagLink`]s. Node identity is the SHA-256 multihash of the canonical
//! protobuf serialization, so two nodes with the same data and the same
//! links always share a key, on every implementation. Links are sorted by
//! name with a stable sort before encoding; duplicate names keep their
//! insertion order.
//!
//! Nodes are immutable once hashed: every mutating operation invalidates the
//! cached serialization, and "updating" a child produces a new node whose
//! ancestors must be rewritten up to a new root.
//!
//! [`DagService`] glues nodes to a [`BlockStore`], falling back to the block
//! [`Exchange`] for keys that are not resident locally.

use std::sync::Arc;

use prost::Message;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::blockstore::{Block, BlockStore, BlockStoreError};
use crate::exchange::{Exchange, ExchangeError};
use crate::multihash::Multihash;

/// Wire form of a single link: hash, then name, then cumulative size.
#[derive(Clone, PartialEq, Message)]
pub struct PbLink {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub hash: Option<Vec<u8>>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(uint64, optional, tag = "3")]
    pub tsize: Option<u64>,
}

/// Wire form of a node: data at tag 1, links at tag 2.
#[derive(Clone, PartialEq, Message)]
pub struct PbNode {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub data: Option<Vec<u8>>,
    #[prost(message, repeated, tag = "2")]
    pub links: Vec<PbLink>,
}

#[derive(Debug, Error)]
pub enum DagError {
    #[error("no link named {0:?}")]
    NoLink(String),
    #[error("malformed node bytes: {0}")]
    MalformedNode(String),
    #[error("block not found: {0}")]
    BlockNotFound(Multihash),
    #[error("block {key} does not match its content, hashed to {actual}")]
    HashMismatch { key: Multihash, actual: Multihash },
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    Timeout,
    #[error(transparent)]
    Store(#[from] BlockStoreError),
}

/// A named, weak reference to another node.
///
/// Holding a link does not guarantee the target exists locally; the `node`
/// slot is only populated when the child was attached in memory, which is
/// what [`DagService::add_recursive`] traverses.
#[derive(Clone, Debug)]
pub struct DagLink {
    /// UTF-8 link name, unique per node by convention.
    pub name: String,
    /// Cumulative serialized size of the target's subtree.
    pub size: u64,
    /// Multihash of the target node.
    pub hash: Multihash,
    node: Option<Arc<DagNode>>,
}

impl PartialEq for DagLink {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.size == other.size && self.hash == other.hash
    }
}

impl Eq for DagLink {}

impl DagLink {
    pub fn new(name: impl Into<String>, size: u64, hash: Multihash) -> Self {
        Self {
            name: name.into(),
            size,
            hash,
            node: None,
        }
    }

    /// The in-memory child, when the link was created from one.
    pub fn cached_node(&self) -> Option<&DagNode> {
        self.node.as_deref()
    }
}

/// A node in the Merkle DAG: opaque data plus named links.
#[derive(Clone, Debug, Default)]
pub struct DagNode {
    data: Vec<u8>,
    links: Vec<DagLink>,
    // Cached canonical serialization and its multihash; cleared on mutation.
    encoded: Option<Vec<u8>>,
    cached_key: Option<Multihash>,
}

impl PartialEq for DagNode {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data && self.links == other.links
    }
}

impl Eq for DagNode {}

impl DagNode {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_data(&mut self, data: impl Into<Vec<u8>>) {
        self.invalidate();
        self.data = data.into();
    }

    pub fn links(&self) -> &[DagLink] {
        &self.links
    }

    fn invalidate(&mut self) {
        self.encoded = None;
        self.cached_key = None;
    }

    /// Add a link to `child`, keeping the child resident for
    /// [`DagService::add_recursive`].
    pub fn add_link(&mut self, name: impl Into<String>, child: &DagNode) {
        self.invalidate();
        let mut link = Self::link_to(name, child);
        link.node = Some(Arc::new(child.clone()));
        self.links.push(link);
    }

    /// Add a link to `child` without keeping the child in memory.
    pub fn add_link_clean(&mut self, name: impl Into<String>, child: &DagNode) {
        self.invalidate();
        self.links.push(Self::link_to(name, child));
    }

    /// Add a copy of a pre-built link.
    pub fn add_raw_link(&mut self, link: &DagLink) {
        self.invalidate();
        self.links
            .push(DagLink::new(link.name.clone(), link.size, link.hash.clone()));
    }

    fn link_to(name: impl Into<String>, child: &DagNode) -> DagLink {
        DagLink::new(name, child.cumulative_size(), child.key_now())
    }

    /// Remove every link with the given name.
    pub fn remove_link(&mut self, name: &str) -> Result<(), DagError> {
        let before = self.links.len();
        self.links.retain(|l| l.name != name);
        if self.links.len() == before {
            return Err(DagError::NoLink(name.to_string()));
        }
        self.invalidate();
        Ok(())
    }

    /// Look up a link by name.
    pub fn get_link(&self, name: &str) -> Option<&DagLink> {
        self.links.iter().find(|l| l.name == name)
    }

    /// Return a new node with the named link pointing at `child`. Any
    /// existing link of that name is removed first; a missing name is not an
    /// error.
    pub fn update_link(&self, name: &str, child: &DagNode) -> DagNode {
        let mut next = self.clone();
        let _ = next.remove_link(name);
        next.add_link(name, child);
        next
    }

    fn to_pb(&self) -> PbNode {
        let mut links = self.links.clone();
        // Vec::sort_by is stable: duplicate names keep insertion order.
        links.sort_by(|a, b| a.name.cmp(&b.name));
        PbNode {
            data: if self.data.is_empty() {
                None
            } else {
                Some(self.data.clone())
            },
            links: links
                .into_iter()
                .map(|l| PbLink {
                    hash: Some(l.hash.as_bytes().to_vec()),
                    name: Some(l.name),
                    tsize: Some(l.size),
                })
                .collect(),
        }
    }

    /// Canonical serialization, computed fresh. Encoding the same logical
    /// node twice yields byte-identical output.
    pub fn to_encoded_bytes(&self) -> Vec<u8> {
        if let Some(cached) = &self.encoded {
            return cached.clone();
        }
        self.to_pb().encode_to_vec()
    }

    /// Canonical serialization, memoized along with the node key. Sorts the
    /// in-place link order like the wire form does.
    pub fn encoded(&mut self) -> &[u8] {
        if self.encoded.is_none() {
            self.links.sort_by(|a, b| a.name.cmp(&b.name));
            let bytes = self.to_pb().encode_to_vec();
            self.cached_key = Some(Multihash::sha2_256(&bytes));
            self.encoded = Some(bytes);
        }
        self.encoded.as_deref().expect("just populated")
    }

    /// The node's key: the multihash of its canonical serialization.
    pub fn key(&mut self) -> Multihash {
        self.encoded();
        self.cached_key.clone().expect("populated by encoded()")
    }

    /// Key computation that does not touch the cache. Used when the node is
    /// behind a shared reference.
    pub fn key_now(&self) -> Multihash {
        if let Some(key) = &self.cached_key {
            return key.clone();
        }
        Multihash::sha2_256(&self.to_encoded_bytes())
    }

    /// Total size of the data addressed by this node: its own serialized
    /// length plus the cumulative sizes of every referenced subtree.
    pub fn cumulative_size(&self) -> u64 {
        let own = self.to_encoded_bytes().len() as u64;
        own + self.links.iter().map(|l| l.size).sum::<u64>()
    }

    /// Summary statistics, mostly sizes.
    pub fn stat(&self) -> NodeStat {
        let encoded = self.to_encoded_bytes();
        NodeStat {
            hash: self.key_now().to_base58(),
            num_links: self.links.len(),
            block_size: encoded.len(),
            links_size: encoded.len() - self.data.len(),
            data_size: self.data.len(),
            cumulative_size: self.cumulative_size(),
        }
    }

    /// Decode a node from its wire form.
    ///
    /// Input links are not assumed to be sorted; their order is preserved as
    /// read. The incoming bytes become the cached serialization, so the key
    /// of a decoded node matches the block it came from.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DagError> {
        let pb = PbNode::decode(bytes).map_err(|e| DagError::MalformedNode(e.to_string()))?;
        let mut links = Vec::with_capacity(pb.links.len());
        for link in pb.links {
            let hash_bytes = link
                .hash
                .ok_or_else(|| DagError::MalformedNode("link without hash".into()))?;
            let hash = Multihash::from_bytes(&hash_bytes)
                .map_err(|e| DagError::MalformedNode(e.to_string()))?;
            links.push(DagLink::new(
                link.name.unwrap_or_default(),
                link.tsize.unwrap_or_default(),
                hash,
            ));
        }
        Ok(Self {
            data: pb.data.unwrap_or_default(),
            links,
            cached_key: Some(Multihash::sha2_256(bytes)),
            encoded: Some(bytes.to_vec()),
        })
    }
}

/// Statistics for a node. Mostly sizes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeStat {
    pub hash: String,
    pub num_links: usize,
    pub block_size: usize,
    pub links_size: usize,
    pub data_size: usize,
    pub cumulative_size: u64,
}

/// Node storage and retrieval over a block store, with a network exchange
/// fallback for blocks that are not resident.
pub struct DagService<S: BlockStore> {
    store: Arc<S>,
    exchange: Option<Arc<dyn Exchange>>,
}

impl<S: BlockStore> DagService<S> {
    /// A service that only ever reads and writes the local store.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            exchange: None,
        }
    }

    /// A service that falls back to `exchange` for missing blocks.
    pub fn with_exchange(store: Arc<S>, exchange: Arc<dyn Exchange>) -> Self {
        Self {
            store,
            exchange: Some(exchange),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Serialize, hash, and store a node, returning its key.
    pub async fn add(&self, node: &DagNode) -> Result<Multihash, DagError> {
        let bytes = node.to_encoded_bytes();
        let key = Multihash::sha2_256(&bytes);
        self.store.put(Block::with_key(key.clone(), bytes)).await?;
        Ok(key)
    }

    /// Store a node and, depth-first, every referenced child still resident
    /// in memory. Children that were linked by hash only are left for the
    /// caller to provide.
    pub async fn add_recursive(&self, node: &DagNode) -> Result<Multihash, DagError> {
        let mut blocks = Vec::new();
        collect_resident(node, &mut blocks);
        let root_key = blocks.first().map(|b: &Block| b.key().clone());
        for block in blocks {
            self.store.put(block).await?;
        }
        root_key.ok_or_else(|| DagError::MalformedNode("empty traversal".into()))
    }

    /// Fetch and decode the node for `key`, consulting the exchange when the
    /// block is not local.
    pub async fn get(
        &self,
        key: &Multihash,
        token: &CancellationToken,
    ) -> Result<DagNode, DagError> {
        match self.store.get(key).await {
            Ok(bytes) => DagNode::from_bytes(&bytes),
            Err(BlockStoreError::NotFound(_)) => self.fetch_remote(key, token).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_remote(
        &self,
        key: &Multihash,
        token: &CancellationToken,
    ) -> Result<DagNode, DagError> {
        let Some(exchange) = &self.exchange else {
            return Err(DagError::BlockNotFound(key.clone()));
        };
        let bytes = exchange
            .get_block(key, token)
            .await
            .map_err(|e| match e {
                ExchangeError::NotFound(key) => DagError::BlockNotFound(key),
                ExchangeError::Cancelled => DagError::Cancelled,
                ExchangeError::Timeout => DagError::Timeout,
                ExchangeError::Transfer(msg) => DagError::MalformedNode(msg),
            })?;

        // Advertised hash must match the received content.
        let actual = Multihash::sha2_256(&bytes);
        if &actual != key {
            return Err(DagError::HashMismatch {
                key: key.clone(),
                actual,
            });
        }

        debug!(key = %key, len = bytes.len(), "block fetched via exchange");
        self.store
            .put(Block::with_key(key.clone(), bytes.clone()))
            .await?;
        DagNode::from_bytes(&bytes)
    }

    /// Walk named links from `root` through each path component in turn.
    pub async fn resolve_path(
        &self,
        root: &Multihash,
        components: &[&str],
        token: &CancellationToken,
    ) -> Result<DagNode, DagError> {
        let mut node = self.get(root, token).await?;
        for component in components {
            let link = node
                .get_link(component)
                .ok_or_else(|| DagError::NoLink(component.to_string()))?;
            let hash = link.hash.clone();
            node = self.get(&hash, token).await?;
        }
        Ok(node)
    }

    /// Drop the block backing `key` from the local store.
    pub async fn remove(&self, key: &Multihash) -> Result<(), DagError> {
        self.store.delete(key).await?;
        Ok(())
    }
}

fn collect_resident(node: &DagNode, out: &mut Vec<Block>) {
    let bytes = node.to_encoded_bytes();
    let key = Multihash::sha2_256(&bytes);
    out.push(Block::with_key(key, bytes));
    for link in node.links() {
        if let Some(child) = link.cached_node() {
            collect_resident(child, out);
        }
    }
}
