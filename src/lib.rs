//! # dagfs
//!
//! The core of a content-addressed peer-to-peer file system: a Merkle-DAG
//! object model, a Kademlia-style DHT that discovers providers for content,
//! and a signed mutable-name layer on top.
//!
//! The crate is split into modules that can be reused independently:
//!
//! - [`multihash`]: self-describing hashes and the DHT keyspace.
//! - [`keys`]: RSA/Ed25519 keypairs and self-authenticating peer IDs.
//! - [`blockstore`]: the local multihash-to-bytes mapping, in memory or on
//!   disk.
//! - [`dag`]: typed nodes with named links, canonical serialization, and
//!   path traversal.
//! - [`exchange`]: the block-fetch contract the DAG consumes for
//!   non-resident keys.
//! - [`routing`]: the per-peer k-bucket routing table.
//! - [`providers`]: expiring provider records.
//! - [`dht`]: the iterative query engine (FIND_NODE, GET_VALUE, PUT_VALUE,
//!   PROVIDE, FIND_PROVIDERS, PING) with pluggable record validation.
//! - [`namesys`]: signed mutable name records published through the DHT.
//! - [`path`]: `/ipfs/` and `/ipns/` path resolution.
//! - [`pin`]: GC roots and the sweep that honors them.
//! - [`protocol`], [`net`], [`server`]: the rpc message set, the iroh QUIC
//!   transport, and inbound dispatch.
//!
//! ## Getting started
//!
//! Construct an [`IrohNetwork`], build a [`Dht`] with the standard
//! replication factor (`k`) and concurrency (`α`), and register the name
//! system validators:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anyhow::Result;
//! use dagfs::{Dht, DhtConfig, DhtProtocolHandler, IrohNetwork, PeerInfo, DHT_ALPN};
//! use dagfs::keys::{KeyType, PrivateKey};
//! use dagfs::namesys::name_system_validators;
//! use iroh::Endpoint;
//!
//! # async fn launch(endpoint: Endpoint, addr_json: String) -> Result<()> {
//! let identity = PrivateKey::generate(KeyType::Ed25519)?;
//! let peer_id = identity.public().peer_id()?;
//! let self_info = PeerInfo::new(peer_id.clone(), addr_json.clone());
//! let network = IrohNetwork {
//!     endpoint: endpoint.clone(),
//!     self_info,
//! };
//! let dht = Dht::new(
//!     peer_id,
//!     addr_json,
//!     network,
//!     name_system_validators(),
//!     DhtConfig::default(),
//! );
//! let handler = DhtProtocolHandler::new(dht.clone());
//! // Register `handler` with the endpoint's router under DHT_ALPN.
//! # let _ = handler;
//! # Ok(())
//! # }
//! ```

pub mod blockstore;
pub mod dag;
pub mod dht;
pub mod exchange;
pub mod keys;
pub mod multihash;
pub mod namesys;
pub mod net;
pub mod path;
pub mod pin;
pub mod protocol;
pub mod providers;
pub mod routing;
pub mod server;

pub use blockstore::{Block, BlockStore, FsBlockStore, MemoryBlockStore};
pub use dag::{DagLink, DagNode, DagService};
pub use dht::{Dht, DhtConfig, DhtError, DhtNetwork, ValidatorRegistry};
pub use exchange::{Exchange, ExchangeError};
pub use keys::{PeerId, PrivateKey, PublicKey};
pub use multihash::{Key, Multihash};
pub use namesys::{NamePublisher, NameResolver};
pub use net::{IrohNetwork, DHT_ALPN};
pub use path::{DagPath, PathResolver};
pub use pin::Pinner;
pub use routing::{PeerInfo, RoutingTable};
pub use server::DhtProtocolHandler;
