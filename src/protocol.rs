//! Wire messages exchanged between DHT peers.
//!
//! One request/response pair per operation, correlated 1:1 by the rpc
//! layer. Every request carries the sender's [`PeerInfo`] so the receiver
//! can feed its routing table.

use irpc::channel::oneshot;
use irpc::rpc_requests;
use serde::{Deserialize, Serialize};

use crate::multihash::Key;
use crate::routing::PeerInfo;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingRequest {
    pub from: PeerInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodeRequest {
    pub from: PeerInfo,
    pub target: Key,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetValueRequest {
    pub from: PeerInfo,
    pub key: Key,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutValueRequest {
    pub from: PeerInfo,
    pub key: Key,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddProviderRequest {
    pub from: PeerInfo,
    pub key: Key,
    pub provider: PeerInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetProvidersRequest {
    pub from: PeerInfo,
    pub key: Key,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetValueResponse {
    pub value: Option<Vec<u8>>,
    pub closer_peers: Vec<PeerInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetProvidersResponse {
    pub provider_peers: Vec<PeerInfo>,
    pub closer_peers: Vec<PeerInfo>,
}

/// Whether an inbound record was accepted by the receiver's validator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutValueResponse {
    pub accepted: bool,
}

/// Marker type identifying the DHT RPC service to the `irpc` machinery.
#[derive(Debug, Clone, Copy)]
pub struct DhtService;

impl irpc::Service for DhtService {}

#[rpc_requests(DhtService, message = DhtMessage)]
#[derive(Debug, Serialize, Deserialize)]
pub enum DhtProtocol {
    #[rpc(tx = oneshot::Sender<()>)]
    Ping(PingRequest),
    #[rpc(tx = oneshot::Sender<Vec<PeerInfo>>)]
    FindNode(FindNodeRequest),
    #[rpc(tx = oneshot::Sender<GetValueResponse>)]
    GetValue(GetValueRequest),
    #[rpc(tx = oneshot::Sender<PutValueResponse>)]
    PutValue(PutValueRequest),
    #[rpc(tx = oneshot::Sender<()>)]
    AddProvider(AddProviderRequest),
    #[rpc(tx = oneshot::Sender<GetProvidersResponse>)]
    GetProviders(GetProvidersRequest),
}
