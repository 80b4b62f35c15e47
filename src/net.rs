//! iroh QUIC transport for DHT RPCs.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use iroh::Endpoint;
use iroh::NodeAddr;
use irpc::Client;
use irpc_iroh::IrohRemoteConnection;

use crate::dht::DhtNetwork;
use crate::multihash::Key;
use crate::protocol::{
    AddProviderRequest, DhtMessage, DhtProtocol, DhtService, FindNodeRequest,
    GetProvidersRequest, GetValueRequest, PingRequest, PutValueRequest,
};
use crate::routing::PeerInfo;

pub const DHT_ALPN: &[u8] = b"dagfs/dht/1";

/// [`DhtNetwork`] implementation that dials peers over iroh QUIC.
pub struct IrohNetwork {
    pub endpoint: Endpoint,
    pub self_info: PeerInfo,
}

impl IrohNetwork {
    fn parse_addr(&self, peer: &PeerInfo) -> Result<NodeAddr> {
        Ok(serde_json::from_str(&peer.addr)?)
    }

    fn client(&self, peer: &PeerInfo) -> Result<Client<DhtMessage, DhtProtocol, DhtService>> {
        let addr = self.parse_addr(peer)?;
        let connection =
            IrohRemoteConnection::new(self.endpoint.clone(), addr, DHT_ALPN.to_vec());
        Ok(Client::boxed(connection))
    }
}

#[async_trait]
impl DhtNetwork for IrohNetwork {
    async fn ping(&self, to: &PeerInfo) -> Result<()> {
        let client = self.client(to)?;
        client
            .rpc(PingRequest {
                from: self.self_info.clone(),
            })
            .await?;
        Ok(())
    }

    async fn find_node(&self, to: &PeerInfo, target: Key) -> Result<Vec<PeerInfo>> {
        let client = self.client(to)?;
        let peers = client
            .rpc(FindNodeRequest {
                from: self.self_info.clone(),
                target,
            })
            .await?;
        Ok(peers)
    }

    async fn get_value(&self, to: &PeerInfo, key: Key) -> Result<(Option<Vec<u8>>, Vec<PeerInfo>)> {
        let client = self.client(to)?;
        let response = client
            .rpc(GetValueRequest {
                from: self.self_info.clone(),
                key,
            })
            .await?;
        Ok((response.value, response.closer_peers))
    }

    async fn put_value(&self, to: &PeerInfo, key: Key, value: Vec<u8>) -> Result<()> {
        let client = self.client(to)?;
        let response = client
            .rpc(PutValueRequest {
                from: self.self_info.clone(),
                key,
                value,
            })
            .await?;
        if !response.accepted {
            return Err(anyhow!("peer rejected record"));
        }
        Ok(())
    }

    async fn add_provider(&self, to: &PeerInfo, key: Key, provider: PeerInfo) -> Result<()> {
        let client = self.client(to)?;
        client
            .rpc(AddProviderRequest {
                from: self.self_info.clone(),
                key,
                provider,
            })
            .await?;
        Ok(())
    }

    async fn get_providers(
        &self,
        to: &PeerInfo,
        key: Key,
    ) -> Result<(Vec<PeerInfo>, Vec<PeerInfo>)> {
        let client = self.client(to)?;
        let response = client
            .rpc(GetProvidersRequest {
                from: self.self_info.clone(),
                key,
            })
            .await?;
        Ok((response.provider_peers, response.closer_peers))
    }
}
