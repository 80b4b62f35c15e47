//! DHT protocol server for handling incoming RPC requests.
//!
//! This module provides the [`DhtProtocolHandler`] which integrates with
//! iroh's router to handle incoming DHT protocol connections. Incoming RPC
//! messages are dispatched to the matching `handle_*` methods on the
//! [`Dht`] engine.
//!
//! # Usage
//!
//! ```ignore
//! let handler = DhtProtocolHandler::new(dht);
//! let router = Router::builder(endpoint.clone())
//!     .accept(DHT_ALPN, handler)
//!     .spawn()
//!     .await?;
//! ```

use std::fmt;
use std::sync::Arc;

use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use irpc::rpc::Handler;
use irpc::WithChannels;
use irpc_iroh::IrohProtocol;
use tracing::{debug, trace};

use crate::dht::{Dht, DhtNetwork};
use crate::protocol::{
    AddProviderRequest, DhtMessage, DhtProtocol, DhtService, FindNodeRequest,
    GetProvidersRequest, GetProvidersResponse, GetValueRequest, GetValueResponse, PingRequest,
    PutValueRequest, PutValueResponse,
};

/// Protocol handler for incoming DHT connections.
///
/// Integrates with iroh's Router to handle connections negotiated with the
/// DHT ALPN. Each connection is handled by irpc's protocol machinery, which
/// dispatches incoming RPC messages to a background actor that calls into
/// the [`Dht`].
#[derive(Clone)]
pub struct DhtProtocolHandler {
    inner: Arc<IrohProtocol<DhtProtocol>>,
}

impl DhtProtocolHandler {
    /// Create a new protocol handler backed by the given DHT engine.
    ///
    /// Spawns a background task to process incoming RPC messages.
    pub fn new<N: DhtNetwork>(dht: Dht<N>) -> Self {
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        tokio::spawn(run_server(dht, rx));
        let local: irpc::LocalSender<DhtMessage, DhtService> = tx.into();
        let handler: Handler<DhtProtocol> = Arc::new(move |msg, rx, tx| {
            let local = local.clone();
            Box::pin(match msg {
                DhtProtocol::Ping(msg) => local.send((msg, tx)),
                DhtProtocol::FindNode(msg) => local.send((msg, tx)),
                DhtProtocol::GetValue(msg) => local.send((msg, tx)),
                DhtProtocol::PutValue(msg) => local.send((msg, tx)),
                DhtProtocol::AddProvider(msg) => local.send((msg, tx)),
                DhtProtocol::GetProviders(msg) => local.send((msg, tx)),
            })
        });
        let inner = IrohProtocol::new(handler);
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl fmt::Debug for DhtProtocolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtProtocolHandler").finish()
    }
}

impl ProtocolHandler for DhtProtocolHandler {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        self.inner.accept(connection)
    }
}

/// Background task that processes incoming RPC messages.
async fn run_server<N: DhtNetwork>(
    dht: Dht<N>,
    mut inbox: tokio::sync::mpsc::Receiver<DhtMessage>,
) {
    while let Some(msg) = inbox.recv().await {
        handle_message(dht.clone(), msg).await;
    }
}

async fn handle_message<N: DhtNetwork>(dht: Dht<N>, msg: DhtMessage) {
    match msg {
        DhtMessage::Ping(request) => handle_ping(dht, request).await,
        DhtMessage::FindNode(request) => handle_find_node(dht, request).await,
        DhtMessage::GetValue(request) => handle_get_value(dht, request).await,
        DhtMessage::PutValue(request) => handle_put_value(dht, request).await,
        DhtMessage::AddProvider(request) => handle_add_provider(dht, request).await,
        DhtMessage::GetProviders(request) => handle_get_providers(dht, request).await,
    }
}

async fn handle_ping<N: DhtNetwork>(dht: Dht<N>, request: WithChannels<PingRequest, DhtService>) {
    let WithChannels { inner, tx, .. } = request;
    trace!(from = %inner.from.id, "handling PING request");
    dht.handle_ping(&inner.from).await;
    let _ = tx.send(()).await;
}

async fn handle_find_node<N: DhtNetwork>(
    dht: Dht<N>,
    request: WithChannels<FindNodeRequest, DhtService>,
) {
    let WithChannels { inner, tx, .. } = request;
    trace!(from = %inner.from.id, target = %inner.target, "handling FIND_NODE request");
    let peers = dht.handle_find_node(&inner.from, &inner.target).await;
    debug!(from = %inner.from.id, returned = peers.len(), "FIND_NODE response");
    let _ = tx.send(peers).await;
}

async fn handle_get_value<N: DhtNetwork>(
    dht: Dht<N>,
    request: WithChannels<GetValueRequest, DhtService>,
) {
    let WithChannels { inner, tx, .. } = request;
    trace!(from = %inner.from.id, key = %inner.key, "handling GET_VALUE request");
    let (value, closer_peers) = dht.handle_get_value(&inner.from, &inner.key).await;
    debug!(
        from = %inner.from.id,
        found = value.is_some(),
        closer = closer_peers.len(),
        "GET_VALUE response"
    );
    let _ = tx
        .send(GetValueResponse {
            value,
            closer_peers,
        })
        .await;
}

async fn handle_put_value<N: DhtNetwork>(
    dht: Dht<N>,
    request: WithChannels<PutValueRequest, DhtService>,
) {
    let WithChannels { inner, tx, .. } = request;
    debug!(
        from = %inner.from.id,
        key = %inner.key,
        value_len = inner.value.len(),
        "handling PUT_VALUE request"
    );
    let accepted = dht
        .handle_put_value(&inner.from, &inner.key, inner.value)
        .await
        .is_ok();
    let _ = tx.send(PutValueResponse { accepted }).await;
}

async fn handle_add_provider<N: DhtNetwork>(
    dht: Dht<N>,
    request: WithChannels<AddProviderRequest, DhtService>,
) {
    let WithChannels { inner, tx, .. } = request;
    trace!(from = %inner.from.id, key = %inner.key, "handling ADD_PROVIDER request");
    dht.handle_add_provider(&inner.from, &inner.key, inner.provider)
        .await;
    let _ = tx.send(()).await;
}

async fn handle_get_providers<N: DhtNetwork>(
    dht: Dht<N>,
    request: WithChannels<GetProvidersRequest, DhtService>,
) {
    let WithChannels { inner, tx, .. } = request;
    trace!(from = %inner.from.id, key = %inner.key, "handling GET_PROVIDERS request");
    let (provider_peers, closer_peers) = dht.handle_get_providers(&inner.from, &inner.key).await;
    debug!(
        from = %inner.from.id,
        providers = provider_peers.len(),
        closer = closer_peers.len(),
        "GET_PROVIDERS response"
    );
    let _ = tx
        .send(GetProvidersResponse {
            provider_peers,
            closer_peers,
        })
        .await;
}
