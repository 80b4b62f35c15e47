//! The block-exchange contract.
//!
//! The DAG pulls missing blocks through a single capability: given a
//! content key, produce the raw block bytes. Provider discovery,
//! connection, and transfer are the exchange's concern, not the DAG's.
//! Concurrent fetches of the same key coalesce to one in-flight request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::dht::{Dht, DhtNetwork};
use crate::multihash::{Key, Multihash};
use crate::routing::PeerInfo;

/// Overall deadline for a single block fetch, provider discovery included.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// How many providers a fetch will try before giving up.
const FETCH_PROVIDER_CANDIDATES: usize = 8;

#[derive(Clone, Debug, Error)]
pub enum ExchangeError {
    #[error("block not found: {0}")]
    NotFound(Multihash),
    #[error("fetch cancelled")]
    Cancelled,
    #[error("fetch deadline exceeded")]
    Timeout,
    #[error("transfer failed: {0}")]
    Transfer(String),
}

/// The contract the DAG consumes: fetch the raw bytes for a content key.
///
/// Implementations must be safe to invoke concurrently for different keys
/// and should coalesce concurrent fetches of the same key into one
/// in-flight request. Cancelling `token` aborts the caller's wait.
#[async_trait]
pub trait Exchange: Send + Sync + 'static {
    async fn get_block(
        &self,
        key: &Multihash,
        token: &CancellationToken,
    ) -> Result<Bytes, ExchangeError>;
}

/// Moves one block from a specific peer. The wire protocol behind this is
/// the transport's concern.
#[async_trait]
pub trait BlockTransfer: Send + Sync + 'static {
    async fn fetch_block(&self, from: &PeerInfo, key: &Multihash) -> anyhow::Result<Bytes>;
}

type FetchResult = Result<Bytes, ExchangeError>;

/// An [`Exchange`] that discovers providers through the DHT and pulls the
/// block from them, verifying content against the advertised key.
///
/// Provider records are advisory, so a peer that advertises a key it cannot
/// serve is skipped and the next provider is tried.
pub struct DhtExchange<N: DhtNetwork> {
    dht: Dht<N>,
    transfer: Arc<dyn BlockTransfer>,
    inflight: Arc<Mutex<HashMap<Multihash, broadcast::Sender<FetchResult>>>>,
}

impl<N: DhtNetwork> DhtExchange<N> {
    pub fn new(dht: Dht<N>, transfer: Arc<dyn BlockTransfer>) -> Self {
        Self {
            dht,
            transfer,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn fetch(
        dht: Dht<N>,
        transfer: Arc<dyn BlockTransfer>,
        key: Multihash,
        token: CancellationToken,
    ) -> FetchResult {
        let mut providers = dht.find_providers(
            Key::block(&key),
            FETCH_PROVIDER_CANDIDATES,
            token.clone(),
        );
        while let Some(provider) = providers.recv().await {
            trace!(key = %key, provider = %provider.id, "trying provider");
            match transfer.fetch_block(&provider, &key).await {
                Ok(bytes) if Multihash::sha2_256(&bytes) == key => {
                    debug!(key = %key, provider = %provider.id, "block fetched");
                    return Ok(bytes);
                }
                Ok(_) => {
                    debug!(key = %key, provider = %provider.id, "provider served wrong bytes");
                }
                Err(err) => {
                    debug!(key = %key, provider = %provider.id, "provider fetch failed: {err:#}");
                }
            }
        }
        Err(ExchangeError::NotFound(key))
    }
}

#[async_trait]
impl<N: DhtNetwork> Exchange for DhtExchange<N> {
    async fn get_block(
        &self,
        key: &Multihash,
        token: &CancellationToken,
    ) -> Result<Bytes, ExchangeError> {
        let mut rx = {
            let mut inflight = self.inflight.lock().await;
            if let Some(tx) = inflight.get(key) {
                tx.subscribe()
            } else {
                let (tx, rx) = broadcast::channel(1);
                inflight.insert(key.clone(), tx.clone());

                let dht = self.dht.clone();
                let transfer = self.transfer.clone();
                let inflight = self.inflight.clone();
                let key = key.clone();
                // The fetch runs detached so coalesced waiters can cancel
                // independently of it.
                let fetch_token = CancellationToken::new();
                tokio::spawn(async move {
                    let result = match timeout(
                        FETCH_TIMEOUT,
                        Self::fetch(dht, transfer, key.clone(), fetch_token),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ExchangeError::Timeout),
                    };
                    {
                        let mut inflight = inflight.lock().await;
                        inflight.remove(&key);
                    }
                    let _ = tx.send(result);
                });
                rx
            }
        };

        tokio::select! {
            _ = token.cancelled() => Err(ExchangeError::Cancelled),
            result = rx.recv() => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(ExchangeError::Transfer("fetch task dropped".into())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NeverServes;

    #[async_trait]
    impl Exchange for NeverServes {
        async fn get_block(
            &self,
            key: &Multihash,
            _token: &CancellationToken,
        ) -> Result<Bytes, ExchangeError> {
            Err(ExchangeError::NotFound(key.clone()))
        }
    }

    struct CountingExchange {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Exchange for CountingExchange {
        async fn get_block(
            &self,
            _key: &Multihash,
            _token: &CancellationToken,
        ) -> Result<Bytes, ExchangeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(b"payload"))
        }
    }

    #[tokio::test]
    async fn exchange_trait_objects_are_usable() {
        let token = CancellationToken::new();
        let key = Multihash::sha2_256(b"payload");

        let missing: Arc<dyn Exchange> = Arc::new(NeverServes);
        assert!(matches!(
            missing.get_block(&key, &token).await,
            Err(ExchangeError::NotFound(_))
        ));

        let counting: Arc<dyn Exchange> = Arc::new(CountingExchange {
            calls: AtomicUsize::new(0),
        });
        assert_eq!(&counting.get_block(&key, &token).await.unwrap()[..], b"payload");
    }
}
