#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{make_peer, NetworkRegistry, TestNode};
use dagfs::dht::{DhtConfig, DhtError};
use dagfs::multihash::{Key, Multihash};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn content_key(data: &[u8]) -> Key {
    Key::block(&Multihash::sha2_256(data))
}

async fn mesh(nodes: &[&TestNode]) {
    for a in nodes {
        for b in nodes {
            if a.dht.id() != b.dht.id() {
                a.dht.observe_peer(b.info()).await;
            }
        }
    }
}

#[tokio::test]
async fn put_value_replicates_and_get_value_finds_it() {
    let registry = Arc::new(NetworkRegistry::default());
    let writer = TestNode::new(registry.clone(), 1, DhtConfig::default()).await;
    let holder = TestNode::new(registry.clone(), 2, DhtConfig::default()).await;
    let reader = TestNode::new(registry.clone(), 3, DhtConfig::default()).await;
    mesh(&[&writer, &holder, &reader]).await;

    let token = CancellationToken::new();
    let key = content_key(b"shared record");
    writer
        .dht
        .put_value(&key, b"shared record".to_vec(), &token)
        .await
        .expect("put succeeds");

    let value = reader
        .dht
        .get_value(&key, &token)
        .await
        .expect("get succeeds");
    assert_eq!(value, b"shared record");
}

#[tokio::test]
async fn get_value_short_circuits_on_local_records() {
    let registry = Arc::new(NetworkRegistry::default());
    let node = TestNode::new(registry.clone(), 1, DhtConfig::default()).await;

    let token = CancellationToken::new();
    let key = content_key(b"local only");
    node.dht
        .put_value(&key, b"local only".to_vec(), &token)
        .await
        .expect("put succeeds without peers");

    // No peers were ever contacted.
    let value = node.dht.get_value(&key, &token).await.expect("local hit");
    assert_eq!(value, b"local only");
    assert_eq!(node.network.contacted_peers().await, 0);
}

#[tokio::test]
async fn queries_terminate_when_peers_return_nothing() {
    let registry = Arc::new(NetworkRegistry::default());
    let asker = TestNode::new(registry.clone(), 1, DhtConfig::default()).await;
    // Peers exist but know nobody, so every reply is an empty closer set.
    let blank_one = TestNode::new(registry.clone(), 2, DhtConfig::default()).await;
    let blank_two = TestNode::new(registry.clone(), 3, DhtConfig::default()).await;
    asker.dht.observe_peer(blank_one.info()).await;
    asker.dht.observe_peer(blank_two.info()).await;

    let token = CancellationToken::new();
    let key = content_key(b"nobody has this");
    let result = timeout(
        Duration::from_secs(5),
        asker.dht.get_value(&key, &token),
    )
    .await
    .expect("query terminates promptly");
    assert!(matches!(result, Err(DhtError::NotFound)));
}

#[tokio::test]
async fn cancelled_queries_return_cancelled() {
    let registry = Arc::new(NetworkRegistry::default());
    let asker = TestNode::new(registry.clone(), 1, DhtConfig::default()).await;
    let peer = TestNode::new(registry.clone(), 2, DhtConfig::default()).await;
    asker.dht.observe_peer(peer.info()).await;

    let token = CancellationToken::new();
    token.cancel();
    let key = content_key(b"never fetched");
    let result = asker.dht.get_value(&key, &token).await;
    assert!(matches!(result, Err(DhtError::Cancelled)));
}

#[tokio::test]
async fn transient_peer_failures_are_not_surfaced() {
    let registry = Arc::new(NetworkRegistry::default());
    let writer = TestNode::new(registry.clone(), 1, DhtConfig::default()).await;
    let flaky = TestNode::new(registry.clone(), 2, DhtConfig::default()).await;
    let stable = TestNode::new(registry.clone(), 3, DhtConfig::default()).await;
    mesh(&[&writer, &flaky, &stable]).await;

    writer.network.set_failure(flaky.info().id, true).await;

    let token = CancellationToken::new();
    let key = content_key(b"resilient record");
    writer
        .dht
        .put_value(&key, b"resilient record".to_vec(), &token)
        .await
        .expect("put survives one failing peer");

    let value = stable
        .dht
        .get_value(&key, &token)
        .await
        .expect("record reached the stable peer");
    assert_eq!(value, b"resilient record");
}

#[tokio::test]
async fn find_providers_yields_each_peer_once_and_honors_count() {
    let registry = Arc::new(NetworkRegistry::default());
    let seeker = TestNode::new(registry.clone(), 1, DhtConfig::default()).await;
    let provider_one = TestNode::new(registry.clone(), 2, DhtConfig::default()).await;
    let provider_two = TestNode::new(registry.clone(), 3, DhtConfig::default()).await;
    let bystander = TestNode::new(registry.clone(), 4, DhtConfig::default()).await;
    mesh(&[&seeker, &provider_one, &provider_two, &bystander]).await;

    let token = CancellationToken::new();
    let key = content_key(b"popular content");
    provider_one
        .dht
        .provide(&key, &token)
        .await
        .expect("provide");
    provider_two
        .dht
        .provide(&key, &token)
        .await
        .expect("provide");

    let mut stream = seeker.dht.find_providers(key.clone(), 10, token.clone());
    let mut found = Vec::new();
    while let Some(peer) = stream.recv().await {
        found.push(peer.id.clone());
    }

    let unique: std::collections::HashSet<_> = found.iter().cloned().collect();
    assert_eq!(found.len(), unique.len(), "no peer is yielded twice");
    assert!(unique.contains(&provider_one.info().id));
    assert!(unique.contains(&provider_two.info().id));

    // A bounded request closes after exactly `count` providers.
    let mut bounded = seeker.dht.find_providers(key, 1, token);
    let first = bounded.recv().await;
    assert!(first.is_some());
    assert!(bounded.recv().await.is_none());
}

#[tokio::test]
async fn find_peer_walks_closer_peers_to_the_target() {
    let registry = Arc::new(NetworkRegistry::default());
    let seeker = TestNode::new(registry.clone(), 1, DhtConfig::default()).await;
    let relay = TestNode::new(registry.clone(), 2, DhtConfig::default()).await;
    let distant = TestNode::new(registry.clone(), 3, DhtConfig::default()).await;

    // The seeker only knows the relay; the relay knows the target.
    seeker.dht.observe_peer(relay.info()).await;
    relay.dht.observe_peer(seeker.info()).await;
    relay.dht.observe_peer(distant.info()).await;

    let token = CancellationToken::new();
    let found = seeker
        .dht
        .find_peer(&distant.info().id, &token)
        .await
        .expect("peer found");
    assert_eq!(found.id, distant.info().id);
    assert_eq!(found.addr, distant.info().addr);

    let ghost = make_peer(99);
    let missing = seeker.dht.find_peer(&ghost.id, &token).await;
    assert!(matches!(missing, Err(DhtError::NotFound)));
}

#[tokio::test]
async fn unresponsive_incumbents_are_replaced_after_failed_ping() {
    let registry = Arc::new(NetworkRegistry::default());
    let config = DhtConfig {
        k: 1,
        ..DhtConfig::default()
    };
    let main = TestNode::new(registry.clone(), 1, config.clone()).await;
    let incumbent = TestNode::new(registry.clone(), 2, config.clone()).await;
    let newcomer = TestNode::new(registry.clone(), 3, config).await;

    main.dht.observe_peer(incumbent.info()).await;
    main.network.set_failure(incumbent.info().id, true).await;
    main.dht.observe_peer(newcomer.info()).await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    let pings = main.network.ping_calls().await;
    assert!(pings.contains(&incumbent.info().id), "incumbent was pinged");
}
