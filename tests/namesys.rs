#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;

use chrono::{Duration, SecondsFormat, Utc};
use common::{NetworkRegistry, TestNode};
use dagfs::dht::{DhtConfig, RecordValidator, ValidatorRegistry};
use dagfs::keys::{KeyType, PrivateKey};
use dagfs::multihash::{Key, Multihash, IPNS_PREFIX, PK_PREFIX};
use dagfs::namesys::{
    name_system_validators, IpnsEntry, NameError, NamePublisher, NameResolver, ValidityType,
};
use prost::Message;
use tokio_util::sync::CancellationToken;

async fn name_node(registry: &Arc<NetworkRegistry>, index: u32) -> TestNode {
    TestNode::with_validators(
        registry.clone(),
        index,
        DhtConfig::default(),
        name_system_validators(),
    )
    .await
}

/// A registry that accepts any `/ipns/` record, used to smuggle records the
/// real validator would reject and exercise the resolver's own checks.
fn permissive_validators() -> ValidatorRegistry {
    let mut registry = ValidatorRegistry::new();
    registry.register(PK_PREFIX, RecordValidator::new(|_, _| Ok(())));
    registry.register(IPNS_PREFIX, RecordValidator::new(|_, _| Ok(())));
    registry
}

fn sign_entry(key: &PrivateKey, value: &str, validity: String, sequence: u64) -> IpnsEntry {
    let validity = validity.into_bytes();
    let mut data = Vec::new();
    data.extend_from_slice(value.as_bytes());
    data.extend_from_slice(&validity);
    data.extend_from_slice(b"EOL");
    IpnsEntry {
        value: value.as_bytes().to_vec(),
        signature: key.sign(&data).expect("sign"),
        validity_type: Some(ValidityType::Eol as i32),
        validity: Some(validity),
        sequence: Some(sequence),
    }
}

#[tokio::test]
async fn rsa_publish_then_resolve_round_trips() {
    let registry = Arc::new(NetworkRegistry::default());
    let node = name_node(&registry, 1).await;
    let routing = Arc::new(node.dht.clone());
    let token = CancellationToken::new();

    let signing_key = PrivateKey::generate_rsa(1024).expect("keygen");
    let value = Multihash::sha2_256(b"published content").to_base58();

    let publisher = NamePublisher::new(routing.clone());
    publisher
        .publish(&signing_key, &value, &token)
        .await
        .expect("publish");

    // A fresh resolver instance sharing the same DHT sees the record.
    let resolver = NameResolver::new(routing);
    let name = signing_key.public().peer_id().expect("peer id").to_base58();
    let resolved = resolver.resolve(&name, &token).await.expect("resolve");
    assert_eq!(resolved, value);
}

#[tokio::test]
async fn publish_replicates_across_the_network() {
    let registry = Arc::new(NetworkRegistry::default());
    let publisher_node = name_node(&registry, 1).await;
    let resolver_node = name_node(&registry, 2).await;
    publisher_node.dht.observe_peer(resolver_node.info()).await;
    resolver_node.dht.observe_peer(publisher_node.info()).await;

    let token = CancellationToken::new();
    let signing_key = PrivateKey::generate(KeyType::Ed25519).expect("keygen");
    let value = Multihash::sha2_256(b"replicated content").to_base58();

    NamePublisher::new(Arc::new(publisher_node.dht.clone()))
        .publish(&signing_key, &value, &token)
        .await
        .expect("publish");

    let resolver = NameResolver::new(Arc::new(resolver_node.dht.clone()));
    let name = signing_key.public().peer_id().expect("peer id").to_base58();
    let resolved = resolver.resolve(&name, &token).await.expect("resolve");
    assert_eq!(resolved, value);
}

#[tokio::test]
async fn republishing_updates_the_resolved_value() {
    let registry = Arc::new(NetworkRegistry::default());
    let node = name_node(&registry, 1).await;
    let routing = Arc::new(node.dht.clone());
    let token = CancellationToken::new();

    let signing_key = PrivateKey::generate(KeyType::Ed25519).expect("keygen");
    let first = Multihash::sha2_256(b"first version").to_base58();
    let second = Multihash::sha2_256(b"second version").to_base58();

    let publisher = NamePublisher::new(routing.clone());
    publisher
        .publish(&signing_key, &first, &token)
        .await
        .expect("publish first");
    publisher
        .publish(&signing_key, &second, &token)
        .await
        .expect("publish second");

    let resolver = NameResolver::new(routing);
    let name = signing_key.public().peer_id().expect("peer id").to_base58();
    let resolved = resolver.resolve(&name, &token).await.expect("resolve");
    assert_eq!(resolved, second, "higher sequence wins");
}

#[tokio::test]
async fn publishing_a_non_multihash_value_is_rejected() {
    let registry = Arc::new(NetworkRegistry::default());
    let node = name_node(&registry, 1).await;
    let token = CancellationToken::new();

    let signing_key = PrivateKey::generate(KeyType::Ed25519).expect("keygen");
    let publisher = NamePublisher::new(Arc::new(node.dht.clone()));
    let result = publisher
        .publish(&signing_key, "not a multihash", &token)
        .await;
    assert!(matches!(result, Err(NameError::InvalidValue)));
}

#[tokio::test]
async fn expired_records_fail_resolution() {
    let registry = Arc::new(NetworkRegistry::default());
    let node = TestNode::with_validators(
        registry.clone(),
        1,
        DhtConfig::default(),
        permissive_validators(),
    )
    .await;
    let token = CancellationToken::new();

    let signing_key = PrivateKey::generate(KeyType::Ed25519).expect("keygen");
    let public = signing_key.public();
    let name = public.peer_id().expect("peer id");
    let value = Multihash::sha2_256(b"stale content").to_base58();

    // A correctly signed record whose EOL passed one second ago.
    let validity =
        (Utc::now() - Duration::seconds(1)).to_rfc3339_opts(SecondsFormat::Nanos, true);
    let entry = sign_entry(&signing_key, &value, validity, 1);

    node.dht
        .put_value(
            &Key::public_key(name.as_multihash()),
            public.to_protobuf_bytes().expect("marshal"),
            &token,
        )
        .await
        .expect("store pubkey");
    node.dht
        .put_value(
            &Key::name(name.as_multihash()),
            entry.encode_to_vec(),
            &token,
        )
        .await
        .expect("store record");

    let resolver = NameResolver::new(Arc::new(node.dht.clone()));
    let result = resolver.resolve(&name.to_base58(), &token).await;
    assert!(matches!(result, Err(NameError::ExpiredRecord)));
}

#[tokio::test]
async fn resolution_rejects_public_keys_that_do_not_hash_to_the_name() {
    let registry = Arc::new(NetworkRegistry::default());
    let node = TestNode::with_validators(
        registry.clone(),
        1,
        DhtConfig::default(),
        permissive_validators(),
    )
    .await;
    let token = CancellationToken::new();

    let signing_key = PrivateKey::generate(KeyType::Ed25519).expect("keygen");
    let imposter = PrivateKey::generate(KeyType::Ed25519).expect("keygen");
    let name = signing_key.public().peer_id().expect("peer id");
    let value = Multihash::sha2_256(b"hijacked content").to_base58();

    let validity =
        (Utc::now() + Duration::hours(24)).to_rfc3339_opts(SecondsFormat::Nanos, true);
    let entry = sign_entry(&signing_key, &value, validity, 1);

    // The record key says `name`, but the stored key bytes are someone
    // else's.
    node.dht
        .put_value(
            &Key::public_key(name.as_multihash()),
            imposter.public().to_protobuf_bytes().expect("marshal"),
            &token,
        )
        .await
        .expect("store imposter pubkey");
    node.dht
        .put_value(
            &Key::name(name.as_multihash()),
            entry.encode_to_vec(),
            &token,
        )
        .await
        .expect("store record");

    let resolver = NameResolver::new(Arc::new(node.dht.clone()));
    let result = resolver.resolve(&name.to_base58(), &token).await;
    assert!(matches!(result, Err(NameError::KeyMismatch(_))));
}

#[tokio::test]
async fn dht_rejects_expired_records_at_ingest() {
    let registry = Arc::new(NetworkRegistry::default());
    let node = name_node(&registry, 1).await;
    let token = CancellationToken::new();

    let signing_key = PrivateKey::generate(KeyType::Ed25519).expect("keygen");
    let name = signing_key.public().peer_id().expect("peer id");
    let value = Multihash::sha2_256(b"already stale").to_base58();
    let validity =
        (Utc::now() - Duration::seconds(1)).to_rfc3339_opts(SecondsFormat::Nanos, true);
    let entry = sign_entry(&signing_key, &value, validity, 1);

    let result = node
        .dht
        .put_value(
            &Key::name(name.as_multihash()),
            entry.encode_to_vec(),
            &token,
        )
        .await;
    assert!(result.is_err(), "validator refuses the expired record");
}
