//! Signed mutable names (IPNS) over the DHT.
//!
//! A name is the base58 multihash of a public key. Publishing stores two
//! records: the raw public-key bytes at `/pk/<name>` and a signed
//! [`IpnsEntry`] at `/ipns/<name>`. Resolution is verifiable offline from
//! bytes alone: the public key must hash back to the name, the signature
//! must check out against `value || validity || "EOL"`, and the EOL window
//! must not have passed. When several valid records surface, the highest
//! sequence number wins, with the later validity timestamp breaking ties.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use prost::Message;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dht::{Dht, DhtError, DhtNetwork, RecordValidator, ValidatorRegistry};
use crate::keys::{KeyError, PeerId, PrivateKey, PublicKey};
use crate::multihash::{Key, Multihash, IPNS_PREFIX, PK_PREFIX};

/// How long a published record stays valid.
const RECORD_LIFETIME_HOURS: i64 = 24;

/// Validity schemes for name records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ValidityType {
    /// Record is valid until the timestamp in `validity` passes.
    Eol = 0,
}

/// The signed name record stored at `/ipns/<name>`.
#[derive(Clone, PartialEq, Message)]
pub struct IpnsEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub value: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
    #[prost(enumeration = "ValidityType", optional, tag = "3")]
    pub validity_type: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub validity: Option<Vec<u8>>,
    #[prost(uint64, optional, tag = "5")]
    pub sequence: Option<u64>,
}

#[derive(Debug, Error)]
pub enum NameError {
    #[error("publish value must be a base58 multihash string")]
    InvalidValue,
    #[error("expired record")]
    ExpiredRecord,
    #[error("unrecognized validity type")]
    UnrecognizedValidity,
    #[error("record not signed by the key for this name")]
    InvalidSignature,
    #[error("public key does not hash to name {0}")]
    KeyMismatch(String),
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("routing: {0}")]
    Routing(#[from] DhtError),
}

/// The slice of the DHT the name system depends on. Kept narrow so tests
/// can share one engine between publisher and resolver instances.
#[async_trait]
pub trait ValueRouting: Send + Sync + 'static {
    async fn put_value(
        &self,
        key: &Key,
        value: Vec<u8>,
        token: &CancellationToken,
    ) -> Result<(), DhtError>;

    async fn get_value(&self, key: &Key, token: &CancellationToken) -> Result<Vec<u8>, DhtError>;
}

#[async_trait]
impl<N: DhtNetwork> ValueRouting for Dht<N> {
    async fn put_value(
        &self,
        key: &Key,
        value: Vec<u8>,
        token: &CancellationToken,
    ) -> Result<(), DhtError> {
        Dht::put_value(self, key, value, token).await
    }

    async fn get_value(&self, key: &Key, token: &CancellationToken) -> Result<Vec<u8>, DhtError> {
        Dht::get_value(self, key, token).await
    }
}

/// The bytes a record's signature covers: `value || validity || "EOL"`.
fn entry_data_for_sig(value: &[u8], validity: &[u8], validity_type: ValidityType) -> Vec<u8> {
    let type_str: &[u8] = match validity_type {
        ValidityType::Eol => b"EOL",
    };
    let mut data = Vec::with_capacity(value.len() + validity.len() + type_str.len());
    data.extend_from_slice(value);
    data.extend_from_slice(validity);
    data.extend_from_slice(type_str);
    data
}

fn decode_entry(bytes: &[u8]) -> Result<IpnsEntry, NameError> {
    IpnsEntry::decode(bytes).map_err(|e| NameError::MalformedRecord(e.to_string()))
}

/// Check a record's validity window. Fails with [`NameError::ExpiredRecord`]
/// past EOL and [`NameError::UnrecognizedValidity`] for unknown schemes.
fn check_validity(entry: &IpnsEntry) -> Result<(), NameError> {
    match ValidityType::try_from(entry.validity_type.unwrap_or_default()) {
        Ok(ValidityType::Eol) => {
            let validity = entry.validity.as_deref().unwrap_or_default();
            let text = std::str::from_utf8(validity)
                .map_err(|e| NameError::MalformedRecord(e.to_string()))?;
            let eol = DateTime::parse_from_rfc3339(text)
                .map_err(|e| NameError::MalformedRecord(e.to_string()))?;
            if Utc::now() > eol {
                return Err(NameError::ExpiredRecord);
            }
            Ok(())
        }
        Err(_) => Err(NameError::UnrecognizedValidity),
    }
}

/// Build and sign a record for `value`, valid for the standard lifetime.
fn create_entry(key: &PrivateKey, value: &str, sequence: u64) -> Result<IpnsEntry, NameError> {
    let validity = (Utc::now() + Duration::hours(RECORD_LIFETIME_HOURS))
        .to_rfc3339_opts(SecondsFormat::Nanos, true)
        .into_bytes();
    let signature = key.sign(&entry_data_for_sig(
        value.as_bytes(),
        &validity,
        ValidityType::Eol,
    ))?;
    Ok(IpnsEntry {
        value: value.as_bytes().to_vec(),
        signature,
        validity_type: Some(ValidityType::Eol as i32),
        validity: Some(validity),
        sequence: Some(sequence),
    })
}

/// Publishes name records to the routing system.
pub struct NamePublisher<R: ValueRouting> {
    routing: Arc<R>,
    sequences: Mutex<HashMap<PeerId, u64>>,
}

impl<R: ValueRouting> NamePublisher<R> {
    pub fn new(routing: Arc<R>) -> Self {
        Self {
            routing,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Publish `value` (a base58 multihash string) under the name derived
    /// from `key`'s public half.
    pub async fn publish(
        &self,
        key: &PrivateKey,
        value: &str,
        token: &CancellationToken,
    ) -> Result<(), NameError> {
        // The published value must itself be a content reference.
        Multihash::from_base58(value).map_err(|_| NameError::InvalidValue)?;

        let public = key.public();
        let pk_bytes = public.to_protobuf_bytes()?;
        let name = public.peer_id()?;

        let sequence = {
            let mut sequences = self.sequences.lock().await;
            let next = sequences.get(&name).copied().unwrap_or(0) + 1;
            sequences.insert(name.clone(), next);
            next
        };
        let entry = create_entry(key, value, sequence)?;
        debug!(name = %name, value, sequence, "publishing name record");

        // Public key first so resolvers can always authenticate the record.
        self.routing
            .put_value(&Key::public_key(name.as_multihash()), pk_bytes, token)
            .await?;
        self.routing
            .put_value(
                &Key::name(name.as_multihash()),
                entry.encode_to_vec(),
                token,
            )
            .await?;
        Ok(())
    }
}

/// Resolves names published to the routing system.
pub struct NameResolver<R: ValueRouting> {
    routing: Arc<R>,
}

impl<R: ValueRouting> NameResolver<R> {
    pub fn new(routing: Arc<R>) -> Self {
        Self { routing }
    }

    /// Resolve a base58 name to its published value.
    pub async fn resolve(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<String, NameError> {
        let hash = Multihash::from_base58(name).map_err(|_| NameError::InvalidValue)?;

        let record_bytes = self.routing.get_value(&Key::name(&hash), token).await?;
        let entry = decode_entry(&record_bytes)?;

        // The key is self-authenticating: it must hash back to the name.
        let pk_bytes = self
            .routing
            .get_value(&Key::public_key(&hash), token)
            .await?;
        if Multihash::sha2_256(&pk_bytes) != hash {
            return Err(NameError::KeyMismatch(name.to_string()));
        }
        let public = PublicKey::from_protobuf_bytes(&pk_bytes)?;

        verify_entry(&entry, &public)?;
        check_validity(&entry)?;

        String::from_utf8(entry.value).map_err(|e| NameError::MalformedRecord(e.to_string()))
    }
}

/// Verify a record's signature against a public key.
fn verify_entry(entry: &IpnsEntry, public: &PublicKey) -> Result<(), NameError> {
    let validity_type = ValidityType::try_from(entry.validity_type.unwrap_or_default())
        .map_err(|_| NameError::UnrecognizedValidity)?;
    let data = entry_data_for_sig(
        &entry.value,
        entry.validity.as_deref().unwrap_or_default(),
        validity_type,
    );
    if !public.verify(&data, &entry.signature) {
        return Err(NameError::InvalidSignature);
    }
    Ok(())
}

// ── Record validation and selection for the DHT ─────────────────────────

/// Validate a `/pk/` record: the bytes must hash to the key's multihash.
pub fn validate_public_key_record(key: &Key, value: &[u8]) -> anyhow::Result<()> {
    let Some(name) = key.suffix_multihash() else {
        anyhow::bail!("public key record under malformed key");
    };
    if Multihash::sha2_256(value) != name {
        anyhow::bail!("public key does not hash to its record key");
    }
    Ok(())
}

/// Validate an `/ipns/` record: well-formed and inside its validity window.
/// The signature is checked by the resolver once the public key is known.
pub fn validate_ipns_record(_key: &Key, value: &[u8]) -> anyhow::Result<()> {
    let entry = decode_entry(value)?;
    check_validity(&entry)?;
    Ok(())
}

/// Choose among several valid records: highest sequence wins, ties broken
/// by the later validity timestamp.
pub fn select_ipns_record(_key: &Key, values: &[Vec<u8>]) -> usize {
    fn rank(bytes: &[u8]) -> (u64, Option<DateTime<Utc>>) {
        let Ok(entry) = decode_entry(bytes) else {
            return (0, None);
        };
        let eol = entry
            .validity
            .as_deref()
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        (entry.sequence.unwrap_or(0), eol)
    }

    values
        .iter()
        .enumerate()
        .max_by_key(|(_, bytes)| rank(bytes))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

/// The validator set a name-serving DHT node registers: `/pk/` and
/// `/ipns/` with the sequence/validity selector.
pub fn name_system_validators() -> ValidatorRegistry {
    let mut registry = ValidatorRegistry::new();
    registry.register(PK_PREFIX, RecordValidator::new(validate_public_key_record));
    registry.register(
        IPNS_PREFIX,
        RecordValidator::new(validate_ipns_record).with_selector(select_ipns_record),
    );
    registry
}
