//! Signing keypairs and peer identity.
//!
//! Keys come in two flavours, RSA and Ed25519, behind tagged variants with a
//! common capability set: sign, verify, and a stable protobuf marshalling
//! (`<type code><key bytes>`). A peer's identity is self-authenticating: the
//! [`PeerId`] is the SHA-256 multihash of the marshalled public key, so
//! anyone holding the key bytes can recompute and check the ID offline.

use std::fmt;

use ed25519_dalek::{Signer as _, Verifier as _};
use prost::Message;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::signature::{SignatureEncoding, Signer as _, Verifier as _};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::multihash::Multihash;

/// Default modulus size for generated RSA keys.
pub const RSA_DEFAULT_BITS: usize = 2048;

/// Wire type codes for the protobuf key envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum KeyType {
    Rsa = 0,
    Ed25519 = 1,
}

/// The protobuf envelope shared by public and private keys:
/// `message Key { required KeyType Type = 1; required bytes Data = 2; }`
#[derive(Clone, PartialEq, Message)]
struct KeyProto {
    #[prost(enumeration = "KeyType", tag = "1")]
    key_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    data: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid or unsupported key type: {0}")]
    BadKeyType(i32),
    #[error("malformed key bytes: {0}")]
    MalformedKey(String),
    #[error("key generation failed: {0}")]
    Generation(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// A signing private key.
#[derive(Clone)]
pub enum PrivateKey {
    Rsa(RsaPrivateKey),
    Ed25519(ed25519_dalek::SigningKey),
}

/// A verifying public key.
#[derive(Clone, PartialEq)]
pub enum PublicKey {
    Rsa(RsaPublicKey),
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl PrivateKey {
    /// Generate a fresh keypair of the given type.
    ///
    /// RSA uses [`RSA_DEFAULT_BITS`]; see [`PrivateKey::generate_rsa`] for
    /// other modulus sizes.
    pub fn generate(key_type: KeyType) -> Result<Self, KeyError> {
        match key_type {
            KeyType::Rsa => Self::generate_rsa(RSA_DEFAULT_BITS),
            KeyType::Ed25519 => {
                let sk = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
                Ok(PrivateKey::Ed25519(sk))
            }
        }
    }

    pub fn generate_rsa(bits: usize) -> Result<Self, KeyError> {
        let sk = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        Ok(PrivateKey::Rsa(sk))
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            PrivateKey::Rsa(_) => KeyType::Rsa,
            PrivateKey::Ed25519(_) => KeyType::Ed25519,
        }
    }

    /// The public half of this keypair.
    pub fn public(&self) -> PublicKey {
        match self {
            PrivateKey::Rsa(sk) => PublicKey::Rsa(RsaPublicKey::from(sk)),
            PrivateKey::Ed25519(sk) => PublicKey::Ed25519(sk.verifying_key()),
        }
    }

    /// Sign `data`. RSA signs PKCS#1 v1.5 over SHA-256; Ed25519 signs the
    /// message directly.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        match self {
            PrivateKey::Rsa(sk) => {
                let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(sk.clone());
                let sig = signer
                    .try_sign(data)
                    .map_err(|e| KeyError::Signing(e.to_string()))?;
                Ok(sig.to_vec())
            }
            PrivateKey::Ed25519(sk) => Ok(sk.sign(data).to_bytes().to_vec()),
        }
    }

    /// Serialize to the protobuf envelope.
    pub fn to_protobuf_bytes(&self) -> Result<Vec<u8>, KeyError> {
        let data = match self {
            PrivateKey::Rsa(sk) => sk
                .to_pkcs1_der()
                .map_err(|e| KeyError::MalformedKey(e.to_string()))?
                .as_bytes()
                .to_vec(),
            // Secret seed followed by the public key, 64 bytes total.
            PrivateKey::Ed25519(sk) => {
                let mut bytes = sk.to_bytes().to_vec();
                bytes.extend_from_slice(sk.verifying_key().as_bytes());
                bytes
            }
        };
        let envelope = KeyProto {
            key_type: self.key_type() as i32,
            data,
        };
        Ok(envelope.encode_to_vec())
    }

    /// Deserialize from the protobuf envelope, dispatching on the type code.
    pub fn from_protobuf_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let envelope =
            KeyProto::decode(bytes).map_err(|e| KeyError::MalformedKey(e.to_string()))?;
        match KeyType::try_from(envelope.key_type) {
            Ok(KeyType::Rsa) => {
                let sk = RsaPrivateKey::from_pkcs1_der(&envelope.data)
                    .map_err(|e| KeyError::MalformedKey(e.to_string()))?;
                Ok(PrivateKey::Rsa(sk))
            }
            Ok(KeyType::Ed25519) => {
                if envelope.data.len() != 64 {
                    return Err(KeyError::MalformedKey(format!(
                        "ed25519 private key must be 64 bytes, got {}",
                        envelope.data.len()
                    )));
                }
                let seed: [u8; 32] = envelope.data[..32].try_into().expect("checked length");
                Ok(PrivateKey::Ed25519(ed25519_dalek::SigningKey::from_bytes(
                    &seed,
                )))
            }
            Err(_) => Err(KeyError::BadKeyType(envelope.key_type)),
        }
    }
}

impl PublicKey {
    pub fn key_type(&self) -> KeyType {
        match self {
            PublicKey::Rsa(_) => KeyType::Rsa,
            PublicKey::Ed25519(_) => KeyType::Ed25519,
        }
    }

    /// Verify `sig` over `data`. A malformed signature verifies as false.
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> bool {
        match self {
            PublicKey::Rsa(pk) => {
                let Ok(sig) = rsa::pkcs1v15::Signature::try_from(sig) else {
                    return false;
                };
                let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(pk.clone());
                verifier.verify(data, &sig).is_ok()
            }
            PublicKey::Ed25519(pk) => {
                let Ok(sig) = ed25519_dalek::Signature::from_slice(sig) else {
                    return false;
                };
                pk.verify(data, &sig).is_ok()
            }
        }
    }

    /// Serialize to the protobuf envelope. This is the byte form peer IDs
    /// are derived from, so it must stay stable.
    pub fn to_protobuf_bytes(&self) -> Result<Vec<u8>, KeyError> {
        let data = match self {
            PublicKey::Rsa(pk) => pk
                .to_pkcs1_der()
                .map_err(|e| KeyError::MalformedKey(e.to_string()))?
                .as_bytes()
                .to_vec(),
            PublicKey::Ed25519(pk) => pk.as_bytes().to_vec(),
        };
        let envelope = KeyProto {
            key_type: self.key_type() as i32,
            data,
        };
        Ok(envelope.encode_to_vec())
    }

    pub fn from_protobuf_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let envelope =
            KeyProto::decode(bytes).map_err(|e| KeyError::MalformedKey(e.to_string()))?;
        match KeyType::try_from(envelope.key_type) {
            Ok(KeyType::Rsa) => {
                let pk = RsaPublicKey::from_pkcs1_der(&envelope.data)
                    .map_err(|e| KeyError::MalformedKey(e.to_string()))?;
                Ok(PublicKey::Rsa(pk))
            }
            Ok(KeyType::Ed25519) => {
                let bytes: [u8; 32] = envelope.data.as_slice().try_into().map_err(|_| {
                    KeyError::MalformedKey(format!(
                        "ed25519 public key must be 32 bytes, got {}",
                        envelope.data.len()
                    ))
                })?;
                let pk = ed25519_dalek::VerifyingKey::from_bytes(&bytes)
                    .map_err(|e| KeyError::MalformedKey(e.to_string()))?;
                Ok(PublicKey::Ed25519(pk))
            }
            Err(_) => Err(KeyError::BadKeyType(envelope.key_type)),
        }
    }

    /// The self-authenticating peer ID: the SHA-256 multihash of the
    /// marshalled public key.
    pub fn peer_id(&self) -> Result<PeerId, KeyError> {
        Ok(PeerId(Multihash::sha2_256(&self.to_protobuf_bytes()?)))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({:?})", self.key_type())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({:?})", self.key_type())
    }
}

/// A peer's identity: the multihash of its serialized public key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub Multihash);

impl PeerId {
    pub fn from_base58(s: &str) -> Result<Self, crate::multihash::MultihashError> {
        Ok(PeerId(Multihash::from_base58(s)?))
    }

    pub fn to_base58(&self) -> String {
        self.0.to_base58()
    }

    pub fn as_multihash(&self) -> &Multihash {
        &self.0
    }

    /// The 256-bit routing target: the raw digest of the ID multihash.
    pub fn dht_target(&self) -> [u8; 32] {
        crate::multihash::Key::block(&self.0).dht_target()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_base58())
    }
}
