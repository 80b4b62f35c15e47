//! Self-describing hashes and the DHT keyspace.
//!
//! Every identifier in the system is a [`Multihash`]: a length-prefixed hash
//! container `<code><length><digest>` whose canonical textual form is the
//! base58 encoding of the full tuple. Block keys, peer IDs, and name-record
//! keys are all multihashes, so equality is always plain byte equality.
//!
//! [`Key`] wraps the raw byte strings used to address DHT records. A key is
//! either a bare multihash (content blocks) or a namespaced entry such as
//! `/pk/<multihash>` or `/ipns/<multihash>`.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Multihash function code for SHA-256.
pub const SHA2_256_CODE: u64 = 0x12;

/// Digest length of SHA-256 in bytes.
pub const SHA2_256_LEN: usize = 0x20;

/// Namespace prefix for public-key records.
pub const PK_PREFIX: &str = "/pk/";

/// Namespace prefix for signed name records.
pub const IPNS_PREFIX: &str = "/ipns/";

/// Errors produced while parsing or constructing multihashes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MultihashError {
    #[error("multihash too short: {0} bytes")]
    TooShort(usize),
    #[error("digest length mismatch: header says {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("unknown hash function code: {0:#x}")]
    UnknownCode(u64),
    #[error("invalid base58 string")]
    InvalidBase58,
}

fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn read_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// A self-describing hash: `<code: varint><length: varint><digest>`.
///
/// The canonical textual form is base58 of the full tuple, which is also what
/// [`fmt::Display`] produces.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multihash {
    bytes: Vec<u8>,
}

impl Multihash {
    /// Wrap a precomputed digest with its function code.
    pub fn wrap(code: u64, digest: &[u8]) -> Result<Self, MultihashError> {
        if code != SHA2_256_CODE {
            return Err(MultihashError::UnknownCode(code));
        }
        let mut bytes = Vec::with_capacity(digest.len() + 4);
        write_uvarint(&mut bytes, code);
        write_uvarint(&mut bytes, digest.len() as u64);
        bytes.extend_from_slice(digest);
        Ok(Self { bytes })
    }

    /// Hash `data` with SHA-256 and wrap the digest.
    pub fn sha2_256(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Self::wrap(SHA2_256_CODE, &digest).expect("sha2-256 is a known code")
    }

    /// Parse a multihash from its raw byte form, validating the framing.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MultihashError> {
        let (code, n) = read_uvarint(bytes).ok_or(MultihashError::TooShort(bytes.len()))?;
        let rest = &bytes[n..];
        let (length, m) = read_uvarint(rest).ok_or(MultihashError::TooShort(bytes.len()))?;
        let digest = &rest[m..];
        if digest.len() != length as usize {
            return Err(MultihashError::LengthMismatch {
                expected: length as usize,
                actual: digest.len(),
            });
        }
        if code != SHA2_256_CODE {
            return Err(MultihashError::UnknownCode(code));
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Parse the canonical base58 text form.
    pub fn from_base58(s: &str) -> Result<Self, MultihashError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| MultihashError::InvalidBase58)?;
        Self::from_bytes(&bytes)
    }

    /// The full `<code><length><digest>` byte string.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The hash function code.
    pub fn code(&self) -> u64 {
        read_uvarint(&self.bytes).map(|(code, _)| code).unwrap_or(0)
    }

    /// The raw digest, without the code/length header.
    pub fn digest(&self) -> &[u8] {
        let (_, n) = read_uvarint(&self.bytes).expect("validated on construction");
        let (_, m) = read_uvarint(&self.bytes[n..]).expect("validated on construction");
        &self.bytes[n + m..]
    }

    /// Canonical base58 text form of the full tuple.
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.bytes).into_string()
    }
}

impl fmt::Display for Multihash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for Multihash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multihash({})", self.to_base58())
    }
}

/// A DHT record key: a bare block multihash or a namespaced entry.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key {
    bytes: Vec<u8>,
}

impl Key {
    /// Key addressing a content block.
    pub fn block(hash: &Multihash) -> Self {
        Self {
            bytes: hash.as_bytes().to_vec(),
        }
    }

    /// Key addressing the raw public-key bytes for `name`.
    pub fn public_key(name: &Multihash) -> Self {
        let mut bytes = PK_PREFIX.as_bytes().to_vec();
        bytes.extend_from_slice(name.as_bytes());
        Self { bytes }
    }

    /// Key addressing the signed name record for `name`.
    pub fn name(name: &Multihash) -> Self {
        let mut bytes = IPNS_PREFIX.as_bytes().to_vec();
        bytes.extend_from_slice(name.as_bytes());
        Self { bytes }
    }

    /// Reconstruct a key received over the wire.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The namespace prefix (`/pk/`, `/ipns/`), if any.
    pub fn prefix(&self) -> Option<&'static str> {
        for prefix in [PK_PREFIX, IPNS_PREFIX] {
            if self.bytes.starts_with(prefix.as_bytes()) {
                return Some(prefix);
            }
        }
        None
    }

    /// The multihash following the namespace prefix, if this is a
    /// namespaced key.
    pub fn suffix_multihash(&self) -> Option<Multihash> {
        let prefix = self.prefix()?;
        Multihash::from_bytes(&self.bytes[prefix.len()..]).ok()
    }

    /// The 256-bit lookup target for XOR distance.
    ///
    /// A bare multihash key contributes its raw SHA-256 digest; every other
    /// key is hashed first so the whole keyspace lives in one distance space.
    pub fn dht_target(&self) -> [u8; 32] {
        if let Ok(mh) = Multihash::from_bytes(&self.bytes) {
            if mh.digest().len() == 32 {
                let mut out = [0u8; 32];
                out.copy_from_slice(mh.digest());
                return out;
            }
        }
        let digest = Sha256::digest(&self.bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }
}

impl From<&Multihash> for Key {
    fn from(hash: &Multihash) -> Self {
        Key::block(hash)
    }
}

// Namespaced keys render as "/<ns>/<b58>", bare keys as base58.
impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.prefix(), self.suffix_multihash()) {
            (Some(prefix), Some(mh)) => write!(f, "{}{}", prefix, mh),
            _ => f.write_str(&bs58::encode(&self.bytes).into_string()),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}
