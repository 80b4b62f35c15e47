//! Local block storage: a mapping from multihash to opaque payload.
//!
//! Two implementations are provided. [`MemoryBlockStore`] keeps blocks in a
//! map guarded by an async mutex and backs tests and short-lived nodes.
//! [`FsBlockStore`] writes one file per block under a directory sharded by a
//! two-character base58 prefix, with write-then-rename so a crash never
//! leaves a half-written block visible. Writes are idempotent by content
//! address.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::trace;

use crate::multihash::Multihash;

#[derive(Debug, Error)]
pub enum BlockStoreError {
    #[error("block not found: {0}")]
    NotFound(Multihash),
    #[error("block store I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// A content-addressed block: the multihash of `data` plus the bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    key: Multihash,
    data: Bytes,
}

impl Block {
    /// Hash `data` and wrap it as a block.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let key = Multihash::sha2_256(&data);
        Self { key, data }
    }

    /// Wrap bytes received from elsewhere under a key the caller already
    /// verified.
    pub fn with_key(key: Multihash, data: impl Into<Bytes>) -> Self {
        Self {
            key,
            data: data.into(),
        }
    }

    pub fn key(&self) -> &Multihash {
        &self.key
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// The local block mapping the DAG and the DHT both consume.
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    async fn get(&self, key: &Multihash) -> Result<Bytes, BlockStoreError>;
    async fn put(&self, block: Block) -> Result<(), BlockStoreError>;
    async fn has(&self, key: &Multihash) -> Result<bool, BlockStoreError>;
    async fn delete(&self, key: &Multihash) -> Result<(), BlockStoreError>;
    /// Every key currently stored. Used by the GC sweep.
    async fn keys(&self) -> Result<Vec<Multihash>, BlockStoreError>;
}

/// In-memory block store.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<HashMap<Multihash, Bytes>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn get(&self, key: &Multihash) -> Result<Bytes, BlockStoreError> {
        let blocks = self.blocks.lock().await;
        blocks
            .get(key)
            .cloned()
            .ok_or_else(|| BlockStoreError::NotFound(key.clone()))
    }

    async fn put(&self, block: Block) -> Result<(), BlockStoreError> {
        let mut blocks = self.blocks.lock().await;
        blocks.insert(block.key, block.data);
        Ok(())
    }

    async fn has(&self, key: &Multihash) -> Result<bool, BlockStoreError> {
        let blocks = self.blocks.lock().await;
        Ok(blocks.contains_key(key))
    }

    async fn delete(&self, key: &Multihash) -> Result<(), BlockStoreError> {
        let mut blocks = self.blocks.lock().await;
        blocks.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<Multihash>, BlockStoreError> {
        let blocks = self.blocks.lock().await;
        Ok(blocks.keys().cloned().collect())
    }
}

/// On-disk block store: one file per block, sharded by base58 prefix.
pub struct FsBlockStore {
    root: PathBuf,
}

impl FsBlockStore {
    /// Open (creating if needed) a block store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, BlockStoreError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn block_path(&self, key: &Multihash) -> PathBuf {
        let b58 = key.to_base58();
        let shard = &b58[..2.min(b58.len())];
        self.root.join(shard).join(format!("{b58}.data"))
    }
}

#[async_trait]
impl BlockStore for FsBlockStore {
    async fn get(&self, key: &Multihash) -> Result<Bytes, BlockStoreError> {
        match tokio::fs::read(self.block_path(key)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlockStoreError::NotFound(key.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, block: Block) -> Result<(), BlockStoreError> {
        let path = self.block_path(block.key());
        let dir = path.parent().expect("block path has a shard directory");
        tokio::fs::create_dir_all(dir).await?;

        // Stage into a temp file in the same directory, then rename into
        // place so readers only ever observe complete blocks.
        let tmp = dir.join(format!(".tmp-{}", block.key().to_base58()));
        tokio::fs::write(&tmp, block.data()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        trace!(key = %block.key(), len = block.data().len(), "block written");
        Ok(())
    }

    async fn has(&self, key: &Multihash) -> Result<bool, BlockStoreError> {
        Ok(tokio::fs::try_exists(self.block_path(key)).await?)
    }

    async fn delete(&self, key: &Multihash) -> Result<(), BlockStoreError> {
        match tokio::fs::remove_file(self.block_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<Multihash>, BlockStoreError> {
        let mut keys = Vec::new();
        let mut shards = tokio::fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(b58) = name.strip_suffix(".data") else {
                    continue;
                };
                if let Ok(key) = Multihash::from_base58(b58) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }
}
