//! Pinning and garbage collection.
//!
//! A pin is a GC root. Direct pins protect a single block; recursive pins
//! protect a node and its whole transitive subtree. The sweep deletes every
//! block the pin roots cannot reach. Pin roots persist in a JSON file next
//! to the block store, rewritten with temp-then-rename so a crash never
//! truncates the set.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::blockstore::BlockStore;
use crate::dag::{DagError, DagService};
use crate::multihash::Multihash;

#[derive(Debug, Error)]
pub enum PinError {
    #[error("not pinned: {0}")]
    NotPinned(Multihash),
    #[error(transparent)]
    Dag(#[from] DagError),
    #[error("pins file I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed pins file: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// On-disk shape of the pins file: base58 roots per pin mode.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PinFile {
    direct: Vec<String>,
    recursive: Vec<String>,
}

#[derive(Debug, Default)]
struct PinSets {
    direct: HashSet<Multihash>,
    recursive: HashSet<Multihash>,
}

/// Tracks pin roots and sweeps unreachable blocks.
pub struct Pinner<S: BlockStore> {
    dag: Arc<DagService<S>>,
    sets: Mutex<PinSets>,
    path: Option<PathBuf>,
}

impl<S: BlockStore> Pinner<S> {
    /// An in-memory pinner with no persistence.
    pub fn new(dag: Arc<DagService<S>>) -> Self {
        Self {
            dag,
            sets: Mutex::new(PinSets::default()),
            path: None,
        }
    }

    /// A pinner persisted at `path`, loading any existing pin set.
    pub async fn load(dag: Arc<DagService<S>>, path: PathBuf) -> Result<Self, PinError> {
        let sets = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: PinFile = serde_json::from_slice(&bytes)?;
                let parse = |roots: Vec<String>| {
                    roots
                        .iter()
                        .filter_map(|b58| Multihash::from_base58(b58).ok())
                        .collect::<HashSet<_>>()
                };
                PinSets {
                    direct: parse(file.direct),
                    recursive: parse(file.recursive),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PinSets::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            dag,
            sets: Mutex::new(sets),
            path: Some(path),
        })
    }

    /// Pin `key`, recursively protecting its subtree when asked. The node
    /// must be present locally.
    pub async fn pin(&self, key: &Multihash, recursive: bool) -> Result<(), PinError> {
        // Fail early rather than pinning a root we cannot retrieve.
        let token = CancellationToken::new();
        self.dag.get(key, &token).await?;

        {
            let mut sets = self.sets.lock().await;
            if recursive {
                sets.direct.remove(key);
                sets.recursive.insert(key.clone());
            } else if !sets.recursive.contains(key) {
                sets.direct.insert(key.clone());
            }
        }
        self.flush().await
    }

    /// Remove the pin root at `key`.
    pub async fn unpin(&self, key: &Multihash) -> Result<(), PinError> {
        {
            let mut sets = self.sets.lock().await;
            if !sets.direct.remove(key) && !sets.recursive.remove(key) {
                return Err(PinError::NotPinned(key.clone()));
            }
        }
        self.flush().await
    }

    /// Whether `key` is protected, directly, as a recursive root, or as a
    /// descendant of one.
    pub async fn is_pinned(&self, key: &Multihash) -> Result<bool, PinError> {
        {
            let sets = self.sets.lock().await;
            if sets.direct.contains(key) || sets.recursive.contains(key) {
                return Ok(true);
            }
        }
        Ok(self.reachable().await?.contains(key))
    }

    /// The current pin roots: `(direct, recursive)`.
    pub async fn pins(&self) -> (Vec<Multihash>, Vec<Multihash>) {
        let sets = self.sets.lock().await;
        (
            sets.direct.iter().cloned().collect(),
            sets.recursive.iter().cloned().collect(),
        )
    }

    /// Delete every block not reachable from a pin root. Returns the
    /// removed keys.
    pub async fn gc(&self) -> Result<Vec<Multihash>, PinError> {
        let reachable = self.reachable().await?;
        let mut removed = Vec::new();
        for key in self.dag.store().keys().await.map_err(DagError::from)? {
            if !reachable.contains(&key) {
                self.dag.remove(&key).await?;
                removed.push(key);
            }
        }
        debug!(removed = removed.len(), kept = reachable.len(), "gc sweep");
        Ok(removed)
    }

    /// The closure of blocks protected by the pin roots.
    async fn reachable(&self) -> Result<HashSet<Multihash>, PinError> {
        let (direct, recursive) = {
            let sets = self.sets.lock().await;
            (sets.direct.clone(), sets.recursive.clone())
        };

        let token = CancellationToken::new();
        let mut visited: HashSet<Multihash> = HashSet::new();
        let mut frontier: VecDeque<Multihash> = recursive.into_iter().collect();
        while let Some(key) = frontier.pop_front() {
            if !visited.insert(key.clone()) {
                continue;
            }
            match self.dag.get(&key, &token).await {
                Ok(node) => {
                    for link in node.links() {
                        frontier.push_back(link.hash.clone());
                    }
                }
                // A missing descendant cannot be collected anyway; keep
                // sweeping the rest.
                Err(DagError::BlockNotFound(_)) => {
                    warn!(key = %key, "pinned subtree references a missing block");
                }
                Err(e) => return Err(e.into()),
            }
        }
        visited.extend(direct);
        Ok(visited)
    }

    async fn flush(&self) -> Result<(), PinError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = {
            let sets = self.sets.lock().await;
            PinFile {
                direct: sets.direct.iter().map(Multihash::to_base58).collect(),
                recursive: sets.recursive.iter().map(Multihash::to_base58).collect(),
            }
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MemoryBlockStore;
    use crate::dag::DagNode;

    async fn fixture() -> (Arc<DagService<MemoryBlockStore>>, Multihash, Multihash, Multihash) {
        let dag = Arc::new(DagService::new(Arc::new(MemoryBlockStore::new())));

        let child = DagNode::new(b"leaf".to_vec());
        let mut root = DagNode::new(b"root".to_vec());
        root.add_link("leaf", &child);
        let root_key = dag.add_recursive(&root).await.expect("add");
        let child_key = child.key_now();

        let loose = DagNode::new(b"unpinned".to_vec());
        let loose_key = dag.add(&loose).await.expect("add");

        (dag, root_key, child_key, loose_key)
    }

    #[tokio::test]
    async fn recursive_pin_protects_descendants_from_gc() {
        let (dag, root_key, child_key, loose_key) = fixture().await;
        let pinner = Pinner::new(dag.clone());
        pinner.pin(&root_key, true).await.expect("pin");

        assert!(pinner.is_pinned(&root_key).await.unwrap());
        assert!(pinner.is_pinned(&child_key).await.unwrap());
        assert!(!pinner.is_pinned(&loose_key).await.unwrap());

        let removed = pinner.gc().await.expect("gc");
        assert_eq!(removed, vec![loose_key.clone()]);
        assert!(dag.store().has(&root_key).await.unwrap());
        assert!(dag.store().has(&child_key).await.unwrap());
        assert!(!dag.store().has(&loose_key).await.unwrap());
    }

    #[tokio::test]
    async fn direct_pin_does_not_protect_children() {
        let (dag, root_key, child_key, _loose) = fixture().await;
        let pinner = Pinner::new(dag.clone());
        pinner.pin(&root_key, false).await.expect("pin");

        pinner.gc().await.expect("gc");
        assert!(dag.store().has(&root_key).await.unwrap());
        assert!(!dag.store().has(&child_key).await.unwrap());
    }

    #[tokio::test]
    async fn unpin_makes_blocks_collectable() {
        let (dag, root_key, _child, _loose) = fixture().await;
        let pinner = Pinner::new(dag.clone());
        pinner.pin(&root_key, true).await.expect("pin");
        pinner.unpin(&root_key).await.expect("unpin");

        assert!(matches!(
            pinner.unpin(&root_key).await,
            Err(PinError::NotPinned(_))
        ));

        pinner.gc().await.expect("gc");
        assert!(!dag.store().has(&root_key).await.unwrap());
    }

    #[tokio::test]
    async fn pinning_missing_roots_fails() {
        let (dag, _root, _child, _loose) = fixture().await;
        let pinner = Pinner::new(dag);
        let absent = Multihash::sha2_256(b"absent");
        assert!(matches!(
            pinner.pin(&absent, true).await,
            Err(PinError::Dag(DagError::BlockNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn pin_roots_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let pins_path = dir.path().join("pins.json");
        let dag = Arc::new(DagService::new(Arc::new(MemoryBlockStore::new())));

        let node = DagNode::new(b"kept".to_vec());
        let key = dag.add(&node).await.expect("add");

        {
            let pinner = Pinner::load(dag.clone(), pins_path.clone())
                .await
                .expect("load");
            pinner.pin(&key, true).await.expect("pin");
        }

        let reloaded = Pinner::load(dag, pins_path).await.expect("reload");
        let (direct, recursive) = reloaded.pins().await;
        assert!(direct.is_empty());
        assert_eq!(recursive, vec![key]);
    }
}
