//! Resolution of `/ipfs/` and `/ipns/` paths to DAG nodes.
//!
//! `/ipfs/<key>/a/b/c` walks named links from a content root. An `/ipns/`
//! path first resolves the name through the name system, then continues as
//! an `/ipfs/` traversal with the remaining components.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::blockstore::BlockStore;
use crate::dag::{DagError, DagNode, DagService};
use crate::multihash::Multihash;
use crate::namesys::{NameError, NameResolver, ValueRouting};

#[derive(Debug, Error)]
pub enum PathError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("no link named {0:?}")]
    NoLink(String),
    #[error("block not found: {0}")]
    BlockNotFound(Multihash),
    #[error("resolution timed out")]
    Timeout,
    #[error("resolution cancelled")]
    Cancelled,
    #[error(transparent)]
    Name(#[from] NameError),
    #[error(transparent)]
    Dag(DagError),
}

impl From<DagError> for PathError {
    fn from(err: DagError) -> Self {
        match err {
            DagError::NoLink(name) => PathError::NoLink(name),
            DagError::BlockNotFound(key) => PathError::BlockNotFound(key),
            DagError::Timeout => PathError::Timeout,
            DagError::Cancelled => PathError::Cancelled,
            other => PathError::Dag(other),
        }
    }
}

/// A parsed path: the root namespace plus the remaining components.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DagPath {
    Ipfs {
        root: Multihash,
        components: Vec<String>,
    },
    Ipns {
        name: String,
        components: Vec<String>,
    },
}

impl DagPath {
    /// Parse a slash-delimited path beginning with `/ipfs/` or `/ipns/`.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let invalid = || PathError::InvalidPath(path.to_string());

        let rest = path.strip_prefix('/').ok_or_else(invalid)?;
        let mut parts = rest.split('/');
        let namespace = parts.next().ok_or_else(invalid)?;
        let root = parts.next().filter(|r| !r.is_empty()).ok_or_else(invalid)?;
        let components: Vec<String> = parts
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();

        match namespace {
            "ipfs" => {
                let root = Multihash::from_base58(root).map_err(|_| invalid())?;
                Ok(DagPath::Ipfs { root, components })
            }
            "ipns" => Ok(DagPath::Ipns {
                name: root.to_string(),
                components,
            }),
            _ => Err(invalid()),
        }
    }
}

/// Resolves paths against the DAG, consulting the name system for `/ipns/`
/// roots.
pub struct PathResolver<S: BlockStore, R: ValueRouting> {
    dag: Arc<DagService<S>>,
    names: Arc<NameResolver<R>>,
}

impl<S: BlockStore, R: ValueRouting> PathResolver<S, R> {
    pub fn new(dag: Arc<DagService<S>>, names: Arc<NameResolver<R>>) -> Self {
        Self { dag, names }
    }

    /// Resolve a path to the DAG node it names.
    pub async fn resolve(
        &self,
        path: &str,
        token: &CancellationToken,
    ) -> Result<DagNode, PathError> {
        match DagPath::parse(path)? {
            DagPath::Ipfs { root, components } => {
                let components: Vec<&str> = components.iter().map(String::as_str).collect();
                Ok(self.dag.resolve_path(&root, &components, token).await?)
            }
            DagPath::Ipns { name, components } => {
                let target = self.names.resolve(&name, token).await?;
                // Published values are content references, with or without
                // the /ipfs/ prefix.
                let target = target.strip_prefix("/ipfs/").unwrap_or(&target);
                let root = Multihash::from_base58(target)
                    .map_err(|_| PathError::InvalidPath(target.to_string()))?;
                let components: Vec<&str> = components.iter().map(String::as_str).collect();
                Ok(self.dag.resolve_path(&root, &components, token).await?)
            }
        }
    }
}
