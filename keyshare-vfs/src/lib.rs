//! Virtual filesystem view over the credential store.
//!
//! The store is presented as a single folder.  Every installed credential
//! contributes two files:
//!
//! ```text
//! /
//! ├── Alice Example.zip    # <stem>.p12 + <stem>-chain.pem
//! └── Alice Example.json   # public descriptor
//! ```
//!
//! Nothing is written anywhere until a host asks for it: enumeration hands
//! out placeholders, and [`VirtualFs::materialize`] synthesizes content on
//! demand from the store's current state.  Host adapters (FUSE, the CLI)
//! talk only to [`VirtualFs`].

pub mod enumerator;
pub mod error;
pub mod mapper;
pub mod materializer;
pub mod naming;
pub mod node;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use keyshare_core::{CredentialStore, fsutil};
use tracing::debug;

pub use enumerator::{ChangeWatcher, EnumerationSnapshot, Page, page};
pub use error::VfsError;
pub use mapper::{NamespaceMapper, identifier_for, kind_of, parent_of};
pub use node::{NodeId, NodeKind, VirtualNode};

/// Host-facing entry point.
pub struct VirtualFs {
    store: Arc<dyn CredentialStore>,
    mapper: NamespaceMapper,
}

impl std::fmt::Debug for VirtualFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFs")
            .field("generation", &self.store.generation())
            .finish_non_exhaustive()
    }
}

impl VirtualFs {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            mapper: NamespaceMapper::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn generation(&self) -> u64 {
        self.store.generation()
    }

    /// Children of `folder` at the current generation.
    pub fn enumerate(&self, folder: &NodeId) -> Result<EnumerationSnapshot, VfsError> {
        let index = self.mapper.index(self.store.as_ref());
        enumerator::snapshot(&index, folder)
    }

    /// Change signal that fires after any install or delete.
    pub fn watch(&self) -> ChangeWatcher {
        ChangeWatcher::new(self.store.subscribe())
    }

    /// Placeholder metadata without synthesizing content.
    pub fn metadata(&self, node: &NodeId) -> Result<VirtualNode, VfsError> {
        self.mapper.index(self.store.as_ref()).node(node)
    }

    /// Find a root child by filename.
    pub fn lookup(&self, name: &str) -> Result<VirtualNode, VfsError> {
        let index = self.mapper.index(self.store.as_ref());
        let id = index
            .lookup(name)
            .ok_or_else(|| VfsError::NotFound(name.to_string()))?;
        index.node(id)
    }

    /// Full content of a file node.
    ///
    /// Resolves against the current generation, so a node whose credential
    /// has been deleted since it was enumerated fails with `NotFound`.
    pub fn materialize(&self, node: &NodeId) -> Result<Vec<u8>, VfsError> {
        let index = self.mapper.index(self.store.as_ref());
        let kind = kind_of(node)?;
        if kind.is_folder() {
            return Err(VfsError::not_found(node));
        }
        let indexed = index.entry(node)?;
        let bytes = match kind {
            NodeKind::DetailFile => materializer::detail_bytes(&indexed.entry),
            _ => {
                let credential = self.store.get(&indexed.entry.id).map_err(|e| match e {
                    keyshare_core::StoreError::NotFound(_) => VfsError::not_found(node),
                    other => other.into(),
                })?;
                materializer::bundle_bytes(&credential, &indexed.stem)?
            }
        };
        debug!(node = %node, len = bytes.len(), "materialized");
        Ok(bytes)
    }

    /// Materialize `node` into `<dir>/<filename>` and return the path.
    ///
    /// The file is written with mode 0600 via write-then-rename, so readers
    /// never see a partial file.
    pub fn materialize_to(&self, node: &NodeId, dir: &Path) -> Result<PathBuf, VfsError> {
        let meta = self.metadata(node)?;
        if meta.kind.is_folder() {
            return Err(VfsError::not_found(node));
        }
        let bytes = self.materialize(node)?;
        let path = dir.join(&meta.filename);
        fsutil::write_secret_file(&path, &bytes).map_err(|source| VfsError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(node = %node, path = %path.display(), "materialized to disk");
        Ok(path)
    }
}
