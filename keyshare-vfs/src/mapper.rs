//! Namespace mapper: credential ids <-> node ids.
//!
//! The id derivation itself is pure (see [`NodeId::for_credential`]).  What
//! needs the store is going the other way, from a node id back to the
//! credential, plus the filename assignment, which depends on every entry
//! present at a generation.  Both live in an [`Index`] that is rebuilt
//! whenever the store generation moves.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use keyshare_core::{CredentialEntry, CredentialId, CredentialStore, StoreView};
use tracing::{debug, error, warn};

use crate::error::VfsError;
use crate::materializer;
use crate::naming;
use crate::node::{NodeId, NodeKind, VirtualNode};

/// Deterministic node id for `kind` of `credential`.
pub fn identifier_for(kind: NodeKind, credential: &CredentialId) -> NodeId {
    NodeId::for_credential(kind, credential)
}

/// Every file lives directly under the root; the root is its own parent.
pub fn parent_of(_node: &NodeId) -> NodeId {
    NodeId::root()
}

/// Kind encoded in `node`, or `NotFound` for anything malformed.
pub fn kind_of(node: &NodeId) -> Result<NodeKind, VfsError> {
    node.kind().ok_or_else(|| VfsError::not_found(node))
}

/// One installed credential as it appears in the namespace.
#[derive(Debug, Clone)]
pub struct IndexedEntry {
    pub entry: CredentialEntry,
    /// Sanitised, de-duplicated filename stem.
    pub stem: String,
    pub bundle: NodeId,
    pub detail: NodeId,
    /// Exact length of the materialized bundle archive.
    pub bundle_len: u64,
}

impl IndexedEntry {
    pub fn node(&self, kind: NodeKind) -> VirtualNode {
        let (id, filename, size) = match kind {
            NodeKind::BundleFile => (
                self.bundle.clone(),
                naming::bundle_filename(&self.stem),
                self.bundle_len,
            ),
            _ => (
                self.detail.clone(),
                naming::detail_filename(&self.stem),
                materializer::detail_len(&self.entry),
            ),
        };
        VirtualNode {
            id,
            kind,
            parent: Some(NodeId::root()),
            credential: Some(self.entry.id.clone()),
            filename,
            content_type: kind.content_type(),
            size,
            modified: Some(self.entry.not_before.clone()),
        }
    }
}

/// Node lookup tables for one store generation.
#[derive(Debug, Default)]
pub struct Index {
    generation: u64,
    entries: Vec<IndexedEntry>,
    by_node: HashMap<NodeId, usize>,
    by_name: HashMap<String, NodeId>,
}

impl Index {
    /// Build the index for `view`.  Bundle sizes are measured by
    /// materializing each archive once, reading key material from `store`.
    pub fn build(view: StoreView, store: &dyn CredentialStore) -> Self {
        let mut index = Self {
            generation: view.generation,
            ..Self::default()
        };
        let mut stems = HashSet::new();

        for entry in view.entries {
            let bundle = identifier_for(NodeKind::BundleFile, &entry.id);
            let detail = identifier_for(NodeKind::DetailFile, &entry.id);
            if let Some(clash) = [&bundle, &detail]
                .into_iter()
                .find(|n| index.by_node.contains_key(*n))
            {
                error!(
                    node = %clash,
                    credential = %entry.id,
                    "node id collision, credential hidden from the namespace"
                );
                continue;
            }

            let stem = unique_stem(&entry, &stems);
            stems.insert(stem.clone());
            let bundle_len = measure_bundle(store, &entry, &stem);

            let pos = index.entries.len();
            index.by_node.insert(bundle.clone(), pos);
            index.by_node.insert(detail.clone(), pos);
            index
                .by_name
                .insert(naming::bundle_filename(&stem), bundle.clone());
            index
                .by_name
                .insert(naming::detail_filename(&stem), detail.clone());
            index.entries.push(IndexedEntry {
                entry,
                stem,
                bundle,
                detail,
                bundle_len,
            });
        }
        debug!(
            generation = index.generation,
            entries = index.entries.len(),
            "namespace index rebuilt"
        );
        index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Indexed entries in store insertion order.
    pub fn entries(&self) -> &[IndexedEntry] {
        &self.entries
    }

    /// The entry behind a file node.
    pub fn entry(&self, node: &NodeId) -> Result<&IndexedEntry, VfsError> {
        self.by_node
            .get(node)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| VfsError::not_found(node))
    }

    /// Node id of the file called `name` under the root.
    pub fn lookup(&self, name: &str) -> Option<&NodeId> {
        self.by_name.get(name)
    }

    /// Placeholder metadata for any node, root included.
    pub fn node(&self, node: &NodeId) -> Result<VirtualNode, VfsError> {
        match kind_of(node)? {
            NodeKind::RootFolder => Ok(VirtualNode::root()),
            kind => Ok(self.entry(node)?.node(kind)),
        }
    }
}

/// Sanitised stem for `entry` that no earlier entry has taken.  A repeat
/// gets the short credential id appended; if even that is taken (a literal
/// name that happens to read `X-<short>`), a counter follows.
fn unique_stem(entry: &CredentialEntry, taken: &HashSet<String>) -> String {
    let base = naming::sanitise_stem(&entry.friendly_name);
    if !taken.contains(&base) {
        return base;
    }
    let suffixed = format!("{base}-{}", entry.id.short());
    let mut stem = suffixed.clone();
    let mut n = 2;
    while taken.contains(&stem) {
        stem = format!("{suffixed}-{n}");
        n += 1;
    }
    stem
}

/// Length of the archive `materialize` will produce for `entry`.  Falls
/// back to the stored size when the credential vanished under a concurrent
/// delete; the next generation rebuilds the index anyway.
fn measure_bundle(store: &dyn CredentialStore, entry: &CredentialEntry, stem: &str) -> u64 {
    let measured = store
        .get(&entry.id)
        .map_err(VfsError::from)
        .and_then(|credential| materializer::bundle_bytes(&credential, stem));
    match measured {
        Ok(bytes) => bytes.len() as u64,
        Err(e) => {
            warn!(credential = %entry.id, "cannot measure bundle: {e}");
            entry.size
        }
    }
}

/// Caches the [`Index`] for the most recent store generation.
#[derive(Debug, Default)]
pub struct NamespaceMapper {
    current: RwLock<Option<Arc<Index>>>,
}

impl NamespaceMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index for the store's current generation, rebuilding if it moved.
    pub fn index(&self, store: &dyn CredentialStore) -> Arc<Index> {
        let generation = store.generation();
        if let Some(index) = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|i| i.generation == generation)
        {
            return Arc::clone(index);
        }

        let index = Arc::new(Index::build(store.view(), store));
        let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
        // A concurrent rebuild may have produced a newer index already.
        match slot.as_ref() {
            Some(existing) if existing.generation > index.generation => Arc::clone(existing),
            _ => {
                *slot = Some(Arc::clone(&index));
                index
            }
        }
    }

    /// Credential behind a file node at the store's current generation.
    pub fn resolve(
        &self,
        store: &dyn CredentialStore,
        node: &NodeId,
    ) -> Result<CredentialId, VfsError> {
        match kind_of(node)? {
            NodeKind::RootFolder => Err(VfsError::not_found(node)),
            _ => Ok(self.index(store).entry(node)?.entry.id.clone()),
        }
    }
}
