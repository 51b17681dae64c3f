//! Folder enumeration with explicit snapshots and change signalling.

use keyshare_core::CredentialStore;
use tokio::sync::watch;

use crate::error::VfsError;
use crate::mapper::{Index, kind_of};
use crate::node::{NodeId, NodeKind, VirtualNode};

/// Ordered children of one folder at one store generation.
///
/// Snapshots are immutable.  Once the store moves on they are stale and the
/// host should enumerate again.
#[derive(Debug, Clone)]
pub struct EnumerationSnapshot {
    pub folder: NodeId,
    pub generation: u64,
    pub nodes: Vec<VirtualNode>,
}

impl EnumerationSnapshot {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True once the store has advanced past this snapshot's generation.
    pub fn is_stale(&self, store: &dyn CredentialStore) -> bool {
        store.generation() != self.generation
    }
}

/// Build the snapshot for `folder` from `index`.
///
/// Each entry contributes its bundle file followed by its detail file, in
/// store insertion order.
pub fn snapshot(index: &Index, folder: &NodeId) -> Result<EnumerationSnapshot, VfsError> {
    if kind_of(folder)? != NodeKind::RootFolder {
        return Err(VfsError::NotAFolder(folder.clone()));
    }
    let nodes = index
        .entries()
        .iter()
        .flat_map(|e| [e.node(NodeKind::BundleFile), e.node(NodeKind::DetailFile)])
        .collect();
    Ok(EnumerationSnapshot {
        folder: folder.clone(),
        generation: index.generation(),
        nodes,
    })
}

/// One page of a snapshot.
#[derive(Debug)]
pub struct Page<'a> {
    pub nodes: &'a [VirtualNode],
    /// Cursor for the next page, `None` when the snapshot is exhausted.
    pub next: Option<usize>,
}

/// Slice `snapshot` starting at `cursor`.  A cursor past the end yields an
/// empty final page; a zero page size is treated as one.
pub fn page(snapshot: &EnumerationSnapshot, cursor: usize, page_size: usize) -> Page<'_> {
    let start = cursor.min(snapshot.nodes.len());
    let end = start.saturating_add(page_size.max(1)).min(snapshot.nodes.len());
    Page {
        nodes: &snapshot.nodes[start..end],
        next: (end < snapshot.nodes.len()).then_some(end),
    }
}

/// Fires after every install or delete.
#[derive(Debug, Clone)]
pub struct ChangeWatcher {
    rx: watch::Receiver<u64>,
}

impl ChangeWatcher {
    pub(crate) fn new(rx: watch::Receiver<u64>) -> Self {
        Self { rx }
    }

    /// Non-blocking check; does not consume the change.
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Wait for the next change and return the new generation.  Returns
    /// `None` if the store has gone away.
    pub async fn changed(&mut self) -> Option<u64> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    /// Mark the current generation as seen.
    pub fn mark_seen(&mut self) -> u64 {
        *self.rx.borrow_and_update()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::NamespaceMapper;
    use crate::tests::{entry_named, store_with};

    fn nodes(n: usize) -> EnumerationSnapshot {
        let store = store_with(
            (0..n)
                .map(|i| entry_named(&i.to_string(), &format!("Cred {i}")))
                .collect(),
        );
        let index = NamespaceMapper::new().index(store.as_ref());
        snapshot(&index, &NodeId::root()).unwrap()
    }

    #[test]
    fn paging_walks_the_whole_snapshot() {
        let snap = nodes(3);
        assert_eq!(snap.len(), 6);

        let mut cursor = Some(0);
        let mut seen = Vec::new();
        while let Some(c) = cursor {
            let p = page(&snap, c, 4);
            seen.extend(p.nodes.iter().map(|n| n.id.clone()));
            cursor = p.next;
        }
        let all: Vec<_> = snap.nodes.iter().map(|n| n.id.clone()).collect();
        assert_eq!(seen, all);
    }

    #[test]
    fn cursor_past_end_is_an_empty_final_page() {
        let snap = nodes(1);
        let p = page(&snap, 10, 5);
        assert!(p.nodes.is_empty());
        assert!(p.next.is_none());
    }

    #[test]
    fn files_are_not_folders() {
        let store = store_with(vec![entry_named("a", "Alice")]);
        let index = NamespaceMapper::new().index(store.as_ref());
        let file = index.entries()[0].bundle.clone();
        assert!(matches!(
            snapshot(&index, &file),
            Err(VfsError::NotAFolder(_))
        ));
    }
}
