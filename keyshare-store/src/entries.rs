//! Insertion-ordered credential list shared by both store implementations.

use std::sync::Arc;

use keyshare_core::{CredentialEntry, CredentialId, InstalledCredential, StoreError, StoreView};
use tracing::debug;

/// The in-memory state of a store at one generation.
///
/// Cloning is cheap (a `Vec` of `Arc`s), which is what lets the file store
/// build the next state on the side and publish it only after it has been
/// persisted.
#[derive(Debug, Clone, Default)]
pub(crate) struct Entries {
    items: Vec<Arc<InstalledCredential>>,
    generation: u64,
}

impl Entries {
    pub(crate) fn from_items(items: Vec<InstalledCredential>) -> Self {
        let mut entries = Self::default();
        entries.apply_put(items);
        entries.generation = 0;
        entries
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn items(&self) -> &[Arc<InstalledCredential>] {
        &self.items
    }

    pub(crate) fn view(&self) -> StoreView {
        StoreView {
            generation: self.generation,
            entries: self.list(),
        }
    }

    pub(crate) fn list(&self) -> Vec<CredentialEntry> {
        self.items.iter().map(|c| c.entry.clone()).collect()
    }

    pub(crate) fn get(&self, id: &CredentialId) -> Result<Arc<InstalledCredential>, StoreError> {
        self.position(id)
            .map(|i| Arc::clone(&self.items[i]))
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn position(&self, id: &CredentialId) -> Option<usize> {
        self.items.iter().position(|c| c.id() == id)
    }

    /// Insert or replace every credential in `batch` and advance the
    /// generation once.  An existing id keeps its position.
    pub(crate) fn apply_put(&mut self, batch: Vec<InstalledCredential>) -> Vec<CredentialId> {
        let mut ids = Vec::with_capacity(batch.len());
        for credential in batch {
            let id = credential.id().clone();
            debug!(credential = %id, name = %credential.entry.friendly_name, "store: installing");
            match self.position(&id) {
                Some(i) => self.items[i] = Arc::new(credential),
                None => self.items.push(Arc::new(credential)),
            }
            ids.push(id);
        }
        if !ids.is_empty() {
            self.generation += 1;
        }
        ids
    }

    pub(crate) fn remove(&mut self, id: &CredentialId) -> Result<(), StoreError> {
        let i = self
            .position(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        self.items.remove(i);
        self.generation += 1;
        debug!(credential = %id, "store: removed");
        Ok(())
    }

    /// Swap in a list read from elsewhere and advance the generation once.
    pub(crate) fn replace_all(&mut self, items: Vec<InstalledCredential>) {
        self.items = items.into_iter().map(Arc::new).collect();
        self.generation += 1;
    }

    pub(crate) fn clear(&mut self) -> usize {
        let removed = self.items.len();
        if removed > 0 {
            self.items.clear();
            self.generation += 1;
        }
        removed
    }
}
