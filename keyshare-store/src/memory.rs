//! In-memory credential store.
//!
//! The [`MemoryStore`] holds installed credentials for the lifetime of the
//! process.  It is read from two places:
//! - the virtual filesystem (enumeration and materialization), and
//! - the import pipeline, which writes through [`CredentialStore::put`].
//!
//! Thread safety: all state lives behind one `RwLock`.  Writers hold the write
//! guard for the whole batch, so readers see either the previous or the next
//! generation, never a partially applied batch.

use std::sync::{Arc, PoisonError, RwLock};

use keyshare_core::{
    CredentialId, CredentialStore, InstalledCredential, StoreError, StoreView,
};
use tokio::sync::watch;
use tracing::debug;

use crate::entries::Entries;

/// Shared, thread-safe, insertion-ordered credential store.
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<Entries>,
    changes: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_credentials(Vec::new())
    }
}

impl MemoryStore {
    /// Create an empty store ready to be shared.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a store pre-populated with `credentials` at generation 0.
    pub fn with_credentials(credentials: Vec<InstalledCredential>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: RwLock::new(Entries::from_items(credentials)),
            changes,
        }
    }

    /// Number of installed credentials.
    pub fn len(&self) -> usize {
        self.read(|s| s.items().len())
    }

    /// True if nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<T>(&self, f: impl FnOnce(&Entries) -> T) -> T {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Entries) -> T) -> T {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let before = guard.generation();
        let out = f(&mut guard);
        let after = guard.generation();
        drop(guard);
        if after != before {
            self.changes.send_replace(after);
            debug!(generation = after, "store: generation advanced");
        }
        out
    }
}

impl CredentialStore for MemoryStore {
    fn view(&self) -> StoreView {
        self.read(Entries::view)
    }

    fn get(&self, id: &CredentialId) -> Result<Arc<InstalledCredential>, StoreError> {
        self.read(|s| s.get(id))
    }

    fn put(&self, batch: Vec<InstalledCredential>) -> Result<Vec<CredentialId>, StoreError> {
        Ok(self.write(|s| s.apply_put(batch)))
    }

    fn delete(&self, id: &CredentialId) -> Result<(), StoreError> {
        self.write(|s| s.remove(id))
    }

    fn clear(&self) -> Result<usize, StoreError> {
        Ok(self.write(Entries::clear))
    }

    fn generation(&self) -> u64 {
        self.read(Entries::generation)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use keyshare_core::{CredentialEntry, SecretBytes};

    pub(crate) fn fake_credential(seed: &str) -> InstalledCredential {
        let leaf = format!("leaf-der-{seed}").into_bytes();
        InstalledCredential {
            entry: CredentialEntry {
                id: CredentialId::from_leaf_der(&leaf),
                friendly_name: format!("Credential {seed}"),
                subject: format!("CN=Credential {seed}"),
                issuer: "CN=Test CA".to_string(),
                not_before: "Jan  1 00:00:00 2025 +00:00".to_string(),
                not_after: "Jan  1 00:00:00 2030 +00:00".to_string(),
                size: 3,
                has_private_key: true,
                chain_len: 2,
            },
            private_key: Some(SecretBytes::new(b"pkcs8".to_vec())),
            chain: vec![leaf, b"ca-der".to_vec()],
            export: Some(b"p12".to_vec()),
        }
    }

    #[test]
    fn put_preserves_insertion_order() {
        let store = MemoryStore::new();
        let ids = store
            .put(vec![fake_credential("b"), fake_credential("a")])
            .unwrap();
        store.put(vec![fake_credential("c")]).unwrap();

        let listed: Vec<_> = store.list().into_iter().map(|e| e.id).collect();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0], ids[0]);
        assert_eq!(listed[1], ids[1]);
        assert_eq!(listed[2], fake_credential("c").entry.id);
    }

    #[test]
    fn reinstalling_replaces_in_place() {
        let store = MemoryStore::new();
        store
            .put(vec![fake_credential("a"), fake_credential("b")])
            .unwrap();
        let mut again = fake_credential("a");
        again.entry.friendly_name = "Renamed".to_string();
        store.put(vec![again]).unwrap();

        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].friendly_name, "Renamed");
    }

    #[test]
    fn batch_advances_generation_once() {
        let store = MemoryStore::new();
        assert_eq!(store.generation(), 0);
        store
            .put(vec![fake_credential("a"), fake_credential("b")])
            .unwrap();
        assert_eq!(store.generation(), 1);
        store.put(Vec::new()).unwrap();
        assert_eq!(store.generation(), 1);
    }

    #[test]
    fn delete_and_get_report_not_found() {
        let store = MemoryStore::new();
        let id = store.put(vec![fake_credential("a")]).unwrap().remove(0);
        assert!(store.get(&id).is_ok());
        store.delete(&id).unwrap();
        assert!(matches!(store.get(&id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(&id), Err(StoreError::NotFound(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn clear_removes_everything() {
        let store = MemoryStore::new();
        store
            .put(vec![fake_credential("a"), fake_credential("b")])
            .unwrap();
        assert_eq!(store.clear().unwrap(), 2);
        assert_eq!(store.clear().unwrap(), 0);
        assert!(store.list().is_empty());
        assert_eq!(store.generation(), 2);
    }

    #[tokio::test]
    async fn subscribers_observe_writes() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        assert!(!rx.has_changed().unwrap());

        store.put(vec![fake_credential("a")]).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);

        let id = fake_credential("a").entry.id;
        store.delete(&id).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 2);
    }

    #[test]
    fn view_is_consistent_with_generation() {
        let store = MemoryStore::with_credentials(vec![fake_credential("a")]);
        let view = store.view();
        assert_eq!(view.generation, 0);
        assert_eq!(view.entries.len(), 1);
    }
}
