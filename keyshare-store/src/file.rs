//! Encrypted, file-backed credential store.
//!
//! Same semantics as [`MemoryStore`](crate::MemoryStore), plus persistence:
//!
//! ```text
//! $XDG_DATA_HOME/keyshare/store.json
//! {
//!   "version": 1,
//!   "sealed": { "iv_b64": …, "ciphertext_b64": …, "mac_b64": … }
//! }
//! ```
//!
//! The sealed payload is the JSON list of stored credentials, encrypted with
//! a key derived from the machine key.  Every mutation builds the next state
//! on the side, writes it with write-then-rename, and only then publishes it
//! to readers.  A failed write therefore leaves both the file and the
//! in-memory view exactly as they were.
//!
//! Several processes may open the same file (a CLI import next to a running
//! mount).  Mutations hold an exclusive `flock` on `<store>.lock` and reload
//! the file first when another writer changed it, so no update is lost.
//! Readers see another process's writes after [`FileStore::refresh`], which
//! the mount calls from a file watcher.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use base64::prelude::{BASE64_STANDARD, Engine};
use keyshare_core::sealed::{self, SealedBlob, StorageKey};
use keyshare_core::{
    CredentialEntry, CredentialId, CredentialStore, InstalledCredential, SecretBytes, StoreError,
    StoreView, fsutil, machine_key,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::entries::Entries;
use crate::lock::StoreLock;

pub const STORE_FORMAT_VERSION: u32 = 1;

const STORE_KEY_INFO: &[u8] = b"keyshare store v1";

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    sealed: SealedBlob,
}

/// One credential in its persisted (decrypted) form.
#[derive(Serialize, Deserialize)]
struct StoredCredential {
    entry: CredentialEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_key_b64: Option<String>,
    chain_b64: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    export_b64: Option<String>,
}

impl StoredCredential {
    fn from_installed(c: &InstalledCredential) -> Self {
        Self {
            entry: c.entry.clone(),
            private_key_b64: c
                .private_key
                .as_ref()
                .map(|k| BASE64_STANDARD.encode(k.as_slice())),
            chain_b64: c.chain.iter().map(|d| BASE64_STANDARD.encode(d)).collect(),
            export_b64: c.export.as_ref().map(|e| BASE64_STANDARD.encode(e)),
        }
    }

    fn into_installed(self) -> Result<InstalledCredential, StoreError> {
        let decode = |s: &str| {
            BASE64_STANDARD
                .decode(s)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.entry.id)))
        };
        let private_key = match &self.private_key_b64 {
            Some(k) => Some(SecretBytes::new(decode(k)?)),
            None => None,
        };
        let chain = self
            .chain_b64
            .iter()
            .map(|c| decode(c))
            .collect::<Result<Vec<_>, _>>()?;
        let export = match &self.export_b64 {
            Some(e) => Some(decode(e)?),
            None => None,
        };
        Ok(InstalledCredential {
            entry: self.entry,
            private_key,
            chain,
            export,
        })
    }
}

pub struct FileStore {
    path: PathBuf,
    key: StorageKey,
    lock: StoreLock,
    state: RwLock<Snapshot>,
    changes: watch::Sender<u64>,
}

/// In-memory entries plus the MAC tag of the file they were read from or
/// written to.  Every seal draws a fresh IV, so the tag changes on every
/// write by any process.
struct Snapshot {
    entries: Entries,
    disk_tag: Option<String>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileStore {
    /// Open (or lazily create) the store at `path`, sealed with the machine
    /// key.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, StoreError> {
        let seed = machine_key::load_or_create().map_err(StoreError::Corrupt)?;
        let key = StorageKey::derive(&seed, STORE_KEY_INFO);
        Self::open_with_key(path, key)
    }

    /// Open the store at `path` with an explicit key.
    ///
    /// A missing file is an empty store; the file is created on first write.
    pub fn open_with_key(path: impl AsRef<Path>, key: StorageKey) -> Result<Arc<Self>, StoreError> {
        let path = path.as_ref().to_path_buf();
        let (items, disk_tag) = match read_store_file(&path)? {
            Some(file) => (load_items(&file, &key)?, Some(file.sealed.mac_b64)),
            None => (Vec::new(), None),
        };
        info!(path = %path.display(), credentials = items.len(), "opened credential store");
        let (changes, _) = watch::channel(0);
        Ok(Arc::new(Self {
            lock: StoreLock::for_store(&path),
            path,
            key,
            state: RwLock::new(Snapshot {
                entries: Entries::from_items(items),
                disk_tag,
            }),
            changes,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pick up writes made through other handles or processes.
    ///
    /// Returns `true` when the file changed and a new generation was
    /// published.
    pub fn refresh(&self) -> Result<bool, StoreError> {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let changed = self.reload(&mut guard)?;
        let generation = guard.entries.generation();
        drop(guard);
        if changed {
            self.changes.send_replace(generation);
        }
        Ok(changed)
    }

    /// Re-read the file into `snapshot` if its tag differs from the one last
    /// seen.  A vanished file reads as an empty store.
    fn reload(&self, snapshot: &mut Snapshot) -> Result<bool, StoreError> {
        let file = read_store_file(&self.path)?;
        let tag = file.as_ref().map(|f| f.sealed.mac_b64.clone());
        if tag == snapshot.disk_tag {
            return Ok(false);
        }
        let items = match &file {
            Some(file) => load_items(file, &self.key)?,
            None => Vec::new(),
        };
        debug!(path = %self.path.display(), credentials = items.len(), "reloaded credential store");
        snapshot.entries.replace_all(items);
        snapshot.disk_tag = tag;
        Ok(true)
    }

    /// Write `entries` and return the new file's tag.
    fn persist(&self, entries: &Entries) -> Result<String, StoreError> {
        let stored: Vec<StoredCredential> = entries
            .items()
            .iter()
            .map(|c| StoredCredential::from_installed(c))
            .collect();
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&stored).map_err(|e| StoreError::Write(e.to_string()))?,
        );
        let sealed = sealed::seal(&self.key, &plaintext).map_err(StoreError::Write)?;
        let tag = sealed.mac_b64.clone();
        let file = StoreFile {
            version: STORE_FORMAT_VERSION,
            sealed,
        };
        let content =
            serde_json::to_vec_pretty(&file).map_err(|e| StoreError::Write(e.to_string()))?;
        fsutil::write_secret_file(&self.path, &content).map_err(|e| {
            StoreError::Write(format!("failed to write {}: {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), "saved credential store");
        Ok(tag)
    }

    /// Under the file lock: reload, apply `f` to a copy, persist, publish.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Entries) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _flock = self.lock.acquire().map_err(|e| {
            StoreError::Write(format!("failed to lock {}: {e}", self.path.display()))
        })?;
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let reloaded = self.reload(&mut guard)?;

        let mut next = guard.entries.clone();
        let mut outcome = f(&mut next);
        let mut changed = false;
        if outcome.is_ok() && next.generation() != guard.entries.generation() {
            match self.persist(&next) {
                Ok(tag) => {
                    guard.entries = next;
                    guard.disk_tag = Some(tag);
                    changed = true;
                }
                Err(e) => outcome = Err(e),
            }
        }
        let generation = guard.entries.generation();
        drop(guard);
        if changed || reloaded {
            self.changes.send_replace(generation);
        }
        outcome
    }
}

fn read_store_file(path: &Path) -> Result<Option<StoreFile>, StoreError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StoreError::Corrupt(format!(
                "failed to read {}: {e}",
                path.display()
            )));
        }
    };
    let file: StoreFile =
        serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    if file.version != STORE_FORMAT_VERSION {
        return Err(StoreError::Corrupt(format!(
            "unsupported store version: {}",
            file.version
        )));
    }
    Ok(Some(file))
}

fn load_items(file: &StoreFile, key: &StorageKey) -> Result<Vec<InstalledCredential>, StoreError> {
    let plaintext = sealed::open(key, &file.sealed).map_err(StoreError::Corrupt)?;
    let stored: Vec<StoredCredential> =
        serde_json::from_slice(&plaintext).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    stored
        .into_iter()
        .map(StoredCredential::into_installed)
        .collect()
}

impl CredentialStore for FileStore {
    fn view(&self) -> StoreView {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .view()
    }

    fn get(&self, id: &CredentialId) -> Result<Arc<InstalledCredential>, StoreError> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(id)
    }

    fn put(&self, batch: Vec<InstalledCredential>) -> Result<Vec<CredentialId>, StoreError> {
        self.mutate(|s| Ok(s.apply_put(batch)))
    }

    fn delete(&self, id: &CredentialId) -> Result<(), StoreError> {
        self.mutate(|s| s.remove(id))
    }

    fn clear(&self) -> Result<usize, StoreError> {
        self.mutate(|s| Ok(s.clear()))
    }

    fn generation(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .generation()
    }

    fn refresh(&self) -> Result<bool, StoreError> {
        FileStore::refresh(self)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::fake_credential;

    fn test_key() -> StorageKey {
        StorageKey::from_bytes(&[0x42; 64]).unwrap()
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open_with_key(dir.path().join("store.json"), test_key()).unwrap();
        assert!(store.list().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn put_persists_and_reloads_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let store = FileStore::open_with_key(&path, test_key()).unwrap();
            store
                .put(vec![fake_credential("b"), fake_credential("a")])
                .unwrap();
        }
        let reopened = FileStore::open_with_key(&path, test_key()).unwrap();
        let names: Vec<_> = reopened
            .list()
            .into_iter()
            .map(|e| e.friendly_name)
            .collect();
        assert_eq!(names, vec!["Credential b", "Credential a"]);

        let id = fake_credential("b").entry.id;
        let loaded = reopened.get(&id).unwrap();
        assert_eq!(loaded.private_key.as_ref().unwrap().as_slice(), b"pkcs8");
        assert_eq!(loaded.chain.len(), 2);
        assert_eq!(loaded.export.as_deref(), Some(&b"p12"[..]));
    }

    #[test]
    fn store_file_holds_no_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = FileStore::open_with_key(&path, test_key()).unwrap();
        store.put(vec![fake_credential("secretive")]).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("secretive"));
        assert!(raw.contains("\"version\": 1"));
    }

    #[test]
    fn wrong_key_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        FileStore::open_with_key(&path, test_key())
            .unwrap()
            .put(vec![fake_credential("a")])
            .unwrap();
        let other = StorageKey::from_bytes(&[0x01; 64]).unwrap();
        assert!(matches!(
            FileStore::open_with_key(&path, other),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn failed_write_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        // The parent "directory" is a regular file, so every write fails.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let store = FileStore::open_with_key(blocker.join("store.json"), test_key()).unwrap();

        let err = store
            .put(vec![fake_credential("a"), fake_credential("b")])
            .unwrap_err();
        assert!(matches!(err, StoreError::Write(_)));
        assert!(store.list().is_empty());
        assert_eq!(store.generation(), 0);
    }

    #[test]
    fn delete_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = FileStore::open_with_key(&path, test_key()).unwrap();
        let ids = store
            .put(vec![fake_credential("a"), fake_credential("b")])
            .unwrap();
        store.delete(&ids[0]).unwrap();

        let reopened = FileStore::open_with_key(&path, test_key()).unwrap();
        let listed = reopened.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, ids[1]);
    }
    #[test]
    fn concurrent_handles_do_not_lose_updates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let a = FileStore::open_with_key(&path, test_key()).unwrap();
        let b = FileStore::open_with_key(&path, test_key()).unwrap();

        a.put(vec![fake_credential("a")]).unwrap();
        b.put(vec![fake_credential("b")]).unwrap();

        let names: Vec<_> = FileStore::open_with_key(&path, test_key())
            .unwrap()
            .list()
            .into_iter()
            .map(|e| e.friendly_name)
            .collect();
        assert_eq!(names, vec!["Credential a", "Credential b"]);
        // B reloaded A's write before applying its own.
        assert_eq!(b.list().len(), 2);
    }

    #[test]
    fn parallel_writers_serialise_on_the_file_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = FileStore::open_with_key(&path, test_key()).unwrap();
                    store.put(vec![fake_credential(&i.to_string())]).unwrap();
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        let reopened = FileStore::open_with_key(&path, test_key()).unwrap();
        assert_eq!(reopened.list().len(), 4);
    }

    #[test]
    fn refresh_picks_up_writes_from_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let reader = FileStore::open_with_key(&path, test_key()).unwrap();
        let writer = FileStore::open_with_key(&path, test_key()).unwrap();
        let mut rx = reader.subscribe();

        assert!(!reader.refresh().unwrap());
        let ids = writer.put(vec![fake_credential("a")]).unwrap();
        assert!(reader.list().is_empty());

        assert!(reader.refresh().unwrap());
        assert_eq!(reader.list().len(), 1);
        assert_eq!(reader.generation(), 1);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
        assert!(!reader.refresh().unwrap(), "unchanged file is not reloaded");

        writer.delete(&ids[0]).unwrap();
        assert!(reader.refresh().unwrap());
        assert!(matches!(reader.get(&ids[0]), Err(StoreError::NotFound(_))));
        assert_eq!(reader.generation(), 2);
    }

    #[test]
    fn delete_of_an_entry_removed_elsewhere_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let a = FileStore::open_with_key(&path, test_key()).unwrap();
        let ids = a.put(vec![fake_credential("a")]).unwrap();
        let b = FileStore::open_with_key(&path, test_key()).unwrap();
        b.delete(&ids[0]).unwrap();

        assert!(matches!(a.delete(&ids[0]), Err(StoreError::NotFound(_))));
        // The failed call still published the reloaded state.
        assert!(a.list().is_empty());
    }

    #[test]
    fn removed_file_reads_as_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = FileStore::open_with_key(&path, test_key()).unwrap();
        store.put(vec![fake_credential("a")]).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(store.refresh().unwrap());
        assert!(store.list().is_empty());
    }
}
