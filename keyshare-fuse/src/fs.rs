//! FUSE filesystem implementation.
//!
//! Presents the virtual namespace as a read-only, single-level tree:
//!
//! ```text
//! /                   ino 1  (root)
//! ├── <stem>.zip      ino derived from the node id
//! └── <stem>.json     ino derived from the node id
//! ```
//!
//! Inode numbers are the first 64 bits of the node id digest with the top
//! bit set, so the same credential keeps the same inode across remounts.
//! File content is materialized on first `lookup`/`getattr`/`open` and
//! cached until the store generation moves, so the kernel always sees exact
//! sizes.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use fuser::{
    AccessFlags, BackgroundSession, Config, Errno, FileAttr, FileHandle, FileType, Filesystem,
    FopenFlags, Generation, INodeNo, LockOwner, MountOption, OpenFlags, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, Request, SessionACL,
};
use keyshare_core::ErrorKind;
use keyshare_vfs::{NodeId, VfsError, VirtualFs};
use tracing::{debug, warn};

const INO_ROOT: u64 = 1;

const TTL: Duration = Duration::from_secs(1);

/// Inode for `node`.  Stable for the lifetime of the node id.
pub fn inode_for(node: &NodeId) -> u64 {
    if node.is_root() {
        return INO_ROOT;
    }
    let digest = node
        .as_str()
        .split_once('-')
        .map_or("", |(_, d)| d);
    let prefix = digest.get(..16).unwrap_or("0");
    u64::from_str_radix(prefix, 16).unwrap_or(0) | (1 << 63)
}

fn errno_for(e: &VfsError) -> Errno {
    match e.kind() {
        ErrorKind::NotFound => Errno::ENOENT,
        _ => Errno::EIO,
    }
}

/// Inode table and per-generation content cache.
///
/// Inode numbers are derived from node ids, so entries for credentials that
/// survive a generation change keep working; the rest are pruned when the
/// generation moves.
#[derive(Debug, Default)]
struct Cache {
    generation: u64,
    nodes: HashMap<u64, NodeId>,
    content: HashMap<u64, Arc<Vec<u8>>>,
    mtime: Option<SystemTime>,
}

fn make_attr(ino: u64, kind: FileType, size: u64, mtime: SystemTime) -> FileAttr {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    FileAttr {
        ino: INodeNo(ino),
        size,
        blocks: size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: UNIX_EPOCH,
        kind,
        perm: if kind == FileType::Directory {
            0o500
        } else {
            0o400
        },
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// The FUSE filesystem object.
///
/// `Filesystem` in fuser 0.17 takes `&self`; the cache sits behind a
/// `RwLock` and its content is dropped whenever the store generation
/// changes.
pub struct CredentialFs {
    vfs: Arc<VirtualFs>,
    cache: RwLock<Cache>,
}

impl CredentialFs {
    pub fn new(vfs: Arc<VirtualFs>) -> Self {
        Self {
            vfs,
            cache: RwLock::new(Cache::default()),
        }
    }

    /// Drop cached state if the store has moved on.  Returns the generation
    /// the cache now describes and the mtime to report for it.
    fn sync_generation(&self) -> (u64, SystemTime) {
        let generation = self.vfs.generation();
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            match cache.mtime {
                Some(mtime) if cache.generation == generation => return (generation, mtime),
                _ => {}
            }
        }
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.generation != generation || cache.mtime.is_none() {
            cache.generation = generation;
            cache.mtime = Some(SystemTime::now());
            cache.content.clear();
            let before = cache.nodes.len();
            cache.nodes.retain(|_, node| self.vfs.metadata(node).is_ok());
            debug!(
                to = generation,
                pruned = before - cache.nodes.len(),
                "fuse: store changed, dropping content"
            );
        }
        (cache.generation, cache.mtime.unwrap_or(UNIX_EPOCH))
    }

    fn remember(&self, node: &NodeId) -> u64 {
        let ino = inode_for(node);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .insert(ino, node.clone());
        ino
    }

    fn node_for(&self, ino: u64) -> Option<NodeId> {
        if ino == INO_ROOT {
            return Some(NodeId::root());
        }
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes
            .get(&ino)
            .cloned()
    }

    /// Materialized content of file inode `ino`, cached per generation.
    fn content(&self, ino: u64) -> Result<Arc<Vec<u8>>, Errno> {
        let (generation, _) = self.sync_generation();
        if let Some(bytes) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .content
            .get(&ino)
        {
            return Ok(Arc::clone(bytes));
        }
        let node = self.node_for(ino).ok_or(Errno::ENOENT)?;
        let bytes = Arc::new(self.vfs.materialize(&node).map_err(|e| {
            if e.kind() != ErrorKind::NotFound {
                warn!(node = %node, error = %e, "fuse: materialize failed");
            }
            errno_for(&e)
        })?);
        self.cache_content(generation, ino, Arc::clone(&bytes));
        Ok(bytes)
    }

    /// Cache `bytes` for `ino` only if the cache still describes
    /// `generation`.  Content built before a generation change must not
    /// outlive it.
    fn cache_content(&self, generation: u64, ino: u64, bytes: Arc<Vec<u8>>) -> bool {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.generation != generation {
            debug!(ino, generation, now = cache.generation, "fuse: discarding stale content");
            return false;
        }
        cache.content.insert(ino, bytes);
        true
    }

    fn attr(&self, ino: u64) -> Result<FileAttr, Errno> {
        let (_, mtime) = self.sync_generation();
        if ino == INO_ROOT {
            return Ok(make_attr(INO_ROOT, FileType::Directory, 0, mtime));
        }
        let size = self.content(ino)?.len() as u64;
        Ok(make_attr(ino, FileType::RegularFile, size, mtime))
    }

    fn lookup_name(&self, parent: u64, name: &str) -> Result<FileAttr, Errno> {
        if parent != INO_ROOT {
            return Err(Errno::ENOENT);
        }
        self.sync_generation();
        let node = self.vfs.lookup(name).map_err(|e| errno_for(&e))?;
        let ino = self.remember(&node.id);
        self.attr(ino)
    }

    /// Directory listing of the root: `.`, `..`, then every file.
    fn list_root(&self) -> Result<Vec<(u64, FileType, String)>, Errno> {
        self.sync_generation();
        let snapshot = self
            .vfs
            .enumerate(&NodeId::root())
            .map_err(|e| errno_for(&e))?;
        let mut entries = vec![
            (INO_ROOT, FileType::Directory, ".".to_string()),
            (INO_ROOT, FileType::Directory, "..".to_string()),
        ];
        for node in snapshot.nodes {
            let ino = self.remember(&node.id);
            entries.push((ino, FileType::RegularFile, node.filename));
        }
        Ok(entries)
    }
}

impl Filesystem for CredentialFs {
    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let Some(name_str) = name.to_str() else {
            reply.error(Errno::ENOENT);
            return;
        };
        match self.lookup_name(parent.0, name_str) {
            Ok(attr) => {
                debug!(name = name_str, ino = attr.ino.0, "fuse lookup");
                reply.entry(&TTL, &attr, Generation(0));
            }
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        match self.attr(ino.0) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn access(&self, _req: &Request, ino: INodeNo, _mask: AccessFlags, reply: ReplyEmpty) {
        // SessionACL::Owner already restricts access to our UID.
        match self.attr(ino.0) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        if ino.0 == INO_ROOT {
            reply.error(Errno::ENOENT);
            return;
        }
        match self.content(ino.0) {
            Ok(_) => reply.opened(FileHandle(0), FopenFlags::empty()),
            Err(e) => reply.error(e),
        }
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        if ino.0 == INO_ROOT {
            reply.opened(FileHandle(0), FopenFlags::empty());
        } else {
            reply.error(Errno::ENOENT);
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        match self.content(ino.0) {
            Ok(content) => {
                let start = (offset as usize).min(content.len());
                let end = start.saturating_add(size as usize).min(content.len());
                reply.data(&content[start..end]);
            }
            Err(e) => reply.error(e),
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        if ino.0 != INO_ROOT {
            reply.error(Errno::ENOENT);
            return;
        }
        let entries = match self.list_root() {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        for (i, (child_ino, kind, name)) in entries.iter().enumerate() {
            if (i as u64) < offset {
                continue;
            }
            if reply.add(INodeNo(*child_ino), (i + 1) as u64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        let files = self
            .vfs
            .enumerate(&NodeId::root())
            .map_or(0, |s| s.len() as u64);
        // Virtual and read-only: no blocks, no free inodes.
        reply.statfs(0, 0, 0, files, 0, 4096, 255, 0);
    }
}

/// A handle to a mounted FUSE filesystem.
///
/// Dropping it unmounts.  The `BackgroundSession` drop performs the kernel
/// unmount; `fusermount3 -u` follows in case the mount outlived the session.
pub struct MountHandle {
    session: Option<BackgroundSession>,
    pub fs: Arc<CredentialFs>,
    mountpoint: PathBuf,
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("mountpoint", &self.mountpoint)
            .finish_non_exhaustive()
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        drop(self.session.take());
        let _ = std::process::Command::new("fusermount3")
            .args(["-u", self.mountpoint.to_string_lossy().as_ref()])
            .output();
    }
}

/// Mount `vfs` read-only at `mountpoint`.
///
/// The mount is restricted to the owner (`SessionACL::Owner`).
/// `AutoUnmount` is omitted because it is incompatible with
/// `SessionACL::Owner` in fuser 0.17; [`MountHandle`] unmounts on drop.
pub fn mount(vfs: Arc<VirtualFs>, mountpoint: &Path, fs_name: &str) -> anyhow::Result<MountHandle> {
    // Clear a stale mount left by a crashed instance.  Failure just means
    // nothing was mounted.
    let _ = std::process::Command::new("fusermount3")
        .args(["-uz", mountpoint.to_string_lossy().as_ref()])
        .output();

    std::fs::create_dir_all(mountpoint)
        .with_context(|| format!("create FUSE mountpoint {:?}", mountpoint))?;

    let fs = Arc::new(CredentialFs::new(vfs));

    let mut config = Config::default();
    config.mount_options = vec![MountOption::RO, MountOption::FSName(fs_name.to_string())];
    config.acl = SessionACL::Owner;

    let session = fuser::spawn_mount2(ArcFs(Arc::clone(&fs)), mountpoint, &config)
        .with_context(|| format!("mount FUSE at {:?}", mountpoint))?;

    Ok(MountHandle {
        session: Some(session),
        fs,
        mountpoint: mountpoint.to_path_buf(),
    })
}

/// Newtype so an `Arc<CredentialFs>` can be handed to fuser.
struct ArcFs(Arc<CredentialFs>);

impl Filesystem for ArcFs {
    fn lookup(&self, req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        self.0.lookup(req, parent, name, reply);
    }

    fn getattr(&self, req: &Request, ino: INodeNo, fh: Option<FileHandle>, reply: ReplyAttr) {
        self.0.getattr(req, ino, fh, reply);
    }

    fn access(&self, req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        self.0.access(req, ino, mask, reply);
    }

    fn open(&self, req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        self.0.open(req, ino, flags, reply);
    }

    fn opendir(&self, req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        self.0.opendir(req, ino, flags, reply);
    }

    fn read(
        &self,
        req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        flags: OpenFlags,
        lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        self.0
            .read(req, ino, fh, offset, size, flags, lock_owner, reply);
    }

    fn readdir(
        &self,
        req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        reply: ReplyDirectory,
    ) {
        self.0.readdir(req, ino, fh, offset, reply);
    }

    fn statfs(&self, req: &Request, ino: INodeNo, reply: ReplyStatfs) {
        self.0.statfs(req, ino, reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyshare_core::{
        CredentialEntry, CredentialId, CredentialStore, InstalledCredential, SecretBytes,
    };
    use keyshare_store::MemoryStore;

    fn credential(seed: &str) -> InstalledCredential {
        let leaf = format!("leaf-{seed}").into_bytes();
        InstalledCredential {
            entry: CredentialEntry {
                id: CredentialId::from_leaf_der(&leaf),
                friendly_name: format!("User {seed}"),
                subject: format!("CN=User {seed}"),
                issuer: "CN=CA".to_string(),
                not_before: String::new(),
                not_after: String::new(),
                size: 3,
                has_private_key: true,
                chain_len: 1,
            },
            private_key: Some(SecretBytes::new(b"key".to_vec())),
            chain: vec![leaf],
            export: Some(b"p12".to_vec()),
        }
    }

    fn fs_with(seeds: &[&str]) -> (Arc<MemoryStore>, CredentialFs) {
        let store = MemoryStore::new();
        store
            .put(seeds.iter().map(|s| credential(s)).collect())
            .unwrap();
        let vfs = Arc::new(VirtualFs::new(store.clone()));
        (store, CredentialFs::new(vfs))
    }

    #[test]
    fn inodes_are_stable_and_distinct() {
        let id = CredentialId::from_leaf_der(b"leaf");
        let bundle = keyshare_vfs::identifier_for(keyshare_vfs::NodeKind::BundleFile, &id);
        let detail = keyshare_vfs::identifier_for(keyshare_vfs::NodeKind::DetailFile, &id);
        assert_eq!(inode_for(&NodeId::root()), INO_ROOT);
        assert_eq!(inode_for(&bundle), inode_for(&bundle));
        assert_ne!(inode_for(&bundle), inode_for(&detail));
        assert!(inode_for(&bundle) > INO_ROOT);
    }

    #[test]
    fn listing_then_reading() {
        let (_, fs) = fs_with(&["a", "b"]);
        let entries = fs.list_root().unwrap();
        let names: Vec<_> = entries.iter().map(|(_, _, n)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![".", "..", "User a.zip", "User a.json", "User b.zip", "User b.json"]
        );

        let (ino, _, _) = &entries[3];
        let attr = fs.attr(*ino).unwrap();
        let content = fs.content(*ino).unwrap();
        assert_eq!(attr.size, content.len() as u64);
        assert!(content.starts_with(b"{"));
    }

    #[test]
    fn lookup_by_name_and_missing() {
        let (_, fs) = fs_with(&["a"]);
        let attr = fs.lookup_name(INO_ROOT, "User a.zip").unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);
        assert!(fs.lookup_name(INO_ROOT, "nope.zip").is_err());
        assert!(fs.lookup_name(attr.ino.0, "User a.zip").is_err());
    }

    #[test]
    fn deleted_credential_disappears() {
        let (store, fs) = fs_with(&["a"]);
        let attr = fs.lookup_name(INO_ROOT, "User a.zip").unwrap();
        assert!(fs.content(attr.ino.0).is_ok());

        let id = store.list()[0].id.clone();
        store.delete(&id).unwrap();
        assert!(fs.content(attr.ino.0).is_err());
        assert_eq!(fs.list_root().unwrap().len(), 2);
    }

    #[test]
    fn root_is_a_directory() {
        let (_, fs) = fs_with(&[]);
        let attr = fs.attr(INO_ROOT).unwrap();
        assert_eq!(attr.kind, FileType::Directory);
    }

    #[test]
    fn content_built_before_a_generation_change_is_not_cached() {
        let (store, fs) = fs_with(&["a", "b"]);
        let attr = fs.lookup_name(INO_ROOT, "User a.zip").unwrap();
        let ino = attr.ino.0;
        let node = fs.node_for(ino).unwrap();

        // A reader materializes at the old generation...
        let (before, _) = fs.sync_generation();
        let stale = Arc::new(fs.vfs.materialize(&node).unwrap());
        // ...while the credential is deleted and another request syncs.
        let id = store.list()[0].id.clone();
        store.delete(&id).unwrap();
        fs.sync_generation();

        assert!(!fs.cache_content(before, ino, stale));
        assert!(fs.content(ino).is_err());
    }

    #[test]
    fn inode_table_is_pruned_when_credentials_go() {
        let (store, fs) = fs_with(&["a", "b"]);
        fs.list_root().unwrap();
        assert_eq!(fs.cache.read().unwrap().nodes.len(), 4);

        let id = store.list()[0].id.clone();
        store.delete(&id).unwrap();
        fs.sync_generation();

        let cache = fs.cache.read().unwrap();
        assert_eq!(cache.nodes.len(), 2);
        assert!(cache.nodes.values().all(|n| fs.vfs.metadata(n).is_ok()));
    }
}
