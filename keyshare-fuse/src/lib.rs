//! FUSE host for the keyshare virtual filesystem.
//!
//! Mounts at `$XDG_RUNTIME_DIR/keyshare/files/` by default and exposes one
//! `.zip` bundle and one `.json` descriptor per installed credential.
//!
//! The filesystem is read-only and holds nothing on disk: content is
//! synthesized from the store on access.  Call [`mount`] to start the
//! background FUSE thread.  The returned [`MountHandle`] keeps the
//! filesystem alive; drop it to unmount.

pub mod fs;

pub use fs::{CredentialFs, MountHandle, inode_for, mount};
