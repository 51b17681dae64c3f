//! Per-installation machine key.
//!
//! A random 32-byte seed generated once on first use and stored at:
//! ```text
//! $XDG_DATA_HOME/keyshare/machine-key   (default: ~/.local/share/keyshare/machine-key)
//! ```
//! The file is created with mode `0600`.  The file store derives its
//! encryption keys from it, so installed credentials can be read back without
//! any user interaction while never sitting on disk in plaintext.
//!
//! # Security model
//!
//! This key protects the store with the same level of security as the
//! user's home directory: anyone able to read `~/.local/share/keyshare/` has
//! both the key and the ciphertext.

use std::path::PathBuf;

use rand::RngCore;
use zeroize::Zeroizing;

use crate::fsutil;

/// Load the machine key seed, generating and persisting it if absent.
pub fn load_or_create() -> Result<Zeroizing<Vec<u8>>, String> {
    let path = machine_key_path()?;

    if path.exists() {
        let bytes = std::fs::read(&path)
            .map_err(|e| format!("failed to read machine key at {}: {e}", path.display()))?;
        if bytes.len() != 32 {
            return Err(format!(
                "machine key at {} has unexpected length {} (expected 32)",
                path.display(),
                bytes.len()
            ));
        }
        return Ok(Zeroizing::new(bytes));
    }

    let mut seed = Zeroizing::new(vec![0u8; 32]);
    rand::rng().fill_bytes(&mut seed);

    fsutil::write_secret_file(&path, &seed)
        .map_err(|e| format!("failed to write machine key to {}: {e}", path.display()))?;

    Ok(seed)
}

fn machine_key_path() -> Result<PathBuf, String> {
    fsutil::data_dir()
        .map(|d| d.join("machine-key"))
        .ok_or_else(|| {
            "cannot locate machine key: neither XDG_DATA_HOME nor HOME is set".to_string()
        })
}
