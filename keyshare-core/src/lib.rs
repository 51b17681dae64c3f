//! Shared types for keyshare.
//!
//! Everything that more than one crate needs lives here: the credential data
//! model, the [`CredentialStore`] seam that the virtual filesystem and the
//! import pipeline both talk to, the error kinds every terminal outcome is
//! classified by, and the ambient pieces (config, machine key, sealed
//! storage) used by the store and the CLI.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use zeroize::Zeroizing;

pub mod config;
pub mod fsutil;
pub mod machine_key;
pub mod prompt;
pub mod sealed;

/// Crate-wide mutex used by tests that mutate `XDG_DATA_HOME`.
///
/// Both `machine_key` and `fsutil` tests call `unsafe { env::set_var(...) }`;
/// a single process-wide lock prevents races between them.
#[cfg(test)]
pub(crate) static TEST_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable identifier of an installed credential.
///
/// Lowercase hex SHA-256 of the leaf certificate DER.  Re-importing the same
/// certificate yields the same id; two different leaf certificates never do.
///
/// Deserialization goes through [`CredentialId::parse`], so an id read back
/// from disk is always well formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CredentialId(String);

impl CredentialId {
    /// Derive the id from a DER-encoded leaf certificate.
    pub fn from_leaf_der(der: &[u8]) -> Self {
        Self(hex_lower(&Sha256::digest(der)))
    }

    /// Parse a user-supplied id.  Accepts exactly 64 hex characters.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(s))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 hex characters, used for display and filename disambiguation.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl TryFrom<String> for CredentialId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s).ok_or_else(|| format!("invalid credential id {s:?}: expected 64 hex characters"))
    }
}

impl From<CredentialId> for String {
    fn from(id: CredentialId) -> Self {
        id.0
    }
}

impl std::fmt::Display for CredentialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase hex encoding.
pub fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Credential data model
// ---------------------------------------------------------------------------

/// Public metadata for one installed credential.
///
/// Contains no key material; safe to log, list and serialise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub id: CredentialId,
    /// Human-readable name (leaf subject common name when present).
    pub friendly_name: String,
    pub subject: String,
    pub issuer: String,
    /// Certificate validity start, as printed by the certificate parser.
    pub not_before: String,
    pub not_after: String,
    /// Byte length of the exportable form (PKCS#12 when a key is present,
    /// otherwise the leaf certificate DER).
    pub size: u64,
    pub has_private_key: bool,
    /// Number of certificates in the chain, leaf included.
    pub chain_len: usize,
}

/// Zeroizing byte buffer that refuses to be serialised or printed.
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBytes([redacted])")
    }
}

impl Clone for SecretBytes {
    fn clone(&self) -> Self {
        Self(Zeroizing::new(self.0.to_vec()))
    }
}

/// A credential together with its material, as held by a store.
#[derive(Clone)]
pub struct InstalledCredential {
    pub entry: CredentialEntry,
    /// PKCS#8 DER private key, if the bundle carried one.
    pub private_key: Option<SecretBytes>,
    /// DER certificates, leaf first.
    pub chain: Vec<Vec<u8>>,
    /// Password-protected PKCS#12 generated at install time, served inside
    /// bundle files.  `None` for certificate-only credentials.
    pub export: Option<Vec<u8>>,
}

impl InstalledCredential {
    pub fn id(&self) -> &CredentialId {
        &self.entry.id
    }

    pub fn leaf_der(&self) -> Option<&[u8]> {
        self.chain.first().map(Vec::as_slice)
    }
}

impl std::fmt::Debug for InstalledCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstalledCredential")
            .field("entry", &self.entry)
            .field("private_key", &self.private_key.as_ref().map(|_| "[redacted]"))
            .field("chain", &self.chain.len())
            .field("export", &self.export.as_ref().map(Vec::len))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Machine-distinguishable classification carried by every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadPassword,
    CorruptBundle,
    StoreWriteFailure,
    NotFound,
    Canceled,
    HostIoFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadPassword => "bad_password",
            Self::CorruptBundle => "corrupt_bundle",
            Self::StoreWriteFailure => "store_write_failure",
            Self::NotFound => "not_found",
            Self::Canceled => "canceled",
            Self::HostIoFailure => "host_io_failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("credential {0} not found")]
    NotFound(CredentialId),
    #[error("store write failed: {0}")]
    Write(String),
    #[error("store data unreadable: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Write(_) | Self::Corrupt(_) => ErrorKind::StoreWriteFailure,
        }
    }
}

// ---------------------------------------------------------------------------
// Store seam
// ---------------------------------------------------------------------------

/// Consistent view of the store's public metadata at one generation.
#[derive(Debug, Clone)]
pub struct StoreView {
    pub generation: u64,
    /// Entries in insertion order.
    pub entries: Vec<CredentialEntry>,
}

/// The secure credential store as seen by the rest of keyshare.
///
/// Implementations serialise all writes globally.  `put` is an atomic batch:
/// readers observe either none or all of its entries.  Every successful
/// mutation advances the generation and notifies [`subscribe`] receivers.
///
/// [`subscribe`]: CredentialStore::subscribe
pub trait CredentialStore: Send + Sync {
    /// Metadata of every installed credential in insertion order.
    fn list(&self) -> Vec<CredentialEntry> {
        self.view().entries
    }

    /// Metadata and generation read under one lock.
    fn view(&self) -> StoreView;

    fn get(&self, id: &CredentialId) -> Result<Arc<InstalledCredential>, StoreError>;

    /// Install a batch.  Credentials whose id is already present replace the
    /// existing entry in place.  Returns the installed ids in batch order.
    fn put(&self, batch: Vec<InstalledCredential>) -> Result<Vec<CredentialId>, StoreError>;

    fn delete(&self, id: &CredentialId) -> Result<(), StoreError>;

    /// Remove every credential.  Returns how many were removed.
    fn clear(&self) -> Result<usize, StoreError>;

    fn generation(&self) -> u64 {
        self.view().generation
    }

    /// Change signal: the receiver observes the generation after each write.
    fn subscribe(&self) -> watch::Receiver<u64>;

    /// Pick up changes written by other processes.  `Ok(true)` when a new
    /// generation was published.  Stores with no shared backing have
    /// nothing to pick up.
    fn refresh(&self) -> Result<bool, StoreError> {
        Ok(false)
    }
}
