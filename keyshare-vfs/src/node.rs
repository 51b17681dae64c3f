//! Node identifiers and placeholder metadata.

use keyshare_core::{CredentialId, hex_lower};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What a virtual node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    RootFolder,
    BundleFile,
    DetailFile,
}

impl NodeKind {
    fn tag(self) -> &'static str {
        match self {
            Self::RootFolder => "root",
            Self::BundleFile => "bundle",
            Self::DetailFile => "detail",
        }
    }

    pub fn is_folder(self) -> bool {
        self == Self::RootFolder
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::RootFolder => "inode/directory",
            Self::BundleFile => "application/zip",
            Self::DetailFile => "application/json",
        }
    }
}

/// Opaque, stable identifier of a virtual node.
///
/// The root is `root`.  File ids are `<kind tag>-<32 hex>`, where the hex is
/// the first 128 bits of `SHA-256(tag || 0x00 || credential id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

const DIGEST_HEX_LEN: usize = 32;

impl NodeId {
    pub fn root() -> Self {
        Self(NodeKind::RootFolder.tag().to_string())
    }

    /// Deterministic id for `kind` of `credential`.  `RootFolder` ignores the
    /// credential.
    pub fn for_credential(kind: NodeKind, credential: &CredentialId) -> Self {
        if kind == NodeKind::RootFolder {
            return Self::root();
        }
        let tag = kind.tag();
        let mut hasher = Sha256::new();
        hasher.update(tag.as_bytes());
        hasher.update([0u8]);
        hasher.update(credential.as_str().as_bytes());
        let digest = hasher.finalize();
        Self(format!("{tag}-{}", hex_lower(&digest[..DIGEST_HEX_LEN / 2])))
    }

    /// Accept an id from outside (host layer, CLI).  Only the shape is
    /// checked; whether it resolves is a separate question.
    pub fn parse(s: &str) -> Option<Self> {
        let id = Self(s.trim().to_string());
        id.kind().map(|_| id)
    }

    /// The kind encoded in the id, or `None` if it is not a well-formed id.
    pub fn kind(&self) -> Option<NodeKind> {
        if self.0 == NodeKind::RootFolder.tag() {
            return Some(NodeKind::RootFolder);
        }
        let (tag, digest) = self.0.split_once('-')?;
        let well_formed = digest.len() == DIGEST_HEX_LEN
            && digest
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !well_formed {
            return None;
        }
        match tag {
            "bundle" => Some(NodeKind::BundleFile),
            "detail" => Some(NodeKind::DetailFile),
            _ => None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.kind() == Some(NodeKind::RootFolder)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Placeholder metadata for one node.
///
/// `size` is the exact length [`crate::VirtualFs::materialize`] returns at
/// the same generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub credential: Option<CredentialId>,
    pub filename: String,
    pub content_type: &'static str,
    pub size: u64,
    /// Certificate validity start for files; `None` for the root.
    pub modified: Option<String>,
}

impl VirtualNode {
    pub fn root() -> Self {
        Self {
            id: NodeId::root(),
            kind: NodeKind::RootFolder,
            parent: None,
            credential: None,
            filename: String::new(),
            content_type: NodeKind::RootFolder.content_type(),
            size: 0,
            modified: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_deterministic_and_kind_specific() {
        let cred = CredentialId::from_leaf_der(b"leaf");
        let a = NodeId::for_credential(NodeKind::BundleFile, &cred);
        let b = NodeId::for_credential(NodeKind::BundleFile, &cred);
        let d = NodeId::for_credential(NodeKind::DetailFile, &cred);
        assert_eq!(a, b);
        assert_ne!(a, d);
        assert!(a.as_str().starts_with("bundle-"));
        assert_eq!(a.as_str().len(), "bundle-".len() + 32);
    }

    #[test]
    fn kind_round_trips_through_parse() {
        let cred = CredentialId::from_leaf_der(b"leaf");
        let d = NodeId::for_credential(NodeKind::DetailFile, &cred);
        assert_eq!(NodeId::parse(d.as_str()), Some(d.clone()));
        assert_eq!(d.kind(), Some(NodeKind::DetailFile));
        assert_eq!(NodeId::root().kind(), Some(NodeKind::RootFolder));
        assert_eq!(
            NodeId::for_credential(NodeKind::RootFolder, &cred),
            NodeId::root()
        );
    }

    #[test]
    fn malformed_ids_have_no_kind() {
        assert!(NodeId::parse("bundle-xyz").is_none());
        assert!(NodeId::parse("folder-00000000000000000000000000000000").is_none());
        assert!(NodeId::parse("bundle-0000000000000000000000000000000A").is_none());
        assert!(NodeId::parse("").is_none());
    }
}
