use std::path::PathBuf;

use keyshare_core::{ErrorKind, StoreError};

use crate::node::NodeId;

#[derive(thiserror::Error, Debug)]
pub enum VfsError {
    #[error("no such node: {0}")]
    NotFound(String),
    #[error("{0} is not a folder")]
    NotAFolder(NodeId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to build archive: {0}")]
    Archive(String),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl VfsError {
    pub(crate) fn not_found(id: &NodeId) -> Self {
        Self::NotFound(id.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::NotAFolder(_) => ErrorKind::NotFound,
            Self::Store(e) => e.kind(),
            Self::Archive(_) | Self::Io { .. } => ErrorKind::HostIoFailure,
        }
    }
}

impl From<zip::result::ZipError> for VfsError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Archive(e.to_string())
    }
}
