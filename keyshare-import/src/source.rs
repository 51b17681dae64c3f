//! Where bundles come from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Read and delete access to bundle sources.
#[async_trait]
pub trait SourceFiles: Send + Sync {
    async fn read(&self, location: &Path) -> std::io::Result<Vec<u8>>;
    async fn delete(&self, location: &Path) -> std::io::Result<()>;
}

/// Plain files on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFiles;

#[async_trait]
impl SourceFiles for LocalFiles {
    async fn read(&self, location: &Path) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(location).await
    }

    async fn delete(&self, location: &Path) -> std::io::Result<()> {
        tokio::fs::remove_file(location).await
    }
}

/// One bundle waiting to be imported.
#[derive(Debug, Clone)]
pub struct BundleSource {
    pub location: PathBuf,
    /// Name used in prompts and logs, normally the file name.
    pub display_name: String,
}

impl BundleSource {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        let location = location.into();
        let display_name = location
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| location.display().to_string());
        Self {
            location,
            display_name,
        }
    }
}
