use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::fsutil;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub mount: MountConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Encrypted file under the data directory.
    #[default]
    File,
    /// In-process only; everything is lost on exit.
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Store file location.  Defaults to `$XDG_DATA_HOME/keyshare/store.json`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path
            .clone()
            .or_else(|| fsutil::data_dir().map(|d| d.join("store.json")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Remove the source bundle once it has been installed.
    #[serde(default)]
    pub delete_after_import: bool,
    /// Offer "skip" in the prompt so batch imports can move on.
    #[serde(default = "default_true")]
    pub allow_skip: bool,
    /// Offer "delete without importing" in the prompt.
    #[serde(default = "default_true")]
    pub allow_discard: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            delete_after_import: false,
            allow_skip: true,
            allow_discard: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Template for the prompt label.  `{{file}}` and `{{attempt}}` are
    /// substituted.
    #[serde(default = "default_prompt_label")]
    pub label: String,
    /// Echo the password while typing.
    #[serde(default)]
    pub reveal_password: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            label: default_prompt_label(),
            reveal_password: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Defaults to `$XDG_RUNTIME_DIR/keyshare/files`.
    #[serde(default)]
    pub mountpoint: Option<PathBuf>,
    #[serde(default = "default_fs_name")]
    pub fs_name: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mountpoint: None,
            fs_name: default_fs_name(),
        }
    }
}

impl MountConfig {
    pub fn resolved_mountpoint(&self) -> Option<PathBuf> {
        self.mountpoint
            .clone()
            .or_else(|| fsutil::runtime_dir().map(|d| d.join("files")))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Where `materialize_to` places transient files.  Defaults to
    /// `<system temp>/keyshare`.
    #[serde(default)]
    pub transient_dir: Option<PathBuf>,
}

impl ExportConfig {
    pub fn resolved_transient_dir(&self) -> PathBuf {
        self.transient_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("keyshare"))
    }
}

/// `$XDG_CONFIG_HOME/keyshare/config.toml` (default `~/.config/...`).
pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("keyshare").join("config.toml")
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load the config file, falling back to defaults when it does not exist.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(meta) = std::fs::metadata(path) {
            let mode = meta.mode();
            if mode & 0o077 != 0 {
                warn!(
                    path = %path.display(),
                    mode = format!("{:o}", mode & 0o777),
                    "config file is readable by group or others, recommend chmod 600"
                );
            }
        }
    }

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_true() -> bool {
    true
}

fn default_prompt_label() -> String {
    "Enter the password for {{file}}".to_string()
}

fn default_fs_name() -> String {
    "keyshare".to_string()
}
