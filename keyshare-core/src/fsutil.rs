//! Filesystem helpers shared by the store and the materializer.

use std::path::{Path, PathBuf};

/// `$XDG_DATA_HOME/keyshare` (default `~/.local/share/keyshare`).
pub fn data_dir() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))?;
    Some(base.join("keyshare"))
}

/// `$XDG_RUNTIME_DIR/keyshare`, falling back to the system temp dir.
pub fn runtime_dir() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    Some(base.join("keyshare"))
}

/// Write `data` to `path` with Unix mode `0600`, replacing any existing file.
///
/// Writes a sibling `.tmp` file first and renames it over `path`, so readers
/// see either the old or the new content, never a partial write.  Missing
/// parent directories are created.
pub fn write_secret_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    {
        // Open with mode 0600 at creation time to avoid a window where the
        // file would be world-readable between open() and chmod().
        #[cfg(unix)]
        let mut f = {
            use std::os::unix::fs::OpenOptionsExt;
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp_path)?
        };
        #[cfg(not(unix))]
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        f.write_all(data)?;
        f.sync_all()?;
    }

    std::fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_honours_xdg() {
        let _guard = crate::TEST_ENV_MUTEX.lock().unwrap();
        unsafe { std::env::set_var("XDG_DATA_HOME", "/tmp/ks-xdg") };
        let dir = data_dir().unwrap();
        unsafe { std::env::remove_var("XDG_DATA_HOME") };
        assert_eq!(dir, PathBuf::from("/tmp/ks-xdg/keyshare"));
    }

    #[test]
    fn write_replaces_content_and_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        write_secret_file(&path, b"first").unwrap();
        write_secret_file(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!dir.path().join("nested").join("store.json.tmp").exists());
    }

    #[test]
    #[cfg(unix)]
    fn written_file_has_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.bin");
        write_secret_file(&path, b"x").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "file must be mode 0600, got {:o}", mode);
    }
}
