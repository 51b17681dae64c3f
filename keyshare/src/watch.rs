//! Reload the credential store when another process rewrites its file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keyshare_core::CredentialStore;
use notify::Watcher as _;
use tokio::sync::mpsc;

/// Quiet period that folds the temp-file write and rename of one save into
/// a single reload.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Watch `store_path` and call [`CredentialStore::refresh`] after each
/// change, so a long-running mount follows imports and removals made by
/// other `keyshare` commands.
///
/// Reload errors are logged; the current contents stay in place.
pub async fn store_watcher(store: Arc<dyn CredentialStore>, store_path: PathBuf) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<()>(1);

    let file_name = store_path.file_name().map(ToOwned::to_owned);
    let mut watcher = notify::RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                use notify::EventKind::*;
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == file_name.as_deref());
                if ours && matches!(event.kind, Modify(_) | Create(_) | Remove(_)) {
                    let _ = tx.try_send(());
                }
            }
            Err(e) => tracing::warn!("store watcher notify error: {e}"),
        },
        notify::Config::default(),
    )?;

    // The store is replaced by rename, so watch the directory, not the file.
    let watch_dir = store_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(watch_dir)?;
    watcher.watch(watch_dir, notify::RecursiveMode::NonRecursive)?;
    tracing::info!(path = %store_path.display(), "store watcher started");

    while rx.recv().await.is_some() {
        while let Ok(Some(())) = tokio::time::timeout(DEBOUNCE, rx.recv()).await {}

        match store.refresh() {
            Ok(true) => tracing::debug!(generation = store.generation(), "store reloaded from disk"),
            Ok(false) => {}
            Err(e) => tracing::warn!(
                path = %store_path.display(),
                error = %e,
                "store reload failed, keeping current contents"
            ),
        }
    }
    Ok(())
}
