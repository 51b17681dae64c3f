//! The import session state machine.
//!
//! ```text
//!                 ┌──────────── PasswordRejected ◄───┐
//!                 ▼                                  │ bad password /
//! start ──► AwaitingPassword ──submit──► Validating ─┤ corrupt bundle
//!                 │                                  │
//!                 ├─cancel──► Canceled               └─ok──► Installed
//!                 ├─skip────► Skipped
//!                 └─discard─► Discarded
//! ```
//!
//! Any state may also end in `Failed` (source unreadable, store write
//! failed, discard could not delete the source).  [`ImportSession::run`]
//! only returns once a terminal state has been reached.
//!
//! Validation is pure.  The store is written exactly once, by a single
//! atomic `put` after a successful validation, so a session that ends in
//! anything other than `Installed` has not changed the store.

use std::path::PathBuf;
use std::sync::Arc;

use keyshare_core::config::Config;
use keyshare_core::prompt::{PromptContext, render_template};
use keyshare_core::{CredentialId, CredentialStore, ErrorKind};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::bundle::{self, BundleError};
use crate::prompt::{PasswordPrompt, PromptRequest, PromptResponse};
use crate::source::{BundleSource, SourceFiles};

/// Where a session is, or where it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingPassword,
    Validating,
    PasswordRejected,
    Installed,
    Canceled,
    Skipped,
    Discarded,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Installed | Self::Canceled | Self::Skipped | Self::Discarded | Self::Failed
        )
    }
}

/// Final result of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ImportOutcome {
    Installed,
    Canceled,
    Skipped,
    /// The source was deleted without importing.
    Discarded,
    Failed { kind: ErrorKind, message: String },
}

impl ImportOutcome {
    fn state(&self) -> SessionState {
        match self {
            Self::Installed => SessionState::Installed,
            Self::Canceled => SessionState::Canceled,
            Self::Skipped => SessionState::Skipped,
            Self::Discarded => SessionState::Discarded,
            Self::Failed { .. } => SessionState::Failed,
        }
    }

    /// Error kind for outcomes that are not a plain success.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            Self::Canceled => Some(ErrorKind::Canceled),
            _ => None,
        }
    }

    fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }
}

/// Everything a caller learns about a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub source: PathBuf,
    pub outcome: ImportOutcome,
    /// Every state entered, in order, ending with the terminal one.
    pub transitions: Vec<SessionState>,
    /// Number of prompt rounds issued.
    pub attempts: u32,
    pub installed: Vec<CredentialId>,
    pub source_deleted: bool,
    /// Set when delete-after-import failed.  The outcome is still `Installed`.
    pub cleanup_error: Option<String>,
}

impl ImportReport {
    pub fn cleanup_error_kind(&self) -> Option<ErrorKind> {
        self.cleanup_error.as_ref().map(|_| ErrorKind::HostIoFailure)
    }
}

/// Per-session behaviour switches.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub delete_after_import: bool,
    pub allow_skip: bool,
    /// Honour "delete without importing" answers.
    pub allow_discard: bool,
    /// Prompt label template; see [`render_template`].
    pub label_template: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ImportOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            delete_after_import: config.import.delete_after_import,
            allow_skip: config.import.allow_skip,
            allow_discard: config.import.allow_discard,
            label_template: config.prompt.label.clone(),
        }
    }
}

/// Cancels one session from outside.
///
/// Cancellation is honoured at any point before a submitted password has
/// been validated; afterwards the session runs to completion.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.tx.borrow()
    }

    async fn canceled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|c| *c).await;
    }
}

/// Shared collaborators for a run of import sessions.
pub struct ImportPipeline {
    store: Arc<dyn CredentialStore>,
    prompt: Arc<dyn PasswordPrompt>,
    files: Arc<dyn SourceFiles>,
    options: ImportOptions,
}

impl ImportPipeline {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        prompt: Arc<dyn PasswordPrompt>,
        files: Arc<dyn SourceFiles>,
        options: ImportOptions,
    ) -> Self {
        Self {
            store,
            prompt,
            files,
            options,
        }
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    /// Start a session for `source` with this pipeline's options.
    pub fn session(&self, source: BundleSource) -> ImportSession<'_> {
        ImportSession {
            pipeline: self,
            source,
            options: self.options.clone(),
            cancel: CancelHandle::new(),
            state: SessionState::AwaitingPassword,
            transitions: Vec::new(),
            attempts: 0,
        }
    }

    /// Import one source to completion.
    pub async fn import(&self, source: BundleSource) -> ImportReport {
        self.session(source).run().await
    }

    /// Import several sources one after another.  Each gets its own session;
    /// a failure or cancel in one does not stop the rest.
    pub async fn import_all(&self, sources: Vec<BundleSource>) -> Vec<ImportReport> {
        let mut reports = Vec::with_capacity(sources.len());
        for source in sources {
            reports.push(self.import(source).await);
        }
        reports
    }
}

/// One bundle moving through the state machine.
pub struct ImportSession<'a> {
    pipeline: &'a ImportPipeline,
    source: BundleSource,
    options: ImportOptions,
    cancel: CancelHandle,
    state: SessionState,
    transitions: Vec<SessionState>,
    attempts: u32,
}

impl ImportSession<'_> {
    /// Override this session's options.
    pub fn with_options(mut self, options: ImportOptions) -> Self {
        self.options = options;
        self
    }

    /// Handle that cancels this session.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn enter(&mut self, state: SessionState) {
        debug!(
            source = %self.source.display_name,
            from = ?self.state,
            to = ?state,
            "import: transition"
        );
        self.state = state;
        self.transitions.push(state);
    }

    fn finish(mut self, outcome: ImportOutcome, installed: Vec<CredentialId>) -> ImportReport {
        self.enter(outcome.state());
        match &outcome {
            ImportOutcome::Failed { kind, message } => {
                warn!(source = %self.source.display_name, %kind, %message, "import failed");
            }
            other => {
                info!(source = %self.source.display_name, outcome = ?other, "import finished");
            }
        }
        ImportReport {
            source: self.source.location,
            outcome,
            transitions: self.transitions,
            attempts: self.attempts,
            installed,
            source_deleted: false,
            cleanup_error: None,
        }
    }

    /// Drive the session to a terminal state.
    pub async fn run(mut self) -> ImportReport {
        let location = self.source.location.clone();
        self.enter(SessionState::AwaitingPassword);

        if self.cancel.is_canceled() {
            return self.finish(ImportOutcome::Canceled, Vec::new());
        }
        // The source is read once; every attempt validates the same bytes.
        let bytes: Arc<[u8]> = match self.pipeline.files.read(&location).await {
            Ok(b) => b.into(),
            Err(e) => {
                let message = format!("failed to read {}: {e}", location.display());
                let outcome = ImportOutcome::failed(ErrorKind::HostIoFailure, message);
                return self.finish(outcome, Vec::new());
            }
        };

        let mut error_label: Option<String> = None;
        loop {
            if self.state != SessionState::AwaitingPassword {
                self.enter(SessionState::AwaitingPassword);
            }
            self.attempts += 1;
            let request = PromptRequest {
                label: render_template(
                    &self.options.label_template,
                    &PromptContext {
                        file: self.source.display_name.clone(),
                        attempt: self.attempts,
                    },
                ),
                error_label: error_label.take(),
                attempt: self.attempts,
                allow_skip: self.options.allow_skip,
                allow_discard: self.options.allow_discard,
            };

            let response = tokio::select! {
                biased;
                _ = self.cancel.canceled() => PromptResponse::Canceled,
                r = self.pipeline.prompt.request(request) => r,
            };

            let password = match response {
                PromptResponse::Submitted(pw) => pw,
                PromptResponse::Canceled => {
                    return self.finish(ImportOutcome::Canceled, Vec::new());
                }
                PromptResponse::Skipped if self.options.allow_skip => {
                    return self.finish(ImportOutcome::Skipped, Vec::new());
                }
                PromptResponse::Skipped => {
                    warn!(source = %self.source.display_name, "skip not allowed here, canceling");
                    return self.finish(ImportOutcome::Canceled, Vec::new());
                }
                PromptResponse::Discard if self.options.allow_discard => {
                    return self.discard().await;
                }
                PromptResponse::Discard => {
                    warn!(source = %self.source.display_name, "delete not allowed here, canceling");
                    return self.finish(ImportOutcome::Canceled, Vec::new());
                }
            };

            self.enter(SessionState::Validating);
            let validated = tokio::select! {
                biased;
                _ = self.cancel.canceled() => None,
                r = validate(Arc::clone(&bytes), password) => Some(r),
            };
            let Some(validated) = validated else {
                return self.finish(ImportOutcome::Canceled, Vec::new());
            };

            match validated {
                Ok(credentials) => return self.install(credentials).await,
                Err(e) => {
                    info!(
                        source = %self.source.display_name,
                        attempt = self.attempts,
                        kind = %e.kind(),
                        error = %e,
                        "password rejected"
                    );
                    self.enter(SessionState::PasswordRejected);
                    error_label = Some(e.user_label());
                }
            }
        }
    }

    async fn install(self, credentials: Vec<keyshare_core::InstalledCredential>) -> ImportReport {
        let count = credentials.len();
        let ids = match self.pipeline.store.put(credentials) {
            Ok(ids) => ids,
            Err(e) => {
                let outcome = ImportOutcome::failed(ErrorKind::StoreWriteFailure, e.to_string());
                return self.finish(outcome, Vec::new());
            }
        };
        info!(source = %self.source.display_name, credentials = count, "installed");

        let delete = self.options.delete_after_import;
        let location = self.source.location.clone();
        let files = Arc::clone(&self.pipeline.files);
        let mut report = self.finish(ImportOutcome::Installed, ids);
        if delete {
            match files.delete(&location).await {
                Ok(()) => report.source_deleted = true,
                Err(e) => {
                    let message = format!("failed to delete {}: {e}", location.display());
                    warn!(kind = %ErrorKind::HostIoFailure, %message, "source kept after import");
                    report.cleanup_error = Some(message);
                }
            }
        }
        report
    }

    async fn discard(self) -> ImportReport {
        let location = self.source.location.clone();
        match self.pipeline.files.delete(&location).await {
            Ok(()) => {
                let mut report = self.finish(ImportOutcome::Discarded, Vec::new());
                report.source_deleted = true;
                report
            }
            Err(e) => {
                let message = format!("failed to delete {}: {e}", location.display());
                let outcome = ImportOutcome::failed(ErrorKind::HostIoFailure, message);
                self.finish(outcome, Vec::new())
            }
        }
    }
}

/// Open the bundle off the async executor; key derivation is CPU bound.
async fn validate(
    bytes: Arc<[u8]>,
    password: Zeroizing<String>,
) -> Result<Vec<keyshare_core::InstalledCredential>, BundleError> {
    tokio::task::spawn_blocking(move || bundle::open(&bytes, &password))
        .await
        .unwrap_or_else(|e| {
            Err(BundleError::Corrupt(format!(
                "validation task failed: {e}"
            )))
        })
}
