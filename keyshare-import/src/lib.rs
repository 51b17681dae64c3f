//! PKCS#12 import pipeline.
//!
//! A bundle file goes through [`pipeline::ImportSession`]: the password is
//! requested through a [`prompt::PasswordPrompt`], checked by
//! [`bundle::open`] without touching the store, and on success every
//! credential in the bundle is installed with one atomic store write.

pub mod bundle;
pub mod pipeline;
pub mod prompt;
pub mod source;

#[cfg(test)]
mod testutil;

pub use bundle::BundleError;
pub use pipeline::{
    CancelHandle, ImportOptions, ImportOutcome, ImportPipeline, ImportReport, ImportSession,
    SessionState,
};
pub use prompt::{
    ChannelPrompt, PasswordPrompt, PasswordPromptState, PendingPrompt, PromptRequest,
    PromptResponse,
};
pub use source::{BundleSource, LocalFiles, SourceFiles};
