//! Password prompt protocol.
//!
//! The pipeline never talks to a UI directly.  Each time it needs a password
//! it sends one [`PromptRequest`] and waits for one [`PromptResponse`].  The
//! only state carried from one round to the next is the error label of the
//! rejected attempt.
//!
//! Two collaborators are provided here:
//! - any [`PasswordPrompt`] implementation (the CLI's terminal prompt is one),
//! - [`ChannelPrompt`], which forwards requests over an mpsc channel to a UI
//!   task and receives the answer on a per-request oneshot.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use zeroize::Zeroizing;

/// One round of "please enter the password".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    /// What is being unlocked, already rendered for display.
    pub label: String,
    /// Why the previous attempt was rejected, if it was.
    pub error_label: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Whether answering [`PromptResponse::Skipped`] will be honoured.
    pub allow_skip: bool,
    /// Whether answering [`PromptResponse::Discard`] will be honoured.
    pub allow_discard: bool,
}

/// The collaborator's answer to a [`PromptRequest`].
pub enum PromptResponse {
    Submitted(Zeroizing<String>),
    Canceled,
    Skipped,
    /// Delete the source without importing it.
    Discard,
}

impl std::fmt::Debug for PromptResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted(_) => f.write_str("Submitted([redacted])"),
            Self::Canceled => f.write_str("Canceled"),
            Self::Skipped => f.write_str("Skipped"),
            Self::Discard => f.write_str("Discard"),
        }
    }
}

/// Per-round prompt state.
///
/// Built fresh for every request; the submitted password is scrubbed when
/// the round ends.
#[derive(Debug, Default)]
pub struct PasswordPromptState {
    pub error_label: Option<String>,
    pub reveal_password: bool,
    pub password: Zeroizing<String>,
}

impl PasswordPromptState {
    pub fn for_request(request: &PromptRequest, reveal_password: bool) -> Self {
        Self {
            error_label: request.error_label.clone(),
            reveal_password,
            password: Zeroizing::new(String::new()),
        }
    }

    /// Toggle password visibility.
    pub fn toggle_reveal(&mut self) {
        self.reveal_password = !self.reveal_password;
    }

    /// Take the typed password as the response for this round.
    pub fn submit(&mut self) -> PromptResponse {
        PromptResponse::Submitted(std::mem::take(&mut self.password))
    }
}

/// Something that can answer password requests.
///
/// `request` may suspend for as long as the human needs.  Returning
/// [`PromptResponse::Canceled`] is also how implementations report that the
/// UI went away.
#[async_trait]
pub trait PasswordPrompt: Send + Sync {
    async fn request(&self, request: PromptRequest) -> PromptResponse;
}

/// A request travelling to a UI task, with its reply slot.
#[derive(Debug)]
pub struct PendingPrompt {
    pub request: PromptRequest,
    reply: oneshot::Sender<PromptResponse>,
}

impl PendingPrompt {
    /// Answer the request.  Returns `false` if the pipeline stopped waiting.
    pub fn respond(self, response: PromptResponse) -> bool {
        self.reply.send(response).is_ok()
    }
}

/// [`PasswordPrompt`] backed by a channel to a UI task.
#[derive(Debug, Clone)]
pub struct ChannelPrompt {
    tx: mpsc::Sender<PendingPrompt>,
}

impl ChannelPrompt {
    /// Create the prompt and the receiver the UI task reads requests from.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingPrompt>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PasswordPrompt for ChannelPrompt {
    async fn request(&self, request: PromptRequest) -> PromptResponse {
        let (reply, answer) = oneshot::channel();
        let attempt = request.attempt;
        if self.tx.send(PendingPrompt { request, reply }).await.is_err() {
            debug!(attempt, "prompt receiver gone, treating as cancel");
            return PromptResponse::Canceled;
        }
        answer.await.unwrap_or_else(|_| {
            debug!(attempt, "prompt dropped without an answer, treating as cancel");
            PromptResponse::Canceled
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(attempt: u32) -> PromptRequest {
        PromptRequest {
            label: "Enter the password for alice.p12".to_string(),
            error_label: None,
            attempt,
            allow_skip: true,
            allow_discard: true,
        }
    }

    #[tokio::test]
    async fn channel_prompt_round_trip() {
        let (prompt, mut rx) = ChannelPrompt::new(1);
        let ui = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            assert_eq!(pending.request.attempt, 1);
            assert!(pending.respond(PromptResponse::Submitted(Zeroizing::new(
                "secret".to_string()
            ))));
        });

        match prompt.request(request(1)).await {
            PromptResponse::Submitted(pw) => assert_eq!(pw.as_str(), "secret"),
            other => panic!("unexpected response: {other:?}"),
        }
        ui.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_ui_means_cancel() {
        let (prompt, rx) = ChannelPrompt::new(1);
        drop(rx);
        assert!(matches!(
            prompt.request(request(1)).await,
            PromptResponse::Canceled
        ));
    }

    #[tokio::test]
    async fn unanswered_request_means_cancel() {
        let (prompt, mut rx) = ChannelPrompt::new(1);
        let ui = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            drop(pending);
        });
        assert!(matches!(
            prompt.request(request(1)).await,
            PromptResponse::Canceled
        ));
        ui.await.unwrap();
    }

    #[test]
    fn state_carries_only_the_error_label() {
        let mut req = request(2);
        req.error_label = Some("Incorrect password, try again".to_string());
        let mut state = PasswordPromptState::for_request(&req, false);
        assert_eq!(state.error_label.as_deref(), Some("Incorrect password, try again"));
        assert!(state.password.is_empty());

        state.toggle_reveal();
        assert!(state.reveal_password);
        state.password.push_str("hunter2");
        match state.submit() {
            PromptResponse::Submitted(pw) => assert_eq!(pw.as_str(), "hunter2"),
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(state.password.is_empty());
    }

    #[test]
    fn debug_redacts_password() {
        let r = PromptResponse::Submitted(Zeroizing::new("hunter2".to_string()));
        assert_eq!(format!("{r:?}"), "Submitted([redacted])");
    }
}
