//! Terminal password prompt.
//!
//! Reads from stdin and writes prompts to stderr so stdout stays clean for
//! command output.  When stdin is a terminal, echo is disabled while the
//! password is typed and the original `termios` is restored afterwards.
//! When stdin is not a terminal (piped input) lines are read as-is, one byte
//! at a time so nothing meant for the next prompt is buffered away.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use async_trait::async_trait;
use keyshare_import::{PasswordPrompt, PasswordPromptState, PromptRequest, PromptResponse};
use tracing::warn;
use zeroize::Zeroizing;

const STDIN: RawFd = libc::STDIN_FILENO;

/// Restores the original `termios` settings on the given fd when dropped.
struct TermiosGuard {
    fd: RawFd,
    orig: libc::termios,
}

impl TermiosGuard {
    /// Save the current settings and turn echo off.  `Ok(None)` when `fd`
    /// is not a terminal.
    fn disable_echo(fd: RawFd) -> io::Result<Option<Self>> {
        // SAFETY: term is only read after tcgetattr reports success.
        let orig = unsafe {
            let mut term = std::mem::MaybeUninit::<libc::termios>::uninit();
            if libc::tcgetattr(fd, term.as_mut_ptr()) != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ENOTTY) {
                    return Ok(None);
                }
                return Err(err);
            }
            term.assume_init()
        };
        let guard = Self { fd, orig };

        let mut noecho = guard.orig;
        noecho.c_lflag &= !(libc::ECHO as libc::tcflag_t);
        noecho.c_lflag &= !(libc::ECHONL as libc::tcflag_t);
        // TCSAFLUSH drops keypresses typed before the prompt appeared.
        // SAFETY: noecho is a valid termios copied from the fd.
        if unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &noecho) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Some(guard))
    }
}

impl Drop for TermiosGuard {
    fn drop(&mut self) {
        // Best effort: a closed fd has no terminal state left to restore.
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.orig);
        }
    }
}

fn is_terminal(fd: RawFd) -> bool {
    unsafe { libc::isatty(fd) == 1 }
}

/// Read one line from `fd`.  `Ok(None)` on end of input.
///
/// The buffer is `Zeroizing` so the raw bytes are scrubbed on drop.
fn read_line(fd: RawFd) -> io::Result<Option<Zeroizing<String>>> {
    use std::os::unix::io::FromRawFd as _;

    // SAFETY: ManuallyDrop keeps the borrowed fd open.
    let file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });
    let mut buf = Zeroizing::new(Vec::<u8>::new());
    let mut byte = [0u8; 1];
    loop {
        match (&*file).read(&mut byte) {
            Ok(0) if buf.is_empty() => return Ok(None),
            Ok(0) => break,
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => buf.push(byte[0]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    while buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let s = std::str::from_utf8(&buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .to_string();
    Ok(Some(Zeroizing::new(s)))
}

/// Read one line with echo disabled when `fd` is a terminal.
fn read_hidden(fd: RawFd) -> io::Result<Option<Zeroizing<String>>> {
    let guard = TermiosGuard::disable_echo(fd)?;
    let line = read_line(fd);
    if guard.is_some() {
        drop(guard);
        // The user's Enter was not echoed.
        let _ = io::stderr().write_all(b"\n");
    }
    line
}

/// What to do with a bundle before any password is typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Import,
    Skip,
    Delete,
    Cancel,
}

impl Action {
    /// Parse a menu answer.  Empty input picks the default, import.  Choices
    /// the request does not offer are unrecognised.
    fn parse(answer: &str, request: &PromptRequest) -> Option<Self> {
        match answer.trim().to_ascii_lowercase().as_str() {
            "" | "i" | "import" => Some(Self::Import),
            "s" | "skip" if request.allow_skip => Some(Self::Skip),
            "d" | "delete" if request.allow_discard => Some(Self::Delete),
            "c" | "cancel" => Some(Self::Cancel),
            _ => None,
        }
    }
}

fn menu_line(request: &PromptRequest) -> String {
    let mut choices = vec!["[I]mport"];
    if request.allow_skip {
        choices.push("[s]kip");
    }
    if request.allow_discard {
        choices.push("[d]elete without importing");
    }
    choices.push("[c]ancel");
    format!("{}: ", choices.join(", "))
}

/// Interactive [`PasswordPrompt`] on the controlling terminal.
#[derive(Debug, Clone)]
pub struct TtyPrompt {
    reveal_password: bool,
    show_menu: bool,
}

impl TtyPrompt {
    /// The action menu is offered on the first round of each bundle, and
    /// only when stdin is a terminal.
    pub fn new(reveal_password: bool) -> Self {
        Self {
            reveal_password,
            show_menu: is_terminal(STDIN),
        }
    }

    fn ask(&self, request: &PromptRequest) -> io::Result<PromptResponse> {
        let mut err = io::stderr();

        if self.show_menu && request.attempt == 1 {
            loop {
                write!(err, "\n{}\n{}", request.label, menu_line(request))?;
                err.flush()?;
                let Some(answer) = read_line(STDIN)? else {
                    return Ok(PromptResponse::Canceled);
                };
                match Action::parse(&answer, request) {
                    Some(Action::Import) => break,
                    Some(Action::Skip) => return Ok(PromptResponse::Skipped),
                    Some(Action::Delete) => return Ok(PromptResponse::Discard),
                    Some(Action::Cancel) => return Ok(PromptResponse::Canceled),
                    None => writeln!(err, "unrecognised choice: {}", answer.trim())?,
                }
            }
        }

        let mut state = PasswordPromptState::for_request(request, self.reveal_password);
        if let Some(error_label) = &state.error_label {
            writeln!(err, "{error_label}")?;
        }
        write!(err, "{}: ", request.label)?;
        err.flush()?;

        let line = if state.reveal_password {
            read_line(STDIN)?
        } else {
            read_hidden(STDIN)?
        };
        match line {
            Some(password) if !password.is_empty() => {
                state.password = password;
                Ok(state.submit())
            }
            _ => Ok(PromptResponse::Canceled),
        }
    }
}

#[async_trait]
impl PasswordPrompt for TtyPrompt {
    async fn request(&self, request: PromptRequest) -> PromptResponse {
        let prompt = self.clone();
        let attempt = request.attempt;
        match tokio::task::spawn_blocking(move || prompt.ask(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(attempt, "terminal prompt failed: {e}");
                PromptResponse::Canceled
            }
            Err(e) => {
                warn!(attempt, "prompt task panicked: {e}");
                PromptResponse::Canceled
            }
        }
    }
}
