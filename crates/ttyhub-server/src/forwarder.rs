//! Foreground forwarder: run a command inside a managed session while
//! mirroring it on the controlling terminal.
//!
//! The local terminal goes raw, stdin bytes flow into the session's input
//! queue, and session output (injected titles included) is echoed to
//! stdout. The session stays reachable over its socket like any other, so
//! remote viewers can attach while the user keeps their terminal.

use crate::manager::{ResizeSource, SessionManager, SessionOptions, SESSION_ENV_VAR};
use crate::events::SessionEvent;
use crate::title::TitleMode;
use crossterm::tty::IsTty;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use ttyhub_core::{HubError, HubResult};

/// Options for a forwarded run.
#[derive(Debug, Default)]
pub struct ForwarderOptions {
    pub name: Option<String>,
    pub cwd: Option<PathBuf>,
    pub title_mode: Option<TitleMode>,
}

/// Whether this process already runs inside a managed session.
pub fn inside_session() -> bool {
    session_stamped(std::env::var_os(SESSION_ENV_VAR))
}

fn session_stamped(stamp: Option<std::ffi::OsString>) -> bool {
    stamp.is_some()
}

/// Run `command` as a session mirrored on the controlling terminal.
/// Returns the child's exit code.
pub async fn run_forwarder(
    manager: Arc<SessionManager>,
    command: Vec<String>,
    options: ForwarderOptions,
) -> HubResult<i32> {
    if inside_session() {
        return Err(HubError::Other(
            "already inside a managed session; refusing to nest".into(),
        ));
    }

    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));

    // Subscribe before creating so the exit event cannot be missed.
    let mut events = manager.subscribe();

    let (forward_tx, mut forward_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (id, _descriptor) = manager
        .create_session(
            command,
            SessionOptions {
                name: options.name,
                cwd: options.cwd,
                cols: Some(cols),
                rows: Some(rows),
                title_mode: options.title_mode,
                forward: Some(forward_tx),
            },
        )
        .await?;
    debug!(session_id = %id, cols, rows, "forwarding session to terminal");

    let _raw = RawModeGuard::new();

    // Terminal output: single consumer draining the forward queue.
    let echo_thread = std::thread::Builder::new()
        .name("ttyhub-echo".into())
        .spawn(move || {
            let mut stdout = std::io::stdout();
            while let Some(chunk) = forward_rx.blocking_recv() {
                if stdout
                    .write_all(&chunk)
                    .and_then(|_| stdout.flush())
                    .is_err()
                {
                    break;
                }
            }
        })
        .map_err(|e| HubError::Other(format!("echo thread: {e}")))?;

    // Terminal input: blocking stdin reads handed to the async input path.
    let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    std::thread::Builder::new()
        .name("ttyhub-stdin".into())
        .spawn(move || {
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if stdin_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
        .map_err(|e| HubError::Other(format!("stdin thread: {e}")))?;

    let input_task = {
        let manager = Arc::clone(&manager);
        let id = id.clone();
        tokio::spawn(async move {
            while let Some(bytes) = stdin_rx.recv().await {
                if let Err(e) = manager.send_input_bytes(&id, bytes).await {
                    debug!(session_id = %id, error = %e, "input rejected, session gone");
                    break;
                }
            }
        })
    };

    // Window changes propagate as terminal-sourced resizes, which yield to
    // recent remote resizes.
    let winch_task = {
        let manager = Arc::clone(&manager);
        let id = id.clone();
        tokio::spawn(async move {
            let mut winch = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::window_change(),
            ) {
                Ok(winch) => winch,
                Err(e) => {
                    warn!(error = %e, "cannot listen for window changes");
                    return;
                }
            };
            while winch.recv().await.is_some() {
                let (cols, rows) = match crossterm::terminal::size() {
                    Ok(size) => size,
                    Err(_) => continue,
                };
                if let Err(e) = manager
                    .resize_session(&id, cols, rows, ResizeSource::Terminal)
                    .await
                {
                    debug!(session_id = %id, error = %e, "resize failed");
                }
            }
        })
    };

    let exit_code = loop {
        match events.recv().await {
            Ok(SessionEvent::Exited {
                id: exited,
                exit_code,
            }) if exited == id => break exit_code,
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break 1,
        }
    };

    winch_task.abort();
    input_task.abort();
    // The forward sender inside the session is gone; the echo thread drains
    // whatever is left and exits.
    let _ = echo_thread.join();

    Ok(exit_code)
}

/// Puts the controlling terminal into raw mode for the lifetime of the
/// guard. A non-tty stdin (pipes, CI) leaves the terminal untouched.
struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    fn new() -> Self {
        if std::io::stdin().is_tty() {
            match crossterm::terminal::enable_raw_mode() {
                Ok(()) => return Self { active: true },
                Err(e) => warn!(error = %e, "cannot enable raw mode"),
            }
        }
        Self { active: false }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_is_detected_via_session_stamp() {
        assert!(!session_stamped(None));
        assert!(session_stamped(Some("deadbeef00000000".into())));
    }
}
