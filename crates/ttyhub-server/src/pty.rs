//! PTY allocation and process spawn using portable-pty.
//!
//! Spawn failures map to specific causes (command not found, not
//! executable, PTY allocation failure, bad working directory) so callers
//! never see raw spawn errors.

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use ttyhub_core::{HubError, HubResult, SpawnFailure};

/// Everything a freshly spawned PTY session hands to the manager: the
/// parts are distributed to the reader thread, the input queue task, the
/// resize path, and the exit-wait task.
pub struct SpawnedPty {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub master: Box<dyn MasterPty + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub pid: u32,
}

/// Spawn `command` on a fresh PTY of the given geometry.
///
/// `env` entries are applied on top of the inherited environment; the
/// caller includes the self-identifying session stamp there.
pub fn spawn_pty(
    command: &[String],
    cwd: &Path,
    env: &HashMap<String, String>,
    cols: u16,
    rows: u16,
) -> HubResult<SpawnedPty> {
    let program = command.first().ok_or_else(|| HubError::SpawnFailed {
        command: String::new(),
        cause: SpawnFailure::NotFound,
        detail: "empty command".into(),
    })?;

    if !cwd.is_dir() {
        return Err(HubError::SpawnFailed {
            command: program.clone(),
            cause: SpawnFailure::BadWorkingDir,
            detail: format!("{} is not a directory", cwd.display()),
        });
    }

    let resolved = resolve_command(program)?;

    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };
    let pair = native_pty_system()
        .openpty(size)
        .map_err(|e| HubError::SpawnFailed {
            command: program.clone(),
            cause: SpawnFailure::PtyAllocation,
            detail: e.to_string(),
        })?;

    let mut cmd = CommandBuilder::new(resolved);
    for arg in &command[1..] {
        cmd.arg(arg);
    }
    cmd.cwd(cwd.as_os_str().to_os_string());
    cmd.env("TERM", "xterm-256color");
    for (key, value) in env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| HubError::SpawnFailed {
            command: program.clone(),
            cause: spawn_error_cause(&e.to_string()),
            detail: e.to_string(),
        })?;
    drop(pair.slave);

    let pid = child.process_id().ok_or_else(|| HubError::SpawnFailed {
        command: program.clone(),
        cause: SpawnFailure::PtyAllocation,
        detail: "spawned child has no pid".into(),
    })?;

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| HubError::Other(format!("cannot clone PTY reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| HubError::Other(format!("cannot take PTY writer: {e}")))?;

    info!(command = %program, pid, cols, rows, "PTY spawned");

    Ok(SpawnedPty {
        reader,
        writer,
        master: pair.master,
        child,
        pid,
    })
}

/// Resize a PTY master.
pub fn resize_master(master: &dyn MasterPty, cols: u16, rows: u16) -> HubResult<String> {
    master
        .resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| HubError::Other(format!("PTY resize: {e}")))?;
    Ok(format!("{cols}x{rows}"))
}

/// Resolve a program name to an executable path: absolute/relative paths
/// are checked directly, bare names searched on PATH.
fn resolve_command(program: &str) -> HubResult<PathBuf> {
    let not_found = || HubError::SpawnFailed {
        command: program.to_string(),
        cause: SpawnFailure::NotFound,
        detail: format!("{program} not found"),
    };

    if program.contains('/') {
        let path = PathBuf::from(program);
        if !path.is_file() {
            return Err(not_found());
        }
        if !is_executable(&path) {
            return Err(HubError::SpawnFailed {
                command: program.to_string(),
                cause: SpawnFailure::NotExecutable,
                detail: format!("{program} is not executable"),
            });
        }
        return Ok(path);
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    let mut found_non_executable = false;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            if is_executable(&candidate) {
                return Ok(candidate);
            }
            found_non_executable = true;
        }
    }
    if found_non_executable {
        Err(HubError::SpawnFailed {
            command: program.to_string(),
            cause: SpawnFailure::NotExecutable,
            detail: format!("{program} found on PATH but not executable"),
        })
    } else {
        Err(not_found())
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn spawn_error_cause(detail: &str) -> SpawnFailure {
    if detail.contains("No such file") {
        SpawnFailure::NotFound
    } else if detail.contains("Permission denied") {
        SpawnFailure::NotExecutable
    } else {
        SpawnFailure::PtyAllocation
    }
}
