//! Terminal title management: mode selection, title computation, OSC
//! filtering, and safe injection.
//!
//! Titles are injected into the viewer-facing output stream as OSC 2
//! sequences, but only during a quiet period and never mid-sequence or
//! mid-character. Only the most recently queued title is ever injected;
//! older pending titles are superseded.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How a session's terminal title is managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleMode {
    /// Pass output through untouched.
    #[default]
    None,
    /// Strip title sequences set by the application.
    Filter,
    /// Directory + command + session name, recomputed on change.
    Static,
    /// Static plus a liveness indicator and recognized-tool status.
    Dynamic,
}

impl std::str::FromStr for TitleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(TitleMode::None),
            "filter" => Ok(TitleMode::Filter),
            "static" => Ok(TitleMode::Static),
            "dynamic" => Ok(TitleMode::Dynamic),
            other => Err(format!("unknown title mode: {other}")),
        }
    }
}

/// Compose the static title: directory, command, session name.
pub fn static_title(cwd: &Path, command: &[String], name: &str) -> String {
    format!(
        "{} · {} · {}",
        abbreviate_home(cwd),
        command.join(" "),
        name
    )
}

/// Compose the dynamic title: adds a liveness indicator and, when a tool
/// was recognized, its status string.
pub fn dynamic_title(
    cwd: &Path,
    command: &[String],
    name: &str,
    active: bool,
    status: Option<&str>,
) -> String {
    let indicator = if active { '●' } else { '○' };
    let base = static_title(cwd, command, name);
    match status {
        Some(status) => format!("{indicator} {base} · {status}"),
        None => format!("{indicator} {base}"),
    }
}

/// Encode a title as an OSC 2 sequence.
pub fn osc_title(title: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(title.len() + 6);
    out.extend_from_slice(b"\x1b]2;");
    out.extend_from_slice(title.as_bytes());
    out.push(0x07);
    out
}

fn abbreviate_home(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if let Some(home) = dirs::home_dir() {
        let home = home.to_string_lossy();
        if let Some(rest) = raw.strip_prefix(home.as_ref()) {
            if rest.is_empty() {
                return "~".to_string();
            }
            if rest.starts_with('/') {
                return format!("~{rest}");
            }
        }
    }
    raw.into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    Ground,
    Escape,
    /// Collecting the OSC parameter digits, undecided yet.
    OscParam,
    /// Inside a title-setting OSC (0/1/2): swallow until BEL/ST.
    DropTitle,
    DropTitleEscape,
    /// Inside some other OSC: pass through until BEL/ST.
    PassOsc,
    PassOscEscape,
}

/// Strips application-set title sequences (OSC 0/1/2) from an output
/// stream, preserving everything else. State persists across chunks.
#[derive(Debug)]
pub struct TitleFilter {
    state: FilterState,
    /// Bytes withheld since the potential sequence start, replayed when
    /// the sequence turns out not to be a title.
    pending: Vec<u8>,
}

impl Default for TitleFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl TitleFilter {
    pub fn new() -> Self {
        Self {
            state: FilterState::Ground,
            pending: Vec::new(),
        }
    }

    pub fn filter(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len());
        for &byte in chunk {
            match self.state {
                FilterState::Ground => {
                    if byte == 0x1b {
                        self.state = FilterState::Escape;
                        self.pending.push(byte);
                    } else {
                        out.push(byte);
                    }
                }
                FilterState::Escape => match byte {
                    b']' => {
                        self.pending.push(byte);
                        self.state = FilterState::OscParam;
                    }
                    0x1b => {
                        // ESC ESC: release the first, withhold the second.
                        out.append(&mut self.pending);
                        self.pending.push(0x1b);
                    }
                    _ => {
                        // Not an OSC: replay withheld bytes untouched.
                        out.append(&mut self.pending);
                        out.push(byte);
                        self.state = FilterState::Ground;
                    }
                },
                FilterState::OscParam => {
                    self.pending.push(byte);
                    match byte {
                        b'0'..=b'9' => {
                            // Still collecting the parameter.
                        }
                        b';' => {
                            let digits = &self.pending[2..self.pending.len() - 1];
                            let is_title =
                                matches!(digits, b"" | b"0" | b"1" | b"2");
                            if is_title {
                                self.pending.clear();
                                self.state = FilterState::DropTitle;
                            } else {
                                out.append(&mut self.pending);
                                self.state = FilterState::PassOsc;
                            }
                        }
                        _ => {
                            // Malformed or non-numeric param: pass through.
                            out.append(&mut self.pending);
                            self.state = FilterState::PassOsc;
                        }
                    }
                }
                FilterState::DropTitle => match byte {
                    0x07 => self.state = FilterState::Ground,
                    0x1b => self.state = FilterState::DropTitleEscape,
                    _ => {}
                },
                FilterState::DropTitleEscape => match byte {
                    b'\\' => self.state = FilterState::Ground,
                    _ => self.state = FilterState::DropTitle,
                },
                FilterState::PassOsc => {
                    out.push(byte);
                    match byte {
                        0x07 => self.state = FilterState::Ground,
                        0x1b => self.state = FilterState::PassOscEscape,
                        _ => {}
                    }
                }
                FilterState::PassOscEscape => {
                    out.push(byte);
                    self.state = match byte {
                        b'\\' => FilterState::Ground,
                        _ => FilterState::PassOsc,
                    };
                }
            }
        }
        out
    }
}

/// Supersede-only queue of pending titles.
///
/// Deduplicates against both the queued and the last injected title, so
/// the 1-second refresh only emits when content actually changed.
#[derive(Debug, Default)]
pub struct TitleInjector {
    pending: Option<String>,
    last_injected: Option<String>,
}

/// Minimum quiet interval before a pending title may flush.
pub const QUIET_PERIOD: Duration = Duration::from_millis(50);

/// Idle span after which a stream parked mid-sequence is assumed abandoned
/// and the pending title flushes anyway.
pub const STUCK_SEQUENCE_IDLE: Duration = Duration::from_secs(1);

/// Polling cadence of the injection monitor.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(10);

impl TitleInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a title, superseding any pending one.
    pub fn queue(&mut self, title: String) {
        if self.last_injected.as_deref() == Some(title.as_str()) && self.pending.is_none() {
            return;
        }
        if self.pending.as_deref() == Some(title.as_str()) {
            return;
        }
        self.pending = Some(title);
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the pending title if the stream has been idle long enough.
    /// `quiescent` reflects the boundary classifier; a non-quiescent stream
    /// only flushes after the longer stuck-sequence idle span.
    pub fn take_if_ready(&mut self, idle: Duration, quiescent: bool) -> Option<String> {
        if self.pending.is_none() {
            return None;
        }
        let ready = idle >= QUIET_PERIOD && (quiescent || idle >= STUCK_SEQUENCE_IDLE);
        if !ready {
            return None;
        }
        let title = self.pending.take();
        self.last_injected = title.clone();
        title
    }
}
