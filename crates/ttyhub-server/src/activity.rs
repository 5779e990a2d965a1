//! Output activity tracking for dynamic terminal titles.
//!
//! Keeps a liveness window over recent output plus a small tail buffer in
//! which recognized interactive tools are detected, so the dynamic title
//! can show a tool-specific status string.

use std::time::{Duration, Instant};

/// How recently output must have arrived for the session to count as active.
const ACTIVE_WINDOW: Duration = Duration::from_secs(2);

/// Bytes of decoded output kept for status detection.
const TAIL_CAPACITY: usize = 512;

/// Status extracted from a recognized interactive tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStatus {
    pub app: String,
    pub status: String,
}

#[derive(Debug)]
pub struct ActivityTracker {
    last_output: Instant,
    seen_output: bool,
    tail: Vec<u8>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last_output: Instant::now(),
            seen_output: false,
            tail: Vec::new(),
        }
    }

    pub fn note_output(&mut self, chunk: &[u8]) {
        self.last_output = Instant::now();
        self.seen_output = true;
        self.tail.extend_from_slice(chunk);
        if self.tail.len() > TAIL_CAPACITY {
            let excess = self.tail.len() - TAIL_CAPACITY;
            self.tail.drain(..excess);
        }
    }

    pub fn is_active(&self) -> bool {
        self.seen_output && self.last_output.elapsed() < ACTIVE_WINDOW
    }

    pub fn last_output(&self) -> Instant {
        self.last_output
    }

    /// Detect a recognized interactive tool in the recent output tail.
    ///
    /// Claude Code prints spinner lines ending in `(esc to interrupt)`;
    /// the word before the ellipsis is its current activity.
    pub fn app_status(&self) -> Option<AppStatus> {
        let tail = String::from_utf8_lossy(&self.tail);
        let marker = tail.rfind("esc to interrupt")?;
        let before = &tail[..marker];
        let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let line = &before[line_start..];
        let status = line
            .split(|c: char| c == '…' || c == '(')
            .next()
            .unwrap_or("")
            .trim_matches(|c: char| !c.is_alphanumeric())
            .trim();
        if status.is_empty() {
            return None;
        }
        Some(AppStatus {
            app: "claude".to_string(),
            status: status.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_until_output_arrives() {
        let tracker = ActivityTracker::new();
        assert!(!tracker.is_active());
    }

    #[test]
    fn active_after_output() {
        let mut tracker = ActivityTracker::new();
        tracker.note_output(b"hello");
        assert!(tracker.is_active());
    }

    #[test]
    fn detects_claude_spinner() {
        let mut tracker = ActivityTracker::new();
        tracker.note_output("build ok\n✻ Crafting… (esc to interrupt)".as_bytes());
        let status = tracker.app_status().unwrap();
        assert_eq!(status.app, "claude");
        assert_eq!(status.status, "Crafting");
    }

    #[test]
    fn no_status_for_plain_output() {
        let mut tracker = ActivityTracker::new();
        tracker.note_output(b"make: nothing to be done\n");
        assert!(tracker.app_status().is_none());
    }

    #[test]
    fn tail_is_bounded() {
        let mut tracker = ActivityTracker::new();
        tracker.note_output(&vec![b'x'; 4096]);
        assert!(tracker.tail.len() <= TAIL_CAPACITY);
    }
}
