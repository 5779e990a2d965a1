//! Session recording writer.
//!
//! Serializes session events to an append-only JSON-lines file: one header
//! line, then one `[elapsed, kind, data]` array per event, closed by an
//! `["exit", code, sessionId]` marker. All writes funnel through a single
//! consumer task so concurrent producers serialize in call order; each line
//! is followed by a best-effort durability flush.
//!
//! Output passes through the boundary classifier first: an event line never
//! contains a split escape sequence or a truncated multi-byte character.
//! Incomplete tails are held and prepended to the next chunk; on close an
//! unfinished tail is flushed via lossy decoding rather than dropped.

use crate::boundary::BoundaryScanner;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use ttyhub_core::{HubError, HubResult};

/// Recording format version, line 1 of every file.
pub const CAST_VERSION: u32 = 2;

/// Header preceding all events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastHeader {
    pub version: u32,
    pub width: u16,
    pub height: u16,
    /// Unix seconds at session start.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

enum WriteOp {
    Line(String),
    Shutdown,
}

/// Cloneable producer handle onto the recording's write queue.
///
/// Every event method is non-blocking; serialization order on disk is the
/// order of calls into the queue.
#[derive(Clone)]
pub struct CastSink {
    tx: UnboundedSender<WriteOp>,
    start: Instant,
}

impl CastSink {
    fn push_line(&self, line: String) {
        if self.tx.send(WriteOp::Line(line)).is_err() {
            warn!("recording queue closed, event dropped");
        }
    }

    fn elapsed(&self) -> f64 {
        // Millisecond precision keeps lines compact.
        (self.start.elapsed().as_secs_f64() * 1000.0).round() / 1000.0
    }

    fn event(&self, kind: &str, data: &str) {
        match serde_json::to_string(&(self.elapsed(), kind, data)) {
            Ok(mut line) => {
                line.push('\n');
                self.push_line(line);
            }
            Err(e) => error!(error = %e, "failed to serialize recording event"),
        }
    }

    /// Record decoded terminal output.
    pub fn output(&self, text: &str) {
        self.event("o", text);
    }

    /// Record input sent to the session.
    pub fn input(&self, text: &str) {
        self.event("i", text);
    }

    /// Record a terminal resize as `"colsxrows"`.
    pub fn resize(&self, cols: u16, rows: u16) {
        self.event("r", &format!("{cols}x{rows}"));
    }

    /// Record a named marker.
    pub fn marker(&self, label: &str) {
        self.event("m", label);
    }

    /// Record the terminal exit marker.
    pub fn exit_marker(&self, exit_code: i32, session_id: &str) {
        match serde_json::to_string(&serde_json::json!(["exit", exit_code, session_id])) {
            Ok(mut line) => {
                line.push('\n');
                self.push_line(line);
            }
            Err(e) => error!(error = %e, "failed to serialize exit marker"),
        }
    }

    /// Ask the writer task to finish. The file is finalized once the task's
    /// join handle resolves; all previously queued lines drain first.
    pub fn shutdown(&self) {
        let _ = self.tx.send(WriteOp::Shutdown);
    }
}

/// Open a recording file: writes the header line and spawns the single
/// consumer write task. Returns the producer sink and the task handle to
/// await on close.
///
/// `flush_each_event` controls the per-line durability flush; flush failures
/// are logged, never fatal.
pub async fn open_cast(
    path: &Path,
    header: CastHeader,
    flush_each_event: bool,
) -> HubResult<(CastSink, JoinHandle<()>)> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;

    let mut line = serde_json::to_string(&header)
        .map_err(|e| HubError::Other(format!("cast header serialization: {e}")))?;
    line.push('\n');
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let path_display = path.display().to_string();
    let task = tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            match op {
                WriteOp::Line(line) => {
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        error!(path = %path_display, error = %e, "recording write failed");
                        continue;
                    }
                    if flush_each_event {
                        if let Err(e) = file.sync_data().await {
                            debug!(path = %path_display, error = %e, "recording flush failed");
                        }
                    }
                }
                WriteOp::Shutdown => break,
            }
        }
        if let Err(e) = file.flush().await {
            debug!(path = %path_display, error = %e, "final recording flush failed");
        }
        debug!(path = %path_display, "recording finalized");
    });

    Ok((CastSink { tx, start: Instant::now() }, task))
}

/// A sink that discards every event, for sessions with recording disabled.
/// Producers stay oblivious to whether a file backs the queue.
pub fn discard_sink() -> (CastSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            if matches!(op, WriteOp::Shutdown) {
                break;
            }
        }
    });
    (CastSink { tx, start: Instant::now() }, task)
}

/// Boundary-aware output stage in front of a [`CastSink`].
///
/// Owned by the single output pump of a session, so it needs no locking.
pub struct OutputRecorder {
    sink: CastSink,
    scanner: BoundaryScanner,
    holdback: Vec<u8>,
}

impl OutputRecorder {
    pub fn new(sink: CastSink) -> Self {
        Self {
            sink,
            scanner: BoundaryScanner::new(),
            holdback: Vec::new(),
        }
    }

    /// Record a raw output chunk. The suffix that would split an escape
    /// sequence or a multi-byte character is held until a later chunk
    /// completes it.
    pub fn output(&mut self, chunk: &[u8]) {
        let report = self.scanner.scan(chunk);
        self.holdback.extend_from_slice(chunk);
        if report.safe_len == 0 {
            // The whole chunk extends an unfinished sequence or character;
            // the held tail stays held, emitting it now would split it.
            return;
        }
        let emit_len = self.holdback.len() - (chunk.len() - report.safe_len);
        let emit: Vec<u8> = self.holdback.drain(..emit_len).collect();
        self.sink.output(&String::from_utf8_lossy(&emit));
    }

    /// Whether the stream currently sits at a safe insertion point.
    pub fn is_quiescent(&self) -> bool {
        self.scanner.is_quiescent()
    }

    /// Flush any unfinished tail via lossy decoding. Called once the
    /// process has exited and no continuation can arrive.
    pub fn finish(&mut self) {
        if !self.holdback.is_empty() {
            let tail = std::mem::take(&mut self.holdback);
            self.sink.output(&String::from_utf8_lossy(&tail));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn header() -> CastHeader {
        CastHeader {
            version: CAST_VERSION,
            width: 80,
            height: 24,
            timestamp: 1_700_000_000,
            command: Some("echo hi".into()),
            title: None,
            env: None,
        }
    }

    async fn read_lines(path: &Path) -> Vec<String> {
        tokio::fs::read_to_string(path)
            .await
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn header_then_events_then_exit_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let (sink, task) = open_cast(&path, header(), true).await.unwrap();

        sink.output("hi\r\n");
        sink.input("q");
        sink.resize(120, 40);
        sink.marker("checkpoint");
        sink.exit_marker(0, "abc123");
        sink.shutdown();
        task.await.unwrap();

        let lines = read_lines(&path).await;
        assert_eq!(lines.len(), 6);

        let hdr: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(hdr["version"], 2);
        assert_eq!(hdr["width"], 80);
        assert_eq!(hdr["command"], "echo hi");
        assert!(hdr.get("title").is_none());

        let ev: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(ev[1], "o");
        assert_eq!(ev[2], "hi\r\n");
        let ev: serde_json::Value = serde_json::from_str(&lines[3]).unwrap();
        assert_eq!(ev[1], "r");
        assert_eq!(ev[2], "120x40");

        let last: serde_json::Value = serde_json::from_str(&lines[5]).unwrap();
        assert_eq!(last[0], "exit");
        assert_eq!(last[1], 0);
        assert_eq!(last[2], "abc123");
    }

    #[tokio::test]
    async fn events_serialize_in_call_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let (sink, task) = open_cast(&path, header(), false).await.unwrap();

        for i in 0..100 {
            sink.output(&format!("chunk-{i}"));
        }
        sink.shutdown();
        task.await.unwrap();

        let lines = read_lines(&path).await;
        assert_eq!(lines.len(), 101);
        for (i, line) in lines[1..].iter().enumerate() {
            let ev: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(ev[2], format!("chunk-{i}"));
        }
    }

    #[tokio::test]
    async fn utf8_never_truncated_for_any_split() {
        let stream = "ascii héllo — 🦀 終わり".as_bytes();
        for split in 1..stream.len() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("stdout");
            let (sink, task) = open_cast(&path, header(), false).await.unwrap();
            let mut recorder = OutputRecorder::new(sink.clone());

            recorder.output(&stream[..split]);
            recorder.output(&stream[split..]);
            recorder.finish();
            sink.shutdown();
            task.await.unwrap();

            let lines = read_lines(&path).await;
            let mut decoded = String::new();
            for line in &lines[1..] {
                let ev: serde_json::Value = serde_json::from_str(line).unwrap();
                decoded.push_str(ev[2].as_str().unwrap());
            }
            assert_eq!(decoded.as_bytes(), stream, "split at {split}");
        }
    }

    #[tokio::test]
    async fn escape_sequences_never_split_across_events() {
        let stream = b"a\x1b[31mred\x1b[0m b \x1b]0;title\x07 c".to_vec();
        for split in 1..stream.len() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("stdout");
            let (sink, task) = open_cast(&path, header(), false).await.unwrap();
            let mut recorder = OutputRecorder::new(sink.clone());

            recorder.output(&stream[..split]);
            recorder.output(&stream[split..]);
            recorder.finish();
            sink.shutdown();
            task.await.unwrap();

            let lines = read_lines(&path).await;
            let mut reassembled = String::new();
            for line in &lines[1..] {
                let ev: serde_json::Value = serde_json::from_str(line).unwrap();
                let data = ev[2].as_str().unwrap();
                // No event line may contain a sequence start without its end.
                let starts = data.matches('\x1b').count();
                let ends = data.matches('m').count()
                    + data.matches('\x07').count();
                assert!(
                    starts <= ends,
                    "split at {split}: partial sequence in {data:?}"
                );
                reassembled.push_str(data);
            }
            assert_eq!(reassembled.as_bytes(), stream.as_slice(), "split at {split}");
        }
    }

    #[tokio::test]
    async fn csi_split_across_three_chunks_stays_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let (sink, task) = open_cast(&path, header(), false).await.unwrap();
        let mut recorder = OutputRecorder::new(sink.clone());

        // The middle chunk sits entirely inside the sequence.
        recorder.output(b"a\x1b[3");
        recorder.output(b"1");
        recorder.output(b"mred");
        recorder.finish();
        sink.shutdown();
        task.await.unwrap();

        let lines = read_lines(&path).await;
        let mut reassembled = String::new();
        for line in &lines[1..] {
            let ev: serde_json::Value = serde_json::from_str(line).unwrap();
            let data = ev[2].as_str().unwrap();
            assert!(
                data.matches('\x1b').count() <= data.matches('m').count(),
                "partial sequence in {data:?}"
            );
            reassembled.push_str(data);
        }
        assert_eq!(reassembled, "a\u{1b}[31mred");
    }

    #[tokio::test]
    async fn byte_at_a_time_feed_preserves_multibyte_text() {
        let stream = "x🦀y".as_bytes();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let (sink, task) = open_cast(&path, header(), false).await.unwrap();
        let mut recorder = OutputRecorder::new(sink.clone());

        for &b in stream {
            recorder.output(&[b]);
        }
        recorder.finish();
        sink.shutdown();
        task.await.unwrap();

        let lines = read_lines(&path).await;
        let mut decoded = String::new();
        for line in &lines[1..] {
            let ev: serde_json::Value = serde_json::from_str(line).unwrap();
            decoded.push_str(ev[2].as_str().unwrap());
        }
        assert_eq!(decoded, "x🦀y");
    }

    #[tokio::test]
    async fn lossy_tail_flushed_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let (sink, task) = open_cast(&path, header(), false).await.unwrap();
        let mut recorder = OutputRecorder::new(sink.clone());

        // A dangling escape introducer and half a multi-byte character.
        recorder.output(b"done\x1b[3");
        recorder.finish();
        sink.shutdown();
        task.await.unwrap();

        let lines = read_lines(&path).await;
        assert_eq!(lines.len(), 3);
        let first: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(first[2], "done");
        let second: serde_json::Value = serde_json::from_str(&lines[2]).unwrap();
        assert_eq!(second[2], "\u{1b}[3");
    }

    #[tokio::test]
    async fn elapsed_timestamps_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let (sink, task) = open_cast(&path, header(), false).await.unwrap();

        sink.output("a");
        tokio::time::sleep(Duration::from_millis(5)).await;
        sink.output("b");
        sink.shutdown();
        task.await.unwrap();

        let lines = read_lines(&path).await;
        let t0: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
        let t1: serde_json::Value = serde_json::from_str(&lines[2]).unwrap();
        assert!(t1[0].as_f64().unwrap() >= t0[0].as_f64().unwrap());
    }
}
