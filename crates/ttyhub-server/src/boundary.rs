//! Boundary classifier for raw terminal output.
//!
//! Finds positions in an output stream where foreign bytes may be inserted
//! or where the stream may be cut into records: never inside an escape
//! sequence, never inside a multi-byte UTF-8 character. State persists
//! across chunks because a single sequence can span many reads.
//!
//! Shared by the recording writer (record boundaries) and the title
//! injector (insertion safety).

/// What kind of boundary ends at a given offset, ordered least to most
/// specific so `Ord` picks the best candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BoundaryKind {
    /// End of a recognized shell-prompt pattern (`"$ "`, `"# "`, …).
    PromptHint,
    /// A carriage return in ground state.
    CarriageReturn,
    /// A line feed in ground state.
    LineFeed,
    /// A complete escape/control sequence just terminated.
    SequenceEnd,
}

/// A safe insertion point within the most recent chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertionPoint {
    /// Byte offset into the chunk; insertion goes before this offset's suffix.
    pub offset: usize,
    pub kind: BoundaryKind,
}

/// Result of scanning one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Length of the longest chunk prefix that ends outside any escape
    /// sequence and on a UTF-8 character boundary. Bytes past this offset
    /// must be held back until a later chunk completes them.
    pub safe_len: usize,
    /// The most specific insertion point seen in this chunk, if any.
    pub insertion: Option<InsertionPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeqState {
    Ground,
    Escape,
    EscapeIntermediate,
    Csi,
    /// OSC / DCS / SOS / PM / APC string, terminated by BEL or ST.
    StringSeq,
    /// Saw ESC inside a string sequence; `\` completes ST.
    StringSeqEscape,
}

/// Stateful scanner over a raw output stream.
#[derive(Debug)]
pub struct BoundaryScanner {
    seq: SeqState,
    /// Continuation bytes still expected for the current UTF-8 character.
    utf8_remaining: u8,
    /// Last few ground-state bytes, for prompt-pattern detection.
    tail: [u8; 2],
}

impl Default for BoundaryScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl BoundaryScanner {
    pub fn new() -> Self {
        Self {
            seq: SeqState::Ground,
            utf8_remaining: 0,
            tail: [0; 2],
        }
    }

    /// True when the stream is currently outside any escape sequence and
    /// not mid-character, i.e. foreign bytes may be appended right now.
    pub fn is_quiescent(&self) -> bool {
        self.seq == SeqState::Ground && self.utf8_remaining == 0
    }

    /// Consume a chunk, advancing state, and report boundaries.
    pub fn scan(&mut self, chunk: &[u8]) -> ScanReport {
        let mut safe_len = 0;
        let mut insertion: Option<InsertionPoint> = None;

        for (i, &byte) in chunk.iter().enumerate() {
            let kind = self.step(byte);
            if self.is_quiescent() {
                safe_len = i + 1;
                let kind = kind.or_else(|| {
                    if self.tail_is_prompt() {
                        Some(BoundaryKind::PromptHint)
                    } else {
                        None
                    }
                });
                if let Some(kind) = kind {
                    // Prefer the more specific kind; on a tie, the later offset.
                    let better = match insertion {
                        Some(prev) => kind >= prev.kind,
                        None => true,
                    };
                    if better {
                        insertion = Some(InsertionPoint {
                            offset: i + 1,
                            kind,
                        });
                    }
                }
            }
        }

        ScanReport {
            safe_len,
            insertion,
        }
    }

    /// Advance the state machine by one byte. Returns the boundary kind if
    /// this byte terminates something notable.
    fn step(&mut self, byte: u8) -> Option<BoundaryKind> {
        // Mid-character: consume continuation bytes; anything else is
        // malformed and falls through to normal handling.
        if self.utf8_remaining > 0 {
            if (0x80..=0xbf).contains(&byte) {
                self.utf8_remaining -= 1;
                return None;
            }
            self.utf8_remaining = 0;
        }

        match self.seq {
            SeqState::Ground => match byte {
                0x1b => {
                    self.seq = SeqState::Escape;
                    None
                }
                b'\n' => {
                    self.push_tail(byte);
                    Some(BoundaryKind::LineFeed)
                }
                b'\r' => {
                    self.push_tail(byte);
                    Some(BoundaryKind::CarriageReturn)
                }
                0xc2..=0xdf => {
                    self.utf8_remaining = 1;
                    None
                }
                0xe0..=0xef => {
                    self.utf8_remaining = 2;
                    None
                }
                0xf0..=0xf4 => {
                    self.utf8_remaining = 3;
                    None
                }
                _ => {
                    self.push_tail(byte);
                    None
                }
            },
            SeqState::Escape => match byte {
                b'[' => {
                    self.seq = SeqState::Csi;
                    None
                }
                b']' | b'P' | b'X' | b'^' | b'_' => {
                    self.seq = SeqState::StringSeq;
                    None
                }
                0x1b => None,
                0x20..=0x2f => {
                    self.seq = SeqState::EscapeIntermediate;
                    None
                }
                _ => {
                    // Two-character sequence (ESC 7, ESC =, …) complete.
                    self.seq = SeqState::Ground;
                    Some(BoundaryKind::SequenceEnd)
                }
            },
            SeqState::EscapeIntermediate => match byte {
                0x20..=0x2f => None,
                _ => {
                    self.seq = SeqState::Ground;
                    Some(BoundaryKind::SequenceEnd)
                }
            },
            SeqState::Csi => match byte {
                0x40..=0x7e => {
                    self.seq = SeqState::Ground;
                    Some(BoundaryKind::SequenceEnd)
                }
                _ => None,
            },
            SeqState::StringSeq => match byte {
                0x07 => {
                    self.seq = SeqState::Ground;
                    Some(BoundaryKind::SequenceEnd)
                }
                0x1b => {
                    self.seq = SeqState::StringSeqEscape;
                    None
                }
                _ => None,
            },
            SeqState::StringSeqEscape => match byte {
                b'\\' => {
                    self.seq = SeqState::Ground;
                    Some(BoundaryKind::SequenceEnd)
                }
                _ => {
                    self.seq = SeqState::StringSeq;
                    None
                }
            },
        }
    }

    fn push_tail(&mut self, byte: u8) {
        self.tail[0] = self.tail[1];
        self.tail[1] = byte;
    }

    fn tail_is_prompt(&self) -> bool {
        matches!(self.tail, [b'$' | b'#' | b'>' | b'%', b' '])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_entirely_safe() {
        let mut scanner = BoundaryScanner::new();
        let report = scanner.scan(b"hello world");
        assert_eq!(report.safe_len, 11);
        assert!(scanner.is_quiescent());
    }

    #[test]
    fn partial_utf8_is_held() {
        let mut scanner = BoundaryScanner::new();
        let bytes = "héllo".as_bytes(); // é = 0xc3 0xa9
        let report = scanner.scan(&bytes[..2]); // "h" + first byte of é
        assert_eq!(report.safe_len, 1);
        assert!(!scanner.is_quiescent());

        let report = scanner.scan(&bytes[2..]);
        assert_eq!(report.safe_len, bytes.len() - 2);
        assert!(scanner.is_quiescent());
    }

    #[test]
    fn four_byte_utf8_across_chunks() {
        let mut scanner = BoundaryScanner::new();
        let bytes = "🦀".as_bytes();
        assert_eq!(bytes.len(), 4);
        for &b in &bytes[..3] {
            let report = scanner.scan(&[b]);
            assert_eq!(report.safe_len, 0);
        }
        let report = scanner.scan(&bytes[3..]);
        assert_eq!(report.safe_len, 1);
    }

    #[test]
    fn csi_sequence_spanning_chunks() {
        let mut scanner = BoundaryScanner::new();
        // Split "\x1b[31m" after the parameter byte.
        let report = scanner.scan(b"ab\x1b[3");
        assert_eq!(report.safe_len, 2);
        assert!(!scanner.is_quiescent());

        let report = scanner.scan(b"1mcd");
        assert_eq!(report.safe_len, 4);
        assert_eq!(
            report.insertion.map(|p| p.kind),
            Some(BoundaryKind::SequenceEnd)
        );
    }

    #[test]
    fn osc_terminated_by_bel() {
        let mut scanner = BoundaryScanner::new();
        let report = scanner.scan(b"\x1b]0;some title");
        assert_eq!(report.safe_len, 0);
        let report = scanner.scan(b"\x07after");
        assert_eq!(report.safe_len, 6);
    }

    #[test]
    fn osc_terminated_by_st() {
        let mut scanner = BoundaryScanner::new();
        let report = scanner.scan(b"\x1b]2;title\x1b\\ok");
        assert_eq!(report.safe_len, 13);
        assert!(scanner.is_quiescent());
    }

    #[test]
    fn two_char_escape_completes() {
        let mut scanner = BoundaryScanner::new();
        let report = scanner.scan(b"\x1b7rest");
        assert_eq!(report.safe_len, 6);
    }

    #[test]
    fn charset_designation_with_intermediate() {
        let mut scanner = BoundaryScanner::new();
        // ESC ( B, intermediate then final.
        let report = scanner.scan(b"\x1b(");
        assert_eq!(report.safe_len, 0);
        let report = scanner.scan(b"Bx");
        assert_eq!(report.safe_len, 2);
    }

    #[test]
    fn newline_outranks_prompt_and_cr() {
        let mut scanner = BoundaryScanner::new();
        let report = scanner.scan(b"$ \r\nmore");
        let point = report.insertion.unwrap();
        assert_eq!(point.kind, BoundaryKind::LineFeed);
        assert_eq!(point.offset, 4);
    }

    #[test]
    fn prompt_hint_detected() {
        let mut scanner = BoundaryScanner::new();
        let report = scanner.scan(b"user@host:~$ ");
        assert_eq!(
            report.insertion.map(|p| p.kind),
            Some(BoundaryKind::PromptHint)
        );
    }

    #[test]
    fn any_split_of_escaped_stream_never_exposes_partial_sequence() {
        let stream = b"one\x1b[1;32mgreen\x1b[0m two\x1b]0;t\x07 three".to_vec();
        for split in 1..stream.len() {
            let mut scanner = BoundaryScanner::new();
            let a = scanner.scan(&stream[..split]);
            // The safe prefix never ends inside an escape sequence: rescanning
            // it standalone must end quiescent.
            let mut check = BoundaryScanner::new();
            check.scan(&stream[..a.safe_len]);
            assert!(check.is_quiescent(), "split at {split}");
            scanner.scan(&stream[split..]);
            assert!(scanner.is_quiescent(), "split at {split}");
        }
    }
}
