//! Terminal output filtering.
//!
//! Viewers render shell output as plain text, so escape sequences and stray
//! control characters are removed before output is broadcast. Line feeds,
//! carriage returns and tabs survive because viewers use them to redraw lines.

use std::sync::LazyLock;

use regex::Regex;

/// Matches one complete escape sequence: CSI, OSC (BEL or ST terminated),
/// DCS/SOS/PM/APC strings, and the short escapes. Short escapes take no space
/// intermediate so that a stray ESC before a prompt cannot swallow it.
static ESCAPE_SEQUENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[PX^_][^\x1b]*\x1b\\|[!-/]*[0-OQ-WYZ\\`-~])",
    )
    .expect("escape sequence pattern is valid")
});

/// Matches text that is an escape sequence still waiting for its final byte.
static ESCAPE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\x1b(?:\[[0-?]*[ -/]*|\][^\x07\x1b]*\x1b?|[PX^_][^\x1b]*\x1b?|[!-/]*)$")
        .expect("escape prefix pattern is valid")
});

/// Longest unterminated escape sequence held back between chunks.
const MAX_PENDING_ESCAPE: usize = 256;

/// Strips escape sequences and control characters from `text`.
///
/// Keeps printable characters, `\n`, `\r` and `\t`, in order.
pub fn strip_control(text: &str) -> String {
    ESCAPE_SEQUENCE
        .replace_all(text, "")
        .chars()
        .filter(|&c| is_kept(c))
        .collect()
}

fn is_kept(c: char) -> bool {
    matches!(c, '\n' | '\r' | '\t') || !c.is_control()
}

/// Stateful wrapper around [`strip_control`] for a chunked byte stream.
///
/// A PTY read can end in the middle of a UTF-8 character or an escape
/// sequence. Both are carried over to the next chunk instead of being
/// mangled.
#[derive(Debug, Default)]
pub struct OutputFilter {
    partial_utf8: Vec<u8>,
    partial_escape: String,
}

impl OutputFilter {
    /// Creates an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters the next chunk of raw output.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        let mut text = std::mem::take(&mut self.partial_escape);
        text.push_str(&self.decode(chunk));

        if let Some(start) = incomplete_escape_start(&text) {
            self.partial_escape = text.split_off(start);
        }

        strip_control(&text)
    }

    /// Releases whatever is still held back, for use at end of stream.
    pub fn flush(&mut self) -> String {
        let mut text = std::mem::take(&mut self.partial_escape);
        if !self.partial_utf8.is_empty() {
            text.push(char::REPLACEMENT_CHARACTER);
            self.partial_utf8.clear();
        }
        strip_control(&text)
    }

    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.partial_utf8);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.partial_utf8 = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

/// Returns the byte offset of a trailing escape sequence that has not been
/// terminated yet but still can be.
///
/// An ESC that can no longer start a valid sequence is not held; it is
/// dropped with the other control characters.
fn incomplete_escape_start(text: &str) -> Option<usize> {
    let window = text.len().saturating_sub(MAX_PENDING_ESCAPE);
    text.match_indices('\x1b')
        .map(|(start, _)| start)
        .filter(|&start| start >= window)
        .find(|&start| ESCAPE_PREFIX.is_match(&text[start..]))
}
