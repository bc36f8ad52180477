//! Byte/text helpers shared by the parser and the send queue.

use std::fmt::Write as _;

/// UTF-8 decoding of a raw buffer that keeps enough bookkeeping to map text
/// offsets back to raw byte offsets.
///
/// An incomplete sequence at the very end is held back (not decoded) so a
/// later chunk can complete it. Invalid sequences elsewhere decode to U+FFFD,
/// which changes the byte length; each replacement records a shift point.
#[derive(Debug)]
pub(crate) struct DecodedText {
    pub text: String,
    /// `(text_end, raw_end)` pairs recorded after every replacement character.
    shifts: Vec<(usize, usize)>,
}

impl DecodedText {
    pub fn decode(raw: &[u8]) -> Self {
        let mut text = String::with_capacity(raw.len());
        let mut shifts = Vec::new();
        let mut rest = raw;
        let mut consumed = 0;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let good = e.valid_up_to();
                    // valid_up_to guarantees this prefix is valid UTF-8
                    text.push_str(std::str::from_utf8(&rest[..good]).unwrap_or_default());
                    match e.error_len() {
                        // truncated sequence at the end: wait for more bytes
                        None => break,
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            consumed += good + bad;
                            shifts.push((text.len(), consumed));
                            rest = &rest[good + bad..];
                        }
                    }
                }
            }
        }

        Self { text, shifts }
    }

    /// Raw byte offset corresponding to a text offset.
    pub fn raw_offset(&self, text_offset: usize) -> usize {
        let (text_base, raw_base) = self
            .shifts
            .iter()
            .take_while(|(text_end, _)| *text_end <= text_offset)
            .last()
            .copied()
            .unwrap_or((0, 0));
        raw_base + (text_offset - text_base)
    }
}

/// Remove line breaks from a message-class chunk: CRLF, LF, and a trailing CR
/// (the first half of a CRLF split across reads).
pub(crate) fn strip_line_breaks(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'\n' => {}
            b'\r' if matches!(bytes.get(i + 1), Some(b'\n') | None) => {}
            _ => out.push(b),
        }
    }
    out
}

/// Text with every whitespace character removed, used to compare an echo with
/// what was sent.
pub(crate) fn squash_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Lowercase hex rendering.
pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Find the first occurrence of `needle` in `haystack`.
pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
