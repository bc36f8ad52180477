//! Incremental parser for the remote service's inbound byte stream.
//!
//! The stream carries two record shapes with no framing. Reads of at least
//! [`MESSAGE_CLASS_THRESHOLD`] bytes are chat records and are parsed as soon as
//! they arrive. Shorter reads belong to broadcast blocks, which trickle in line
//! by line and are only parsed once the stream has been quiet for a while.
//!
//! The parser owns no timers. It reports the quiet deadline and the caller
//! invokes [`StreamParser::flush_speech`] once that deadline passes.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use koukoku_core::items::{Item, SpeechItem};
use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::chunks::{ChunkBuffer, RawChunk};
use crate::text::{hex, strip_line_breaks, DecodedText};

/// Reads at least this long are chat records; shorter ones are broadcast lines.
pub const MESSAGE_CLASS_THRESHOLD: usize = 70;

/// Literal start of a chat record, used to resync after a partial match.
pub const MESSAGE_OPENER: &str = ">> 「 ";

static MESSAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r">>\s「\s(?P<body>[^」]+)\s」",
        r"\(チャット放話\s-\s(?P<date>[0-9]{2}/[0-9]{2})\s\((?P<dow>[日月火水木金土])\)\s(?P<time>[0-9]{2}:[0-9]{2}:[0-9]{2})",
        r"\sby\s(?P<host>\S+)",
        r"(?:\s\((?P<forgery>※\s贋作\sDNS\s逆引の疑い)\))?",
        r"\s君",
        r"(?:\s\(?(?P<self>〈＊あなた様＊〉)\)?)?",
        r"\)\s<<",
    ))
    .unwrap()
});

static SPEECH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        // banner
        r"(?:[★☆◆◇■□●○※＊][\t\p{Zs}]*){3,}臨時ニユース[\t\p{Zs}]+緊急放送[^\r\n]*\r?\n",
        // date header
        r"(?:[\t\p{Zs}]*\r?\n)*",
        r"[\t\p{Zs}]*(?:(?:令和|平成|昭和)[\t\p{Zs}]*)?",
        r"(?P<date>[〇一二三四五六七八九十百元0-9０-９]+[\t\p{Zs}]*年[\t\p{Zs}]*[〇一二三四五六七八九十0-9０-９]+[\t\p{Zs}]*月[\t\p{Zs}]*[〇一二三四五六七八九十0-9０-９]+[\t\p{Zs}]*日)",
        r"[\t\p{Zs}]*(?P<dow>[日月火水木金土])[\t\p{Zs}]*曜日?",
        r"[\t\p{Zs}]*(?P<time>[0-9０-９]{1,2}[:：][0-9０-９]{2})[^\r\n]*\r?\n",
        // attribution
        r"(?:[\t\p{Zs}]*\r?\n)*",
        r"[\t\p{Zs}]*(?P<host>\S+?)[\t\p{Zs}]*君[^\r\n]*\r?\n",
        // opening delimiter
        r"(?:[\t\p{Zs}]*\r?\n)*",
        r"[\t\p{Zs}]*＝{3}[^\r\n]*?＝{3}[\t\p{Zs}]*\r?\n",
        // body, closing delimiter
        r"(?P<body>(?s:.+?))\r?\n",
        r"[\t\p{Zs}]*＝{3}[^\r\n]*?＝{3}",
    ))
    .unwrap()
});

/// Output of a parser call, in stream order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParserEvent {
    Message(Item),
    Speech(SpeechItem),
    /// Body of a record that echoes one of this engine's own posts.
    SelfEcho(String),
}

pub struct StreamParser {
    messages: ChunkBuffer,
    speeches: ChunkBuffer,
    quiet_period: Duration,
    quiet_deadline: Option<Instant>,
    disposed: bool,
}

impl StreamParser {
    pub fn new(quiet_period: Duration, max_buffer_bytes: usize) -> Self {
        Self {
            messages: ChunkBuffer::new(max_buffer_bytes),
            speeches: ChunkBuffer::new(max_buffer_bytes),
            quiet_period,
            quiet_deadline: None,
            disposed: false,
        }
    }

    /// Feed one transport read. Chat records complete in the message buffer are
    /// returned immediately; broadcast lines only move the quiet deadline.
    pub fn write(&mut self, chunk: RawChunk, now: Instant) -> Vec<ParserEvent> {
        if self.disposed || chunk.is_empty() {
            return Vec::new();
        }

        if chunk.len() >= MESSAGE_CLASS_THRESHOLD {
            let stripped = RawChunk::new(strip_line_breaks(chunk.bytes()), chunk.received_at());
            let evicted = self.messages.push(stripped);
            if evicted > 0 {
                warn!(bytes = evicted, "message buffer over cap, dropped oldest chunks");
            }
            self.parse_messages()
        } else {
            let evicted = self.speeches.push(chunk);
            if evicted > 0 {
                warn!(bytes = evicted, "speech buffer over cap, dropped oldest chunks");
            }
            self.quiet_deadline = Some(now + self.quiet_period);
            Vec::new()
        }
    }

    /// When the pending broadcast lines should be parsed, if any are pending.
    pub fn quiet_deadline(&self) -> Option<Instant> {
        self.quiet_deadline
    }

    /// Parse the broadcast buffer. `finished` stamps every block found and
    /// salts its hash.
    pub fn flush_speech(&mut self, finished: DateTime<Utc>) -> Vec<ParserEvent> {
        self.quiet_deadline = None;
        if self.disposed || self.speeches.is_empty() {
            return Vec::new();
        }

        let raw = self.speeches.concat();
        let decoded = DecodedText::decode(&raw);
        let mut events = Vec::new();
        let mut consumed = None;

        for caps in SPEECH_PATTERN.captures_iter(&decoded.text) {
            let Some(whole) = caps.get(0) else { continue };
            let start = decoded.raw_offset(whole.start());
            let end = decoded.raw_offset(whole.end());

            let item = SpeechItem {
                body: capture(&caps, "body").replace("\r\n", "\n"),
                date: capture(&caps, "date"),
                dow: capture(&caps, "dow"),
                time: capture(&caps, "time"),
                host: capture(&caps, "host"),
                hash: speech_hash(&raw[start..end], finished),
                finished,
            };
            debug!(host = %item.host, hash = %item.hash, "parsed speech");
            events.push(ParserEvent::Speech(item));
            consumed = Some(end);
        }

        if let Some(end) = consumed {
            self.speeches.consume(end, None);
        }
        trace!(
            remaining = self.speeches.byte_len(),
            parsed = events.len(),
            "speech flush"
        );
        events
    }

    /// Drop all buffered data and the quiet deadline. Later calls emit nothing.
    pub fn dispose(&mut self) {
        self.disposed = true;
        self.quiet_deadline = None;
        self.messages.clear();
        self.speeches.clear();
    }

    /// Forget everything buffered from a transport that has gone away. Unlike
    /// [`StreamParser::dispose`] the parser stays usable.
    pub fn reset(&mut self) {
        let (messages, speeches) = self.buffered();
        if messages + speeches > 0 {
            debug!(messages, speeches, "discarding buffered bytes from previous connection");
        }
        self.quiet_deadline = None;
        self.messages.clear();
        self.speeches.clear();
    }

    /// Bytes held in the message and speech buffers.
    pub fn buffered(&self) -> (usize, usize) {
        (self.messages.byte_len(), self.speeches.byte_len())
    }

    fn parse_messages(&mut self) -> Vec<ParserEvent> {
        let raw = self.messages.concat();
        let decoded = DecodedText::decode(&raw);
        let mut events = Vec::new();
        let mut consumed = None;

        for caps in MESSAGE_PATTERN.captures_iter(&decoded.text) {
            let caps = reanchor(&decoded.text, caps);
            let Some(whole) = caps.get(0) else { continue };
            let start = decoded.raw_offset(whole.start());
            let Some(timestamp) = self.messages.received_at(start) else {
                continue;
            };

            let item = Item {
                body: capture(&caps, "body"),
                date: capture(&caps, "date"),
                dow: capture(&caps, "dow"),
                time: capture(&caps, "time"),
                host: capture(&caps, "host"),
                forgery: caps.name("forgery").map(|m| m.as_str().to_owned()),
                self_marker: caps.name("self").map(|m| m.as_str().to_owned()),
                timestamp,
            };
            debug!(host = %item.host, own = item.is_self(), "parsed message");

            let echo = item.is_self().then(|| item.body.clone());
            events.push(ParserEvent::Message(item));
            if let Some(body) = echo {
                events.push(ParserEvent::SelfEcho(body));
            }
            consumed = Some(decoded.raw_offset(whole.end()));
        }

        if let Some(end) = consumed {
            self.messages.consume(end, Some(MESSAGE_OPENER.as_bytes()));
        }
        events
    }
}

/// A body can swallow the opener of a later record when an earlier one was cut
/// off. Restart the match at the last opener inside the body.
fn reanchor<'h>(text: &'h str, caps: Captures<'h>) -> Captures<'h> {
    let Some(body) = caps.name("body") else {
        return caps;
    };
    let Some(pos) = body.as_str().rfind(MESSAGE_OPENER) else {
        return caps;
    };
    let start = body.start() + pos;
    match MESSAGE_PATTERN.captures_at(text, start) {
        Some(inner) if inner.get(0).is_some_and(|m| m.start() == start) => {
            trace!(skipped = start - caps.get(0).map_or(start, |m| m.start()), "resynced on opener");
            inner
        }
        _ => caps,
    }
}

fn capture(caps: &Captures<'_>, name: &str) -> String {
    caps.name(name)
        .map(|m| m.as_str().to_owned())
        .unwrap_or_default()
}

/// SHA-256 over the flush time and the raw block, truncated to 16 hex digits.
fn speech_hash(raw: &[u8], finished: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(finished.timestamp_millis().to_be_bytes());
    hasher.update(raw);
    hex(&hasher.finalize()[..8])
}
