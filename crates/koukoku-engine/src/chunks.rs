use std::collections::VecDeque;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::text::find_bytes;

/// Inbound bytes from one transport read, stamped with their arrival time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawChunk {
    bytes: Bytes,
    received_at: DateTime<Utc>,
}

impl RawChunk {
    pub fn new(bytes: impl Into<Bytes>, received_at: DateTime<Utc>) -> Self {
        Self {
            bytes: bytes.into(),
            received_at,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Same arrival time, bytes from `offset` onward.
    fn tail(&self, offset: usize) -> Self {
        Self {
            bytes: self.bytes.slice(offset..),
            received_at: self.received_at,
        }
    }
}

/// Ordered accumulator of chunks with a byte cap. Offsets passed in and out are
/// positions in the concatenation of the buffered chunks.
#[derive(Debug)]
pub(crate) struct ChunkBuffer {
    chunks: VecDeque<RawChunk>,
    len: usize,
    cap: usize,
}

impl ChunkBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            cap,
        }
    }

    /// Append a chunk, evicting the oldest chunks while over the cap. The newest
    /// chunk is always kept. Returns the number of evicted bytes.
    pub fn push(&mut self, chunk: RawChunk) -> usize {
        self.len += chunk.len();
        self.chunks.push_back(chunk);

        let mut evicted = 0;
        while self.len > self.cap && self.chunks.len() > 1 {
            if let Some(old) = self.chunks.pop_front() {
                self.len -= old.len();
                evicted += old.len();
            }
        }
        evicted
    }

    pub fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.bytes());
        }
        out
    }

    /// Arrival time of the chunk holding the byte at `offset`.
    pub fn received_at(&self, offset: usize) -> Option<DateTime<Utc>> {
        let mut start = 0;
        for chunk in &self.chunks {
            let end = start + chunk.len();
            if offset < end {
                return Some(chunk.received_at());
            }
            start = end;
        }
        None
    }

    /// Drop everything before `end`. Chunks that end at or before `end` are
    /// removed; a chunk straddling `end` is cut there, or further along at the
    /// first occurrence of `resync` if one is given and found.
    pub fn consume(&mut self, end: usize, resync: Option<&[u8]>) {
        let mut start = 0;
        while let Some(front) = self.chunks.front_mut() {
            let chunk_end = start + front.len();
            if end < chunk_end {
                let pos = end - start;
                let cut = resync
                    .and_then(|delim| find_bytes(&front.bytes()[pos..], delim))
                    .map_or(pos, |idx| pos + idx);
                *front = front.tail(cut);
                self.len -= cut;
                return;
            }
            self.len -= front.len();
            self.chunks.pop_front();
            start = chunk_end;
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}
