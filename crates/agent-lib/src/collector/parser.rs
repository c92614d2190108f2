//! Incremental record extraction from the stats stream
//!
//! The external stats process writes JSON objects to stdout with no framing
//! guarantee: a read may end in the middle of an object or carry several
//! objects at once. The parser scans for balanced `{`/`}` spans and hands
//! back every complete object together with the unconsumed tail, which the
//! caller prepends to the next read.
//!
//! Braces are counted without regard to string literals. The stats format
//! never puts braces inside values, and a span that fails to parse is simply
//! dropped as noise.

use serde_json::Value;

/// Maximum candidate spans examined per `feed` call
pub const DEFAULT_MAX_EXTRACTIONS: usize = 100;

/// Outcome of one `feed` call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedResult {
    /// Complete records in stream order
    pub records: Vec<Value>,
    /// Unconsumed bytes to prepend to the next buffer
    pub remainder: Vec<u8>,
    /// Balanced spans that were not valid JSON
    pub discarded: usize,
}

/// Restartable extractor of JSON objects from a byte stream
#[derive(Debug, Clone)]
pub struct StreamingRecordParser {
    max_extractions: usize,
    pending: Vec<u8>,
}

impl Default for StreamingRecordParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingRecordParser {
    pub fn new() -> Self {
        Self::with_max_extractions(DEFAULT_MAX_EXTRACTIONS)
    }

    pub fn with_max_extractions(max_extractions: usize) -> Self {
        Self {
            max_extractions: max_extractions.max(1),
            pending: Vec::new(),
        }
    }

    /// Extract every complete record from `buffer`.
    ///
    /// Pure function of its input: the caller owns the remainder.
    pub fn feed(&self, buffer: &[u8]) -> FeedResult {
        let mut result = FeedResult::default();
        let mut cursor = 0;
        let mut extractions = 0;

        while extractions < self.max_extractions {
            let start = match buffer[cursor..].iter().position(|&b| b == b'{') {
                Some(offset) => cursor + offset,
                None => break,
            };

            let end = match balanced_end(&buffer[start..]) {
                Some(len) => start + len,
                // Incomplete object, wait for more input
                None => break,
            };

            extractions += 1;
            match serde_json::from_slice::<Value>(&buffer[start..end]) {
                Ok(record) => result.records.push(record),
                Err(_) => result.discarded += 1,
            }
            cursor = end;
        }

        result.remainder = buffer[cursor..].to_vec();
        result
    }

    /// Append a chunk to the internal pending buffer and extract from it.
    pub fn push(&mut self, chunk: &[u8]) -> FeedResult {
        self.pending.extend_from_slice(chunk);
        let result = self.feed(&self.pending);
        self.pending.clear();
        self.pending.extend_from_slice(&result.remainder);
        result
    }

    /// Bytes carried over to the next `push`
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Length of the span starting at `bytes[0] == b'{'` whose braces balance.
fn balanced_end(bytes: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
