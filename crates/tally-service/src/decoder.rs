// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Event-stream frame decoder.
//!
//! The `/query/stream` body is a sequence of frames separated by a blank line:
//!
//! ```text
//! data: {"type":"token","data":"Rev"}\n\n
//! data: {"type":"done","data":{"answer":"Revenue was 4.2M"}}\n\n
//! ```
//!
//! Transport chunks carry no framing: a chunk may end in the middle of a
//! frame, in the middle of the delimiter, or in the middle of a multi-byte
//! UTF-8 sequence.  [`FrameDecoder`] therefore buffers raw bytes and only
//! decodes a frame once its closing delimiter has arrived.  Whatever follows
//! the last delimiter is carried over and prefixed to the next chunk.
//!
//! Decoding is permissive: frames without the `data:` tag and frames whose
//! payload is not a valid event are skipped individually; neither aborts
//! the stream.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{ServiceError, StreamEvent};

/// Tag every frame must begin with.
pub const EVENT_PREFIX: &str = "data:";

const LF_DELIMITER: &[u8] = b"\n\n";
const CRLF_DELIMITER: &[u8] = b"\r\n\r\n";

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ServiceError>> + Send>>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    /// Blank frame (consecutive delimiters); ignored without a warning.
    #[error("empty frame")]
    Empty,

    #[error("frame does not start with `{EVENT_PREFIX}`")]
    MissingPrefix,

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Incremental frame decoder with a carry-over buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    carry: Vec<u8>,
    emitted: usize,
    skipped: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every event completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        // The carry-over holds no complete delimiter, so a new one can start
        // at most `CRLF_DELIMITER.len() - 1` bytes before its end.
        let mut search_from = self.carry.len().saturating_sub(CRLF_DELIMITER.len() - 1);
        self.carry.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some((pos, len)) = find_delimiter(&self.carry, search_from) {
            match decode_frame(&self.carry[consumed..pos]) {
                Ok(ev) => {
                    self.emitted += 1;
                    events.push(ev);
                }
                Err(FrameError::Empty) => {}
                Err(FrameError::MissingPrefix) => {
                    self.skipped += 1;
                    debug!("skipping untagged frame");
                }
                Err(e) => {
                    self.skipped += 1;
                    warn!(error = %e, "skipping malformed stream frame");
                }
            }
            consumed = pos + len;
            search_from = consumed;
        }
        self.carry.drain(..consumed);
        events
    }

    /// Signal end of input.  An incomplete trailing frame is discarded;
    /// returns the number of bytes dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.carry.len();
        if dropped > 0 {
            debug!(bytes = dropped, "discarding incomplete trailing frame");
        }
        self.carry.clear();
        dropped
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Frames dropped because they were untagged or malformed.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Earliest frame delimiter at or after `from`: `(position, length)`.
fn find_delimiter(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    (from..buf.len()).find_map(|i| {
        let rest = &buf[i..];
        if rest.starts_with(CRLF_DELIMITER) {
            Some((i, CRLF_DELIMITER.len()))
        } else if rest.starts_with(LF_DELIMITER) {
            Some((i, LF_DELIMITER.len()))
        } else {
            None
        }
    })
}

/// Decode one complete frame (delimiter already removed).
pub fn decode_frame(frame: &[u8]) -> Result<StreamEvent, FrameError> {
    let text = std::str::from_utf8(frame)
        .map_err(|e| FrameError::Malformed(format!("invalid UTF-8: {e}")))?;
    let text = text.trim_start_matches(['\r', '\n']);
    if text.trim().is_empty() {
        return Err(FrameError::Empty);
    }
    let payload = text.strip_prefix(EVENT_PREFIX).ok_or(FrameError::MissingPrefix)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload).trim_end();
    serde_json::from_str(payload).map_err(|e| FrameError::Malformed(e.to_string()))
}

/// Encode an event as one wire frame, delimiter included.
pub fn encode_frame(event: &StreamEvent) -> String {
    let payload = serde_json::to_string(event).unwrap_or_else(|_| "{}".into());
    format!("{EVENT_PREFIX} {payload}\n\n")
}

struct DecodeState {
    bytes: Pin<Box<dyn Stream<Item = Result<Vec<u8>, ServiceError>> + Send>>,
    decoder: FrameDecoder,
    ready: VecDeque<StreamEvent>,
    finished: bool,
}

/// Turn a raw byte stream into an ordered stream of events.
///
/// The event stream ends when the byte stream ends.  A transport error is
/// yielded once, after every event completed before it, and ends the stream.
pub fn decode_stream<S>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<Vec<u8>, ServiceError>> + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: FrameDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };
    let events = futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(ev) = st.ready.pop_front() {
                return Some((Ok(ev), st));
            }
            if st.finished {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let decoded = st.decoder.push(&chunk);
                    st.ready.extend(decoded);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    st.decoder.finish();
                    return Some((Err(e), st));
                }
                None => {
                    st.finished = true;
                    st.decoder.finish();
                    debug!(
                        emitted = st.decoder.emitted(),
                        skipped = st.decoder.skipped(),
                        "event stream closed"
                    );
                }
            }
        }
    });
    Box::pin(events)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
