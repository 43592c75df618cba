//! Server-sent-event decoding for upstream completion streams.
//!
//! Bytes are buffered as bytes and only decoded to UTF-8 per complete line, so
//! a multi-byte character split across two reads is reassembled before it is
//! looked at. Scanning for `\n` resumes where the previous scan stopped and
//! consumed bytes are compacted away once per appended chunk, which keeps the
//! whole decode linear in the number of bytes received.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::Stream;
use tokio::time::{Instant, Sleep};
use tracing::debug;

use crate::error::{BridgeError, CoreResult};
use crate::model::CompletionChunk;
use crate::stream::{ByteSource, UpstreamEvent};

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// Growable byte buffer that hands out complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Start of the first unconsumed byte.
    start: usize,
    /// Everything in `start..scanned` is known to contain no `\n`.
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.scanned -= self.start;
            self.start = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line without its terminator (`\n` or `\r\n`).
    pub fn next_line(&mut self) -> Option<String> {
        let rel = self.buf[self.scanned..].iter().position(|b| *b == b'\n');
        match rel {
            Some(rel) => {
                let end = self.scanned + rel;
                let mut line = &self.buf[self.start..end];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                let out = String::from_utf8_lossy(line).into_owned();
                self.start = end + 1;
                self.scanned = self.start;
                Some(out)
            }
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }

    /// Whatever is left once the source has ended.
    pub fn take_tail(&mut self) -> Option<String> {
        let tail = &self.buf[self.start..];
        let tail = tail.strip_suffix(b"\r").unwrap_or(tail);
        let out = (!tail.is_empty()).then(|| String::from_utf8_lossy(tail).into_owned());
        self.buf.clear();
        self.start = 0;
        self.scanned = 0;
        out
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len() - self.start
    }
}

/// Result of looking at one line.
#[derive(Debug, PartialEq)]
pub enum Frame {
    Event(UpstreamEvent),
    /// Not a data frame (blank, comment, `event:`, `id:` ...).
    Ignored,
    /// A data frame whose payload is not valid JSON.
    Malformed(String),
}

pub fn parse_line(line: &str) -> Frame {
    let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
        return Frame::Ignored;
    };
    let payload = rest.strip_prefix(' ').unwrap_or(rest).trim_end();
    if payload.is_empty() {
        return Frame::Ignored;
    }
    if payload == DONE_SENTINEL {
        return Frame::Event(UpstreamEvent::Done);
    }
    match serde_json::from_str::<CompletionChunk>(payload) {
        Ok(chunk) => Frame::Event(UpstreamEvent::Chunk(chunk)),
        Err(e) => Frame::Malformed(e.to_string()),
    }
}

/// Push-style decoder: feed bytes, pull events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: LineBuffer,
    skipped: usize,
    last_skip: Option<BridgeError>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.lines.push(chunk);
    }

    /// Next event from complete lines; malformed frames are skipped.
    pub fn next_event(&mut self) -> Option<UpstreamEvent> {
        while let Some(line) = self.lines.next_line() {
            if let Some(ev) = self.accept(&line) {
                return Some(ev);
            }
        }
        None
    }

    /// Decode the unterminated last line once the source has ended.
    pub fn finish(&mut self) -> Option<UpstreamEvent> {
        let tail = self.lines.take_tail()?;
        self.accept(&tail)
    }

    /// Number of malformed frames dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Why the most recent malformed frame was dropped.
    pub fn last_skip(&self) -> Option<&BridgeError> {
        self.last_skip.as_ref()
    }

    fn accept(&mut self, line: &str) -> Option<UpstreamEvent> {
        match parse_line(line) {
            Frame::Event(ev) => Some(ev),
            Frame::Ignored => None,
            Frame::Malformed(reason) => {
                self.skipped += 1;
                let err = BridgeError::Decode(reason);
                debug!(skipped = self.skipped, kind = err.code(), error = %err, "dropping malformed sse frame");
                self.last_skip = Some(err);
                None
            }
        }
    }
}

/// Decoded event stream over a `ByteSource`, bounded by the source deadline.
pub struct SseEventStream {
    source: ByteSource,
    decoder: SseDecoder,
    deadline: Pin<Box<Sleep>>,
    started: Instant,
    finished: bool,
    source_done: bool,
}

impl SseEventStream {
    pub fn new(source: ByteSource) -> Self {
        let deadline = Box::pin(tokio::time::sleep_until(source.deadline));
        Self {
            source,
            decoder: SseDecoder::new(),
            deadline,
            started: Instant::now(),
            finished: false,
            source_done: false,
        }
    }
}

impl Stream for SseEventStream {
    type Item = CoreResult<UpstreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.finished {
                return Poll::Ready(None);
            }

            if let Some(ev) = self.decoder.next_event() {
                return Poll::Ready(Some(Ok(ev)));
            }

            if self.source_done {
                self.finished = true;
                return Poll::Ready(self.decoder.finish().map(Ok));
            }

            if self.deadline.as_mut().poll(cx).is_ready() {
                self.finished = true;
                let elapsed_ms = self.started.elapsed().as_millis() as u64;
                debug!(elapsed_ms, "upstream stream deadline elapsed");
                return Poll::Ready(Some(Err(BridgeError::Timeout { elapsed_ms })));
            }

            match Pin::new(&mut self.source).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.decoder.push(&chunk);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    let err = match e {
                        BridgeError::Stream(_) | BridgeError::Timeout { .. } => e,
                        other => BridgeError::Stream(other.to_string()),
                    };
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    self.source_done = true;
                    continue;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
