//! Stream Decoding
//!
//! Providers frame their streamed responses differently (named SSE events,
//! newline-delimited JSON, ...). A [`StreamDecoder`] turns one provider's raw
//! bytes into the transport-independent [`StreamEvent`] sequence the engine
//! consumes:
//!
//! ```text
//! Idle → Text* → ToolCallOpen → Accumulating* → ToolCallClosed → (Text* | ToolCallOpen)* → Done
//! ```
//!
//! Malformed or truncated input never panics or returns early: it becomes a
//! terminal [`StreamEvent::DecodeError`].

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;

use crate::error::Result;

/// Raw provider byte stream
pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Decoded event stream
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// One decoded unit of a model turn
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallStarted { id: String, name: String },
    ToolCallArgumentChunk { id: String, chunk: String },
    ToolCallCompleted { id: String },
    TurnCompleted { stop_reason: Option<String> },
    DecodeError(String),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::TurnCompleted { .. } | StreamEvent::DecodeError(_))
    }
}

/// Incremental, provider-specific parser
pub trait StreamDecoder: Send {
    /// Consume the next chunk of bytes.
    fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent>;

    /// The byte stream ended; flush or report truncation.
    fn finish(&mut self) -> Vec<StreamEvent>;
}

/// Where a decoder is in the turn
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderPhase {
    Idle,
    Text,
    ToolCallOpen,
    Accumulating,
    ToolCallClosed,
    Done,
}

/// Shared bookkeeping that keeps decoders on the legal transitions.
#[derive(Debug)]
pub struct DecoderState {
    phase: DecoderPhase,
    open_calls: Vec<String>,
    closed_calls: Vec<String>,
}

impl Default for DecoderState {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderState {
    pub fn new() -> Self {
        Self {
            phase: DecoderPhase::Idle,
            open_calls: Vec::new(),
            closed_calls: Vec::new(),
        }
    }

    pub fn phase(&self) -> DecoderPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == DecoderPhase::Done
    }

    pub fn text(&mut self, delta: String) -> Option<StreamEvent> {
        if self.is_done() || delta.is_empty() {
            return None;
        }
        if self.open_calls.is_empty() {
            self.phase = DecoderPhase::Text;
        }
        Some(StreamEvent::TextDelta(delta))
    }

    pub fn start_call(&mut self, id: String, name: String) -> StreamEvent {
        if self.is_done() {
            return self.fail("tool call started after the turn completed");
        }
        if name.is_empty() {
            return self.fail(format!("tool call '{}' has no name", id));
        }
        if self.open_calls.contains(&id) || self.closed_calls.contains(&id) {
            return self.fail(format!("tool call '{}' started twice", id));
        }
        self.open_calls.push(id.clone());
        self.phase = DecoderPhase::ToolCallOpen;
        StreamEvent::ToolCallStarted { id, name }
    }

    pub fn append(&mut self, id: String, chunk: String) -> Option<StreamEvent> {
        if self.is_done() {
            return None;
        }
        if !self.open_calls.contains(&id) {
            return Some(self.fail(format!("argument chunk for unopened tool call '{}'", id)));
        }
        if chunk.is_empty() {
            return None;
        }
        self.phase = DecoderPhase::Accumulating;
        Some(StreamEvent::ToolCallArgumentChunk { id, chunk })
    }

    /// Close a call. Repeated closes of the same call are ignored.
    pub fn complete(&mut self, id: &str) -> Option<StreamEvent> {
        if self.is_done() {
            return None;
        }
        let position = self.open_calls.iter().position(|open| open == id)?;
        let id = self.open_calls.remove(position);
        self.closed_calls.push(id.clone());
        self.phase = DecoderPhase::ToolCallClosed;
        Some(StreamEvent::ToolCallCompleted { id })
    }

    /// Finish the turn, closing any call the provider left open.
    pub fn turn_completed(&mut self, stop_reason: Option<String>) -> Vec<StreamEvent> {
        if self.is_done() {
            return Vec::new();
        }
        let mut events: Vec<StreamEvent> = std::mem::take(&mut self.open_calls)
            .into_iter()
            .map(|id| {
                self.closed_calls.push(id.clone());
                StreamEvent::ToolCallCompleted { id }
            })
            .collect();
        self.phase = DecoderPhase::Done;
        events.push(StreamEvent::TurnCompleted { stop_reason });
        events
    }

    pub fn fail(&mut self, message: impl Into<String>) -> StreamEvent {
        self.phase = DecoderPhase::Done;
        self.open_calls.clear();
        StreamEvent::DecodeError(message.into())
    }

    /// Input ended; anything but a completed turn is truncation.
    pub fn end_of_input(&mut self) -> Option<StreamEvent> {
        match self.phase {
            DecoderPhase::Done => None,
            DecoderPhase::ToolCallOpen | DecoderPhase::Accumulating => {
                let id = self.open_calls.first().cloned().unwrap_or_default();
                Some(self.fail(format!("stream ended inside tool call '{}'", id)))
            }
            _ => Some(self.fail("stream ended before the turn completed")),
        }
    }
}

/// Splits a byte stream into complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every complete line (without `\n` / `\r\n`).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<std::result::Result<String, std::string::FromUtf8Error>> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8(line));
        }
        lines
    }

    /// Whatever is left after the final newline.
    pub fn take_remainder(&mut self) -> Option<std::result::Result<String, std::string::FromUtf8Error>> {
        if self.pending.is_empty() {
            return None;
        }
        Some(String::from_utf8(std::mem::take(&mut self.pending)))
    }
}

struct DecodeLoop {
    raw: RawEventStream,
    decoder: Box<dyn StreamDecoder>,
    pending: VecDeque<StreamEvent>,
    input_done: bool,
    finished: bool,
}

/// Drive `decoder` over `raw` lazily.
///
/// The returned stream is finite and always ends with exactly one terminal
/// event; transport errors surface as `DecodeError`.
pub fn decode_stream(raw: RawEventStream, decoder: Box<dyn StreamDecoder>) -> EventStream {
    let state = DecodeLoop {
        raw,
        decoder,
        pending: VecDeque::new(),
        input_done: false,
        finished: false,
    };

    let stream = futures::stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }
            if let Some(event) = st.pending.pop_front() {
                if event.is_terminal() {
                    st.finished = true;
                }
                return Some((event, st));
            }
            if st.input_done {
                st.finished = true;
                return Some((
                    StreamEvent::DecodeError("stream ended before the turn completed".into()),
                    st,
                ));
            }
            match st.raw.next().await {
                Some(Ok(bytes)) => {
                    let events = st.decoder.feed(&bytes);
                    st.pending.extend(events);
                }
                Some(Err(e)) => {
                    st.pending.push_back(StreamEvent::DecodeError(format!("transport error: {}", e)));
                }
                None => {
                    st.input_done = true;
                    let events = st.decoder.finish();
                    st.pending.extend(events);
                }
            }
        }
    });

    Box::pin(stream)
}
