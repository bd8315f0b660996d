//! Transport decoder for chat-completion response bodies.
//!
//! Handles the three framings an OpenAI-compatible endpoint may answer with:
//! 1. `text/event-stream` -- events parsed by `eventsource-stream`, each
//!    event's `data` carrying one JSON chunk, ended by `data: [DONE]`
//! 2. newline-delimited JSON -- one bare chunk object per line
//! 3. a single JSON body -- answer at `choices[0].message.content` (or `choices[0].text`)
//!
//! NDJSON input is buffered as bytes and only split on `\n`, so a line (and
//! any multi-byte UTF-8 sequence inside it) is decoded only once it is
//! complete. A malformed chunk is logged and skipped; it never aborts the
//! stream.

use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use colloquy_types::error::CompletionError;
use colloquy_types::llm::{Completion, StreamEvent, Usage};

const DONE_SENTINEL: &str = "[DONE]";

/// One chunk object as sent on the wire.
#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: Option<WireContent>,
    /// Present in full bodies and in some NDJSON servers' chunks.
    #[serde(default)]
    message: Option<WireContent>,
    /// Legacy completions shape.
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        }
    }
}

/// Decodes chunk payloads shared by both streaming framings.
///
/// Handles the `[DONE]` sentinel and counts malformed payloads.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    done: bool,
    skipped: usize,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the `[DONE]` sentinel (or end of body) has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of malformed payloads skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Decode one payload: an SSE event's data or one NDJSON line.
    pub fn decode(&mut self, payload: &str) -> Vec<StreamEvent> {
        let payload = payload.trim();
        let mut events = Vec::new();
        if self.done || payload.is_empty() {
            return events;
        }
        if payload == DONE_SENTINEL {
            debug!("stream done sentinel received");
            self.done = true;
            events.push(StreamEvent::Done);
            return events;
        }

        match serde_json::from_str::<WireChunk>(payload) {
            Ok(chunk) => push_chunk_events(chunk, &mut events),
            Err(err) => {
                self.skipped += 1;
                warn!(error = %err, line = %truncate(payload), "malformed stream chunk, skipping");
            }
        }
        events
    }

    /// Mark the body closed. Yields `Done` unless the sentinel was seen.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec![StreamEvent::Done]
    }
}

/// Decode a `text/event-stream` body into stream events.
///
/// Event framing (multi-line `data`, comments, `event`/`id`/`retry` fields,
/// CRLF, split UTF-8) is handled by `eventsource-stream`; each event's data
/// then goes through [`ChunkDecoder`]. Ends after `[DONE]` or when the body
/// closes.
pub fn decode_event_stream<S, B>(
    body: S,
) -> impl Stream<Item = Result<StreamEvent, CompletionError>> + Send
where
    S: Stream<Item = Result<B, CompletionError>> + Send,
    B: AsRef<[u8]> + Send,
{
    async_stream::try_stream! {
        let mut events = std::pin::pin!(body.eventsource());
        let mut decoder = ChunkDecoder::new();

        while let Some(event) = events.next().await {
            let event = event.map_err(map_event_stream_error)?;
            for decoded in decoder.decode(&event.data) {
                yield decoded;
            }
            if decoder.is_done() {
                return;
            }
        }
        for decoded in decoder.finish() {
            yield decoded;
        }
    }
}

fn map_event_stream_error(err: EventStreamError<CompletionError>) -> CompletionError {
    match err {
        EventStreamError::Transport(err) => err,
        other => CompletionError::Decode(format!("invalid event stream: {other}")),
    }
}

/// Incremental decoder for newline-delimited JSON bodies.
///
/// Feed raw body chunks with [`push`](Self::push) in arrival order and call
/// [`finish`](Self::finish) when the body closes. Events come out in the
/// order their lines arrived.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
    chunks: ChunkDecoder,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.chunks.is_done()
    }

    /// Number of malformed lines skipped so far.
    pub fn skipped_lines(&self) -> usize {
        self.chunks.skipped()
    }

    /// Decode every complete line now available.
    ///
    /// A trailing partial line stays buffered until the next chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.is_done() {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            events.extend(self.decode_line(&line[..newline]));
            if self.is_done() {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// Flush the final unterminated line and mark the stream finished.
    ///
    /// Always ends with `StreamEvent::Done` unless the sentinel was already seen.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let mut events = if rest.is_empty() || self.is_done() {
            Vec::new()
        } else {
            self.decode_line(&rest)
        };
        events.extend(self.chunks.finish());
        events
    }

    fn decode_line(&mut self, raw: &[u8]) -> Vec<StreamEvent> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        self.chunks.decode(line)
    }
}

fn push_chunk_events(chunk: WireChunk, events: &mut Vec<StreamEvent>) {
    if let Some(choice) = chunk.choices.into_iter().next() {
        let text = choice
            .delta
            .and_then(|d| d.content)
            .or_else(|| choice.message.and_then(|m| m.content))
            .or(choice.text);
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            events.push(StreamEvent::TextDelta { text });
        }
        if let Some(reason) = choice.finish_reason {
            events.push(StreamEvent::Finish { reason });
        }
    }
    if let Some(usage) = chunk.usage {
        events.push(StreamEvent::Usage(usage.into()));
    }
}

/// Extract the answer from a complete, non-streamed JSON body.
pub fn decode_full_body(body: &[u8]) -> Result<Completion, CompletionError> {
    let chunk: WireChunk = serde_json::from_slice(body)
        .map_err(|e| CompletionError::Decode(format!("response body is not a completion: {e}")))?;

    let usage = chunk.usage.map(Usage::from);
    let choice = chunk
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| CompletionError::Decode("response has no choices".to_string()))?;

    let text = choice
        .message
        .and_then(|m| m.content)
        .or(choice.text)
        .unwrap_or_default();

    Ok(Completion {
        text,
        finish_reason: choice.finish_reason,
        usage,
    })
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(120) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
