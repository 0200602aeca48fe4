//! Decoding of the server-sent event stream returned by OpenAI
//! compatible chat completion endpoints.
//!
//! Frames look like `data: {"choices":[{"delta":{...}}]}` and the
//! stream ends with `data: [DONE]`. Anything else on the wire (blank
//! separators, comments, keep-alives, garbage) is dropped without
//! failing the stream.
use std::time::Duration;

use anyhow::{Error, anyhow};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tokio::time::timeout;

use super::ByteStream;

/// One incremental piece of model output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamDelta {
    Reasoning(String),
    Content(String),
}

// Servers disagree on the reasoning field name. LM Studio and
// DeepSeek use `reasoning_content`, llama.cpp and OpenRouter send
// `reasoning`.
#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, PartialEq)]
enum Frame {
    Deltas(Vec<StreamDelta>),
    Done,
    Skip,
}

fn parse_line(line: &str) -> Frame {
    let Some(data) = line.strip_prefix("data:") else {
        return Frame::Skip;
    };
    let data = data.trim();
    if data.is_empty() {
        return Frame::Skip;
    }
    if data == "[DONE]" {
        return Frame::Done;
    }

    let chunk = match serde_json::from_str::<CompletionChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::trace!("Skipping malformed frame {}: {}", data, e);
            return Frame::Skip;
        }
    };

    let Some(delta) = chunk.choices.into_iter().next().and_then(|c| c.delta) else {
        return Frame::Skip;
    };

    let mut deltas = Vec::new();
    for reasoning in [delta.reasoning_content, delta.reasoning].into_iter().flatten() {
        if !reasoning.is_empty() {
            deltas.push(StreamDelta::Reasoning(reasoning));
        }
    }
    if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
        deltas.push(StreamDelta::Content(content));
    }
    Frame::Deltas(deltas)
}

/// Incremental line decoder. Bytes are buffered until a full line is
/// available so frames split across reads (or a multi-byte character
/// split across reads) decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the `[DONE]` sentinel was seen. Nothing after it is
    /// decoded.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds the next chunk of the body and returns every delta from
    /// lines completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamDelta> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_line(&line[..line.len() - 1], &mut out);
            if self.done {
                break;
            }
        }
        out
    }

    /// Flushes a final line that was not newline terminated.
    pub fn finish(&mut self) -> Vec<StreamDelta> {
        let mut out = Vec::new();
        if self.done || self.buffer.is_empty() {
            return out;
        }
        let line = std::mem::take(&mut self.buffer);
        self.handle_line(&line, &mut out);
        out
    }

    fn handle_line(&mut self, raw: &[u8], out: &mut Vec<StreamDelta>) {
        let line = String::from_utf8_lossy(raw);
        match parse_line(line.trim_end_matches('\r')) {
            Frame::Deltas(deltas) => out.extend(deltas),
            Frame::Done => {
                self.done = true;
                self.buffer.clear();
            }
            Frame::Skip => {}
        }
    }
}

/// Turns a raw response body into a finite stream of deltas. A
/// transport error ends the stream with that error.
pub fn decode_stream(
    mut bytes: ByteStream,
) -> impl Stream<Item = Result<StreamDelta, Error>> + Send + 'static {
    async_stream::try_stream! {
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for delta in decoder.push(&chunk) {
                yield delta;
            }
            if decoder.is_done() {
                break;
            }
        }
        for delta in decoder.finish() {
            yield delta;
        }
    }
}

/// Fails the body with `idle timeout` when no bytes at all arrive for
/// `idle`. Keep-alive comments count as activity even though they
/// never decode to a delta.
pub fn with_idle_timeout(bytes: ByteStream, idle: Duration) -> ByteStream {
    Box::pin(idle_guarded(bytes, idle))
}

fn idle_guarded(
    mut bytes: ByteStream,
    idle: Duration,
) -> impl Stream<Item = Result<Vec<u8>, Error>> + Send + 'static {
    async_stream::try_stream! {
        loop {
            match timeout(idle, bytes.next()).await {
                Ok(Some(chunk)) => {
                    yield chunk?;
                }
                Ok(None) => break,
                Err(_) => {
                    Err::<(), Error>(anyhow!("idle timeout"))?;
                }
            }
        }
    }
}
