//! Streaming response plumbing shared by every backend
//!
//! A backend body is read as raw bytes, reassembled into complete lines by
//! [`LineBuffer`], turned into [`StreamEvent`]s by a backend-specific
//! [`StreamDecoder`], and finally folded into cumulative [`StreamChunk`]s by
//! [`assemble`], which also settles usage statistics once per stream.

use std::sync::Arc;

use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::ProviderError;
use crate::models::{FinishReason, StreamChunk, TokenUsage};
use crate::provider::{ChatStream, ProviderCore};

/// Reassembles newline-delimited records across arbitrary read boundaries
///
/// Bytes are buffered raw so a multi-byte character split between two reads
/// is decoded intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a read and drain every line it completes
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    /// The unterminated tail left at end of body, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(decode_line(&line))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}

/// Backend-neutral streaming event
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Newly generated text
    Delta(String),
    /// The backend signalled completion
    Done {
        usage: Option<TokenUsage>,
        finish_reason: Option<FinishReason>,
    },
}

/// Events decoded from one backend response
pub type EventStream = BoxStream<'static, Result<StreamEvent, ProviderError>>;

/// Turns the lines of one backend's streaming protocol into events
pub trait StreamDecoder: Send + 'static {
    /// Decode one complete line. Malformed lines yield no events; an error
    /// ends the stream.
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamEvent>, ProviderError>;
}

/// Decode a byte stream line by line
pub fn decode_events<S, B, D>(body: S, mut decoder: D) -> EventStream
where
    S: Stream<Item = Result<B, ProviderError>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    D: StreamDecoder,
{
    let stream = async_stream::stream! {
        let mut buffer = LineBuffer::new();
        let mut body = Box::pin(body);

        while let Some(read) = body.next().await {
            let bytes = match read {
                Ok(bytes) => bytes,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            for line in buffer.push(bytes.as_ref()) {
                match decoder.decode_line(&line) {
                    Ok(events) => {
                        for event in events {
                            yield Ok(event);
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
        }

        if let Some(line) = buffer.finish() {
            match decoder.decode_line(&line) {
                Ok(events) => {
                    for event in events {
                        yield Ok(event);
                    }
                }
                Err(err) => yield Err(err),
            }
        }
    };
    Box::pin(stream)
}

/// Records the stream's outcome exactly once, counting an abandoned stream
/// as a failure
struct Settlement {
    core: Arc<ProviderCore>,
    started: Instant,
    settled: bool,
}

impl Settlement {
    fn new(core: Arc<ProviderCore>, started: Instant) -> Self {
        Self {
            core,
            started,
            settled: false,
        }
    }

    fn success(&mut self, model: &str, usage: &TokenUsage) {
        if !self.settled {
            self.settled = true;
            self.core
                .record_success(model, usage, self.started.elapsed());
        }
    }

    fn failure(&mut self) {
        if !self.settled {
            self.settled = true;
            self.core.record_failure(self.started.elapsed());
        }
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Stream from {} dropped before completion", self.core.name());
            self.failure();
        }
    }
}

/// Fold backend events into cumulative chunks
///
/// Every non-empty delta yields one chunk. Completion, or a body that ends
/// without a completion signal, yields one final chunk with an empty delta
/// after usage has been recorded from the backend's counts or, failing
/// that, a length-based estimate. Dropping the stream before that final
/// chunk, polled or not, records one failure.
pub fn assemble(
    events: EventStream,
    core: Arc<ProviderCore>,
    model: String,
    prompt_chars: usize,
    started: Instant,
) -> ChatStream {
    let mut settlement = Settlement::new(core, started);
    let stream = async_stream::stream! {
        let mut events = events;
        let mut content = String::new();
        let mut reported: Option<Option<TokenUsage>> = None;

        while let Some(event) = events.next().await {
            match event {
                Ok(StreamEvent::Delta(delta)) => {
                    if delta.is_empty() {
                        continue;
                    }
                    content.push_str(&delta);
                    yield Ok(StreamChunk {
                        content: content.clone(),
                        delta,
                        finished: false,
                        model: model.clone(),
                    });
                }
                Ok(StreamEvent::Done { usage, finish_reason }) => {
                    trace!("Stream for {} finished: {:?}", model, finish_reason);
                    reported = Some(usage);
                    break;
                }
                Err(err) => {
                    settlement.failure();
                    yield Err(err);
                    return;
                }
            }
        }

        let usage = match reported {
            Some(Some(usage)) => usage,
            Some(None) => TokenUsage::estimated(prompt_chars, content.len()),
            None => {
                warn!("Stream for {} ended without a completion signal", model);
                TokenUsage::estimated(prompt_chars, content.len())
            }
        };
        settlement.success(&model, &usage);

        yield Ok(StreamChunk {
            content,
            delta: String::new(),
            finished: true,
            model,
        });
    };
    Box::pin(stream)
}
