//! Streaming relay from an upstream chunk sequence to the outbound SSE wire format.
//!
//! The first chunk picks the mode. Raw bytes mean the upstream already speaks the wire format
//! and everything is passed through untouched. Structured values are serialized and framed as
//! `data: <json>\n\n`, followed by `data: [DONE]\n\n` once the upstream is exhausted.
//!
//! Upstream errors never reach the client as a transport failure: the relay emits one generic
//! error event and ends the stream. Dropping the output stream (client disconnect) drops the
//! upstream with it and is recorded as an aborted stream.

use std::collections::{BTreeMap, VecDeque};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;
use thiserror::Error;

use super::metrics::{MetricsHandle, StreamOutcome};
use super::throttle::Usage;

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";
pub const ERROR_FRAME: &[u8] =
    b"data: {\"error\":{\"message\":\"internal error\",\"type\":\"internal_error\"}}\n\n";

const SSE_USAGE_TRACKER_MAX_BUFFER_BYTES: usize = 512 * 1024;
const SSE_USAGE_TRACKER_TAIL_BYTES: usize = 128 * 1024;

#[derive(Debug, Error)]
#[error("upstream error: {message}")]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

/// A structured event value as produced by provider SDKs. May contain raw bytes anywhere,
/// which JSON cannot carry directly.
#[derive(Clone, Debug, PartialEq)]
pub enum EventValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
    List(Vec<EventValue>),
    Map(BTreeMap<String, EventValue>),
}

impl EventValue {
    /// Converts to JSON. Byte strings become UTF-8 text (lossily), non-finite floats become
    /// `null`.
    pub fn into_json(self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(value) => Value::Bool(value),
            Self::Int(value) => Value::from(value),
            Self::Float(value) => serde_json::Number::from_f64(value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(value) => Value::String(value),
            Self::Bytes(value) => Value::String(String::from_utf8_lossy(&value).into_owned()),
            Self::List(items) => Value::Array(items.into_iter().map(Self::into_json).collect()),
            Self::Map(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, value.into_json()))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for EventValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(value) => Self::Bool(value),
            Value::Number(number) => match number.as_i64() {
                Some(value) => Self::Int(value),
                None => Self::Float(number.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(value) => Self::Text(value),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Self::from(value)))
                    .collect(),
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum UpstreamChunk {
    /// Already-encoded wire bytes.
    Raw(Bytes),
    Structured(EventValue),
}

impl From<Value> for UpstreamChunk {
    fn from(value: Value) -> Self {
        Self::Structured(EventValue::from(value))
    }
}

impl From<Bytes> for UpstreamChunk {
    fn from(bytes: Bytes) -> Self {
        Self::Raw(bytes)
    }
}

pub type UpstreamStream = BoxStream<'static, Result<UpstreamChunk, UpstreamError>>;
pub type RelayStream = BoxStream<'static, Bytes>;

#[derive(Clone, Debug, PartialEq)]
pub struct RelayOutcome {
    pub outcome: StreamOutcome,
    /// Usage seen in the stream, if the upstream reported any.
    pub usage: Option<Usage>,
}

#[derive(Clone, Debug, Default)]
pub struct StreamRelay {
    metrics: MetricsHandle,
}

impl StreamRelay {
    pub fn new(metrics: MetricsHandle) -> Self {
        Self { metrics }
    }

    /// `on_complete` fires exactly once: when the upstream ends, when it fails, or when the
    /// returned stream is dropped early.
    pub fn relay<F>(&self, upstream: UpstreamStream, on_complete: F) -> RelayStream
    where
        F: FnOnce(RelayOutcome) + Send + 'static,
    {
        let state = RelayState {
            upstream,
            mode: Mode::Undecided,
            buffer: VecDeque::new(),
            done: false,
            tracker: SseUsageTracker::default(),
            finisher: Finisher {
                metrics: self.metrics.clone(),
                callback: Some(Box::new(on_complete)),
                observed: None,
            },
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if let Some(frame) = state.buffer.pop_front() {
                    let len = frame.len();
                    state
                        .finisher
                        .metrics
                        .record(|metrics| metrics.record_stream_chunk(len));
                    return Some((frame, state));
                }
                if state.done {
                    return None;
                }

                match state.upstream.next().await {
                    Some(Ok(chunk)) => state.push_chunk(chunk),
                    Some(Err(err)) => {
                        tracing::warn!(
                            status = ?err.status,
                            error = %err,
                            "upstream stream failed; ending relay with error event"
                        );
                        state.fail();
                    }
                    None => {
                        if state.mode != Mode::Passthrough {
                            state.buffer.push_back(Bytes::from_static(DONE_FRAME));
                        }
                        state.done = true;
                        state.finisher.finish(StreamOutcome::Completed);
                    }
                }
            }
        })
        .boxed()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Undecided,
    Passthrough,
    Framed,
}

struct RelayState {
    upstream: UpstreamStream,
    mode: Mode,
    buffer: VecDeque<Bytes>,
    done: bool,
    tracker: SseUsageTracker,
    finisher: Finisher,
}

impl RelayState {
    fn push_chunk(&mut self, chunk: UpstreamChunk) {
        if self.mode == Mode::Undecided {
            self.mode = match chunk {
                UpstreamChunk::Raw(_) => Mode::Passthrough,
                UpstreamChunk::Structured(_) => Mode::Framed,
            };
        }

        match chunk {
            UpstreamChunk::Raw(bytes) => {
                self.tracker.ingest(&bytes);
                if let Some(observed) = self.tracker.take_observed() {
                    self.finisher.observe(observed);
                }
                if !bytes.is_empty() {
                    self.buffer.push_back(bytes);
                }
            }
            UpstreamChunk::Structured(value) => {
                let json = value.into_json();
                if let Some(observed) = observed_usage(&json) {
                    self.finisher.observe(observed);
                }
                let encoded = match serde_json::to_vec(&json) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to encode stream event");
                        self.fail();
                        return;
                    }
                };
                let frame = match self.mode {
                    Mode::Passthrough => Bytes::from(encoded),
                    Mode::Framed | Mode::Undecided => {
                        let mut out = BytesMut::with_capacity(6 + encoded.len() + 2);
                        out.extend_from_slice(b"data: ");
                        out.extend_from_slice(&encoded);
                        out.extend_from_slice(b"\n\n");
                        out.freeze()
                    }
                };
                self.buffer.push_back(frame);
            }
        }
    }

    fn fail(&mut self) {
        self.buffer.push_back(Bytes::from_static(ERROR_FRAME));
        self.done = true;
        self.finisher.finish(StreamOutcome::Error);
    }
}

type CompletionCallback = Box<dyn FnOnce(RelayOutcome) + Send + 'static>;

struct Finisher {
    metrics: MetricsHandle,
    callback: Option<CompletionCallback>,
    observed: Option<ObservedUsage>,
}

impl Finisher {
    fn observe(&mut self, next: ObservedUsage) {
        let merged = match self.observed {
            Some(prev) => ObservedUsage {
                input_tokens: next.input_tokens.or(prev.input_tokens),
                output_tokens: next.output_tokens.or(prev.output_tokens),
            },
            None => next,
        };
        self.observed = Some(merged);
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        let Some(callback) = self.callback.take() else {
            return;
        };
        self.metrics
            .record(|metrics| metrics.record_stream_end(outcome));
        callback(RelayOutcome {
            outcome,
            usage: self.observed.map(ObservedUsage::into_usage),
        });
    }
}

impl Drop for Finisher {
    fn drop(&mut self) {
        if self.callback.is_some() {
            tracing::debug!("client went away before the stream finished");
            self.finish(StreamOutcome::Aborted);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ObservedUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl ObservedUsage {
    fn into_usage(self) -> Usage {
        Usage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens.unwrap_or(0),
        }
    }
}

/// Reads a usage object from an OpenAI chunk (`usage`), an Anthropic `message_start`
/// (`message.usage`) or a Responses API event (`response.usage`).
fn observed_usage(event: &Value) -> Option<ObservedUsage> {
    let usage = event
        .get("usage")
        .or_else(|| event.get("message").and_then(|message| message.get("usage")))
        .or_else(|| event.get("response").and_then(|response| response.get("usage")))?;
    if !usage.is_object() {
        return None;
    }
    let field = |names: [&str; 2]| {
        names
            .iter()
            .find_map(|name| usage.get(*name).and_then(Value::as_u64))
    };
    let observed = ObservedUsage {
        input_tokens: field(["input_tokens", "prompt_tokens"]),
        output_tokens: field(["output_tokens", "completion_tokens"]),
    };
    (observed.input_tokens.is_some() || observed.output_tokens.is_some()).then_some(observed)
}

/// Scans passthrough SSE bytes for usage without holding more than a bounded tail.
#[derive(Default)]
struct SseUsageTracker {
    buffer: BytesMut,
    observed: Option<ObservedUsage>,
}

impl SseUsageTracker {
    fn ingest(&mut self, chunk: &Bytes) {
        self.buffer.extend_from_slice(chunk.as_ref());

        while let Some((pos, delimiter_len)) = find_sse_delimiter(self.buffer.as_ref()) {
            let event = self.buffer.split_to(pos);
            let _ = self.buffer.split_to(delimiter_len);

            let Some(data) = sse_data(event.as_ref()) else {
                continue;
            };
            let data = trim_ascii_whitespace(&data);
            if data == b"[DONE]" || !data.starts_with(b"{") {
                continue;
            }
            let Ok(value) = serde_json::from_slice::<Value>(data) else {
                continue;
            };
            if let Some(next) = observed_usage(&value) {
                self.observed = Some(match self.observed {
                    Some(prev) => ObservedUsage {
                        input_tokens: next.input_tokens.or(prev.input_tokens),
                        output_tokens: next.output_tokens.or(prev.output_tokens),
                    },
                    None => next,
                });
            }
        }

        if self.buffer.len() > SSE_USAGE_TRACKER_MAX_BUFFER_BYTES {
            let keep_from = self
                .buffer
                .len()
                .saturating_sub(SSE_USAGE_TRACKER_TAIL_BYTES);
            self.buffer = self.buffer.split_off(keep_from);
        }
    }

    fn take_observed(&mut self) -> Option<ObservedUsage> {
        self.observed.take()
    }
}

fn find_sse_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    // One forward scan so mixed newline styles split at the earliest boundary.
    let mut idx = 0usize;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if buf[idx..].starts_with(b"\r\n\r\n") {
            return Some((idx, 4));
        }
        idx += 1;
    }
    None
}

fn sse_data(event: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::<u8>::new();
    for line in event.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(rest) = line.strip_prefix(b"data:") else {
            continue;
        };
        let rest = trim_ascii_whitespace(rest);
        if rest.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(b'\n');
        }
        out.extend_from_slice(rest);
    }
    (!out.is_empty()).then_some(out)
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|pos| pos + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (
        Arc<Mutex<Vec<RelayOutcome>>>,
        impl FnOnce(RelayOutcome) + Send + 'static,
    ) {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        (outcomes, move |outcome| sink.lock().unwrap().push(outcome))
    }

    fn upstream(items: Vec<Result<UpstreamChunk, UpstreamError>>) -> UpstreamStream {
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn frames_structured_chunks_and_appends_done() {
        let metrics = MetricsHandle::default();
        let relay = StreamRelay::new(metrics.clone());
        let (outcomes, on_complete) = recorder();

        let frames: Vec<Bytes> = relay
            .relay(
                upstream(vec![
                    Ok(serde_json::json!({"delta": "hi"}).into()),
                    Ok(serde_json::json!({"usage": {"prompt_tokens": 7, "completion_tokens": 3}})
                        .into()),
                ]),
                on_complete,
            )
            .collect()
            .await;

        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"data: {\"delta\":\"hi\"}\n\n"),
                Bytes::from_static(
                    b"data: {\"usage\":{\"completion_tokens\":3,\"prompt_tokens\":7}}\n\n"
                ),
                Bytes::from_static(DONE_FRAME),
            ]
        );
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(
            *outcomes,
            vec![RelayOutcome {
                outcome: StreamOutcome::Completed,
                usage: Some(Usage {
                    input_tokens: Some(7),
                    output_tokens: 3
                }),
            }]
        );
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stream_chunks_total, 3);
        assert_eq!(snapshot.stream_completed_total, 1);
    }

    #[tokio::test]
    async fn error_after_chunks_ends_with_single_error_event() {
        let metrics = MetricsHandle::default();
        let relay = StreamRelay::new(metrics.clone());
        let (outcomes, on_complete) = recorder();

        let frames: Vec<Bytes> = relay
            .relay(
                upstream(vec![
                    Ok(serde_json::json!({"n": 1}).into()),
                    Ok(serde_json::json!({"n": 2}).into()),
                    Err(UpstreamError::new("connection reset")),
                    Ok(serde_json::json!({"n": 3}).into()),
                ]),
                on_complete,
            )
            .collect()
            .await;

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2], Bytes::from_static(ERROR_FRAME));
        assert!(!frames.iter().any(|frame| frame.as_ref() == DONE_FRAME));
        assert_eq!(outcomes.lock().unwrap()[0].outcome, StreamOutcome::Error);
        assert_eq!(metrics.snapshot().stream_errors_total, 1);
    }

    #[tokio::test]
    async fn raw_first_chunk_passes_bytes_through() {
        let relay = StreamRelay::default();
        let (outcomes, on_complete) = recorder();
        let first = Bytes::from_static(b"event: message_start\ndata: {\"message\":{\"usage\":{\"input_tokens\":11,\"output_tokens\":1}}}\n\n");
        let second = Bytes::from_static(b"data: {\"usage\":{\"output_tokens\":42}}\n\n");

        let frames: Vec<Bytes> = relay
            .relay(
                upstream(vec![
                    Ok(UpstreamChunk::Raw(first.clone())),
                    Ok(UpstreamChunk::Raw(second.clone())),
                ]),
                on_complete,
            )
            .collect()
            .await;

        assert_eq!(frames, vec![first, second]);
        assert_eq!(
            outcomes.lock().unwrap()[0].usage,
            Some(Usage {
                input_tokens: Some(11),
                output_tokens: 42
            })
        );
    }

    #[tokio::test]
    async fn dropping_the_stream_records_abort_once() {
        let metrics = MetricsHandle::default();
        let relay = StreamRelay::new(metrics.clone());
        let (outcomes, on_complete) = recorder();

        let mut out = relay.relay(
            upstream(vec![
                Ok(serde_json::json!({"n": 1}).into()),
                Ok(serde_json::json!({"n": 2}).into()),
            ]),
            on_complete,
        );
        assert!(out.next().await.is_some());
        drop(out);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].outcome, StreamOutcome::Aborted);
        assert_eq!(metrics.snapshot().stream_aborted_total, 1);
    }

    #[tokio::test]
    async fn empty_upstream_still_terminates() {
        let relay = StreamRelay::default();
        let (outcomes, on_complete) = recorder();
        let frames: Vec<Bytes> = relay.relay(upstream(Vec::new()), on_complete).collect().await;
        assert_eq!(frames, vec![Bytes::from_static(DONE_FRAME)]);
        assert_eq!(outcomes.lock().unwrap()[0].usage, None);
    }

    #[test]
    fn nested_bytes_become_json_strings() {
        let mut inner = BTreeMap::new();
        inner.insert(
            "payload".to_string(),
            EventValue::Bytes(Bytes::from_static(b"abc")),
        );
        let value = EventValue::List(vec![
            EventValue::Map(inner),
            EventValue::Float(f64::NAN),
            EventValue::Int(-3),
        ]);
        assert_eq!(
            value.into_json(),
            serde_json::json!([{"payload": "abc"}, null, -3])
        );
    }
}
