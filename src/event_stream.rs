//! Incremental reader for newline-framed progress streams
//!
//! The backend's indexing job answers with an unbounded text body in which
//! every complete line of the form `data: <json>` carries one progress
//! event. Chunks arrive with arbitrary boundaries, so bytes are accumulated
//! in a [`FrameBuffer`] and only newline-terminated lines are decoded and
//! dispatched. The unterminated tail is carried over to the next chunk and
//! is never dispatched, not even when the stream ends.

use crate::error::{RelayError, Result};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use std::fmt::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Literal marker preceding the JSON payload of an event line
pub const DATA_PREFIX: &str = "data: ";

/// One progress report emitted by the indexing job
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// When the backend produced the event, if it said so in a known format
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
    /// Remaining payload fields such as `phase`, `created` or `total`
    pub details: Map<String, Value>,
}

impl ProgressEvent {
    /// Decode the JSON payload of a `data:` line
    ///
    /// `message` must be a string. `timestamp` may be epoch milliseconds or
    /// an ISO-8601 string; naive timestamps are taken as UTC.
    pub fn from_json(payload: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| RelayError::ParseError(format!("Invalid event JSON: {}", e)))?;

        let mut fields = match value {
            Value::Object(fields) => fields,
            other => {
                return Err(RelayError::ParseError(format!(
                    "Event payload must be an object, got: {}",
                    other
                )))
            }
        };

        let message = match fields.remove("message") {
            Some(Value::String(message)) => message,
            Some(other) => {
                return Err(RelayError::ParseError(format!(
                    "Event message must be a string, got: {}",
                    other
                )))
            }
            None => return Err(RelayError::ParseError("Event has no message".to_string())),
        };

        let timestamp = fields.remove("timestamp").and_then(|v| parse_timestamp(&v));

        Ok(ProgressEvent {
            timestamp,
            message,
            details: fields,
        })
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            DateTime::from_timestamp_millis(millis)
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        _ => None,
    }
}

/// What the consumer of a progress stream receives, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Progress(ProgressEvent),
    /// A `data:` line whose payload could not be decoded
    Malformed { raw: String },
    /// The upstream closed the body normally
    Complete,
    /// The stream could not be opened or broke mid-way
    Failed { message: String },
}

/// Lifecycle of one [`EventStreamReader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Idle,
    Streaming,
    Completed,
    Aborted,
    Failed,
}

impl ReaderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReaderState::Completed | ReaderState::Aborted | ReaderState::Failed
        )
    }
}

/// Accumulator for bytes that do not yet form a complete line
///
/// Lines are split on raw bytes, so a multi-byte UTF-8 character cut by a
/// chunk boundary is reassembled before it is decoded.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every line it completed
    ///
    /// Returned lines have their `\n` removed. Whatever follows the last
    /// newline stays buffered, possibly empty.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete[..last_newline]
            .split(|b| *b == b'\n')
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Bytes received after the last newline
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Interpret one complete line
///
/// Blank lines and lines without the data prefix yield nothing.
pub fn parse_frame(line: &str) -> Option<StreamEvent> {
    if line.trim().is_empty() {
        return None;
    }

    let payload = line.strip_prefix(DATA_PREFIX)?;
    match ProgressEvent::from_json(payload) {
        Ok(event) => Some(StreamEvent::Progress(event)),
        Err(e) => {
            warn!("Malformed progress frame: {}", e);
            Some(StreamEvent::Malformed {
                raw: line.to_string(),
            })
        }
    }
}

/// Caller-side switch that stops a running [`EventStreamReader`]
#[derive(Debug, Clone)]
pub struct AbortHandle(CancellationToken);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once [`AbortHandle::abort`] has been called
    pub async fn aborted(&self) {
        self.0.cancelled().await
    }
}

enum Step<T> {
    Aborted,
    Next(Option<T>),
}

/// Turns a chunked body into an ordered sequence of [`StreamEvent`]s
///
/// A reader is single-use: once it has left [`ReaderState::Idle`] a new
/// reader is needed for the next stream.
#[derive(Debug)]
pub struct EventStreamReader {
    state: ReaderState,
    buffer: FrameBuffer,
    abort: CancellationToken,
    dispatched: u64,
}

impl Default for EventStreamReader {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStreamReader {
    pub fn new() -> Self {
        EventStreamReader {
            state: ReaderState::Idle,
            buffer: FrameBuffer::new(),
            abort: CancellationToken::new(),
            dispatched: 0,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Number of events handed to the consumer so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(self.abort.clone())
    }

    /// Read `body` to the end, calling `on_event` for every event in order
    ///
    /// `None` stands for a transport that produced no readable body: a
    /// single [`StreamEvent::Failed`] is dispatched. A chunk error also ends
    /// the stream with `Failed`. Normal end of stream dispatches
    /// [`StreamEvent::Complete`]. After an abort nothing more is dispatched.
    pub async fn consume<S, E, F>(&mut self, body: Option<S>, mut on_event: F) -> ReaderState
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
        F: FnMut(StreamEvent),
    {
        if self.state != ReaderState::Idle {
            warn!("Event stream reader reused in state {:?}", self.state);
            self.emit(
                &mut on_event,
                StreamEvent::Failed {
                    message: "reader has already consumed a stream".to_string(),
                },
            );
            return self.state;
        }

        let Some(body) = body else {
            warn!("Progress stream has no readable body");
            self.state = ReaderState::Failed;
            self.emit(
                &mut on_event,
                StreamEvent::Failed {
                    message: RelayError::BodyUnavailable.to_string(),
                },
            );
            return self.state;
        };

        self.state = ReaderState::Streaming;
        let abort = self.abort.clone();
        futures::pin_mut!(body);

        loop {
            let step = tokio::select! {
                biased;
                _ = abort.cancelled() => Step::Aborted,
                item = body.next() => Step::Next(item),
            };

            match step {
                Step::Aborted => {
                    debug!(
                        "Progress stream aborted with {} pending bytes",
                        self.buffer.pending().len()
                    );
                    self.state = ReaderState::Aborted;
                    return self.state;
                }
                Step::Next(Some(Ok(chunk))) => {
                    for line in self.buffer.push(&chunk) {
                        if let Some(event) = parse_frame(&line) {
                            self.emit(&mut on_event, event);
                        }
                    }
                }
                Step::Next(Some(Err(e))) => {
                    warn!("Progress stream failed: {}", e);
                    self.state = ReaderState::Failed;
                    self.emit(
                        &mut on_event,
                        StreamEvent::Failed {
                            message: e.to_string(),
                        },
                    );
                    return self.state;
                }
                Step::Next(None) => {
                    if !self.buffer.is_empty() {
                        debug!(
                            "Dropping {} unterminated bytes at end of stream",
                            self.buffer.pending().len()
                        );
                    }
                    self.state = ReaderState::Completed;
                    self.emit(&mut on_event, StreamEvent::Complete);
                    return self.state;
                }
            }
        }
    }

    /// Record an abort that arrived before any body was available
    ///
    /// Nothing is dispatched.
    pub fn abort_idle(&mut self) -> ReaderState {
        if self.state == ReaderState::Idle {
            self.state = ReaderState::Aborted;
        }
        self.state
    }

    /// End an idle reader with a single failure, without any body
    ///
    /// Used when the request carrying the stream never produced a readable
    /// body, for example a refused connection or an error status.
    pub fn fail<F>(&mut self, message: impl Into<String>, mut on_event: F) -> ReaderState
    where
        F: FnMut(StreamEvent),
    {
        if self.state == ReaderState::Idle {
            self.state = ReaderState::Failed;
        }
        self.emit(
            &mut on_event,
            StreamEvent::Failed {
                message: message.into(),
            },
        );
        self.state
    }

    fn emit<F: FnMut(StreamEvent)>(&mut self, on_event: &mut F, event: StreamEvent) {
        self.dispatched += 1;
        on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_frame_buffer_keeps_unterminated_tail() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        assert_eq!(buffer.pending(), b"data: {\"a\"");

        let lines = buffer.push(b":1}\nnext");
        assert_eq!(lines, vec!["data: {\"a\":1}".to_string()]);
        assert_eq!(buffer.pending(), b"next");
    }

    #[test]
    fn test_frame_buffer_empty_tail_after_newline() {
        let mut buffer = FrameBuffer::new();
        let lines = buffer.push(b"one\n\ntwo\n");
        assert_eq!(lines, vec!["one", "", "two"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_frame_buffer_reassembles_split_utf8() {
        let text = "data: {\"timestamp\":1,\"message\":\"café\"}\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;

        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(&text[..split]).is_empty());
        let lines = buffer.push(&text[split..]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("café"));
    }

    #[test]
    fn test_parse_frame_ignores_blank_and_foreign_lines() {
        assert_eq!(parse_frame(""), None);
        assert_eq!(parse_frame("   "), None);
        assert_eq!(parse_frame(": keep-alive"), None);
        assert_eq!(parse_frame("event: progress"), None);
    }

    #[test]
    fn test_parse_frame_malformed_keeps_raw_line() {
        let line = "data: {not json";
        assert_eq!(
            parse_frame(line),
            Some(StreamEvent::Malformed { raw: line.to_string() })
        );
        let line = "data: {\"timestamp\":1}";
        assert!(matches!(parse_frame(line), Some(StreamEvent::Malformed { .. })));
    }

    #[test]
    fn test_progress_event_epoch_millis() {
        let event = ProgressEvent::from_json(r#"{"timestamp":1700000000123,"message":"hi"}"#).unwrap();
        assert_eq!(
            event.timestamp,
            Some(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap())
        );
        assert_eq!(event.message, "hi");
        assert!(event.details.is_empty());
    }

    #[test]
    fn test_progress_event_naive_iso_timestamp_and_details() {
        let event = ProgressEvent::from_json(
            r#"{"timestamp":"2024-03-01T12:30:05.250000","message":"Indexing finished!","phase":"done","created":3}"#,
        )
        .unwrap();
        assert_eq!(
            event.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap() + chrono::Duration::milliseconds(250))
        );
        assert_eq!(event.details["phase"], "done");
        assert_eq!(event.details["created"], 3);
    }

    #[test]
    fn test_progress_event_unparsable_timestamp_is_none() {
        let event = ProgressEvent::from_json(r#"{"timestamp":"yesterday","message":"x"}"#).unwrap();
        assert_eq!(event.timestamp, None);
    }

    #[test]
    fn test_consume_scenario_across_chunks() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"timestamp\":1,\"message\":\"a\"}\n")),
            Ok(Bytes::from_static(b"data: {\"timestamp\":2,")),
            Ok(Bytes::from_static(b"\"message\":\"b\"}\n")),
        ];

        let mut reader = EventStreamReader::new();
        let mut events = Vec::new();
        let state = tokio_test::block_on(
            reader.consume(Some(futures::stream::iter(chunks)), |e| events.push(e)),
        );

        assert_eq!(state, ReaderState::Completed);
        assert_eq!(events.len(), 3);
        match (&events[0], &events[1]) {
            (StreamEvent::Progress(a), StreamEvent::Progress(b)) => {
                assert_eq!(a.message, "a");
                assert_eq!(a.timestamp, DateTime::from_timestamp_millis(1));
                assert_eq!(b.message, "b");
                assert_eq!(b.timestamp, DateTime::from_timestamp_millis(2));
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert_eq!(events[2], StreamEvent::Complete);
        assert_eq!(reader.dispatched(), 3);
    }

    #[test]
    fn test_consume_twice_fails_without_reading() {
        let mut reader = EventStreamReader::new();
        let empty = futures::stream::iter(Vec::<std::result::Result<Bytes, std::io::Error>>::new());
        tokio_test::block_on(reader.consume(Some(empty), |_| {}));
        assert_eq!(reader.state(), ReaderState::Completed);

        let mut events = Vec::new();
        let again = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(
            b"data: {\"message\":\"late\"}\n",
        ))]);
        let state = tokio_test::block_on(reader.consume(Some(again), |e| events.push(e)));
        assert_eq!(state, ReaderState::Completed);
        assert!(matches!(events.as_slice(), [StreamEvent::Failed { .. }]));
    }
}
