//! Client-side stream consumer.
//!
//! Opens one push-transport connection per job, merges inbound events into a
//! single logical code buffer, and reconnects on transport failure with
//! bounded exponential backoff. Depends only on the wire contract of the
//! stream endpoint, behind the [`EventTransport`] trait so reconnect logic
//! is testable without a network.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use tokio::sync::Notify;

use crate::errors::TransportError;
use crate::models::{EventPayload, JobStatus, StreamEvent};
use crate::retry::Backoff;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, TransportError>> + Send>>;

/// One way of reaching the stream endpoint. `connect` resolves once the
/// connection is established; items then arrive until a terminal event, a
/// transport failure, or server-side close.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn connect(&self, job_id: &str) -> Result<EventStream, TransportError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    /// Consecutive connection failures tolerated before giving up.
    pub max_reconnects: u32,
    pub backoff: Backoff,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_reconnects: 5,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(8)),
        }
    }
}

/// Observable consumer state, reconciled from the event stream.
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    pub code_buffer: String,
    pub status: Option<JobStatus>,
    pub is_streaming: bool,
    pub last_error: Option<String>,
}

/// Fold one event into the state. Returns true when the event is terminal
/// for the stream.
pub fn apply_event(state: &mut StreamState, event: &StreamEvent) -> bool {
    match &event.payload {
        EventPayload::Status { status, .. } => {
            state.status = Some(*status);
            false
        }
        EventPayload::CodeChunk { code } => {
            state.code_buffer.push_str(code);
            false
        }
        EventPayload::CodeUpdate { code } => {
            state.code_buffer = code.clone();
            false
        }
        EventPayload::Complete { code, status, .. } => {
            // Authoritative: matches the durable record at this moment.
            state.code_buffer = code.clone();
            state.status = Some(*status);
            state.is_streaming = false;
            true
        }
        EventPayload::Error { message } => {
            state.last_error = Some(message.clone());
            state.status = Some(JobStatus::Failed);
            state.is_streaming = false;
            true
        }
    }
}

/// Handle to an open stream. Dropping it detaches the driver; call
/// [`StreamConsumer::close`] to tear the connection down deterministically.
pub struct StreamConsumer {
    state: Arc<Mutex<StreamState>>,
    shutdown: Arc<Notify>,
    handle: tokio::task::JoinHandle<()>,
}

fn lock_state(state: &Arc<Mutex<StreamState>>) -> std::sync::MutexGuard<'_, StreamState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn stop_streaming(state: &Arc<Mutex<StreamState>>) {
    lock_state(state).is_streaming = false;
}

impl StreamConsumer {
    /// Open a consumer for one job. A driver task owns the connection and
    /// all reconnect timers.
    pub fn open(
        transport: Arc<dyn EventTransport>,
        job_id: impl Into<String>,
        config: ConsumerConfig,
    ) -> Self {
        let job_id = job_id.into();
        let state = Arc::new(Mutex::new(StreamState {
            is_streaming: true,
            ..StreamState::default()
        }));
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run_consumer(
            transport,
            job_id,
            config,
            Arc::clone(&state),
            Arc::clone(&shutdown),
        ));
        Self {
            state,
            shutdown,
            handle,
        }
    }

    pub fn snapshot(&self) -> StreamState {
        lock_state(&self.state).clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Intentional teardown: releases the connection and cancels any pending
    /// reconnect timer. No reconnect attempt fires after this returns.
    pub async fn close(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}

async fn run_consumer(
    transport: Arc<dyn EventTransport>,
    job_id: String,
    config: ConsumerConfig,
    state: Arc<Mutex<StreamState>>,
    shutdown: Arc<Notify>,
) {
    let mut failures: u32 = 0;

    loop {
        let connected = tokio::select! {
            _ = shutdown.notified() => {
                stop_streaming(&state);
                return;
            }
            result = transport.connect(&job_id) => result,
        };

        let last_failure: String;
        match connected {
            Ok(mut stream) => {
                // A successful reconnection resets the failure budget. The
                // buffer is left alone: the server replays accumulated code
                // as a full-buffer code-update.
                failures = 0;
                loop {
                    let item = tokio::select! {
                        _ = shutdown.notified() => {
                            stop_streaming(&state);
                            return;
                        }
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(event)) => {
                            if apply_event(&mut lock_state(&state), &event) {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            last_failure = e.to_string();
                            break;
                        }
                        None => {
                            // Server closed without a terminal event (e.g.
                            // lifetime bound); treat like a transport drop.
                            last_failure = "stream closed before completion".to_string();
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                last_failure = e.to_string();
            }
        }

        failures += 1;
        if failures > config.max_reconnects {
            let err = TransportError::ReconnectExhausted {
                attempts: failures,
                last: last_failure.clone(),
            };
            tracing::warn!(job_id = %job_id, "{}", err);
            let mut guard = lock_state(&state);
            guard.last_error = Some(err.to_string());
            guard.is_streaming = false;
            return;
        }

        let delay = config.backoff.delay(failures);
        tracing::debug!(
            job_id = %job_id,
            failures,
            "Transport dropped ({}), reconnecting in {:?}",
            last_failure,
            delay
        );
        tokio::select! {
            _ = shutdown.notified() => {
                stop_streaming(&state);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// ── SSE wire parsing ──────────────────────────────────────────────────

/// Incremental parser for SSE frames. Raw transport bytes go in as they
/// arrive; complete `data:` payloads come out as decoded events. Incomplete
/// trailing bytes stay buffered, so a multi-byte character split across
/// network chunks is reassembled before decoding. Comment lines
/// (keep-alives) and unknown fields are ignored; an undecodable payload is
/// logged and skipped rather than killing the stream.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(boundary) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buffer.drain(..boundary + 2).collect();
            if let Some(event) = Self::parse_frame(&frame) {
                events.push(event);
            }
        }
        events
    }

    fn parse_frame(frame: &[u8]) -> Option<StreamEvent> {
        // Frame boundaries are ASCII, so a complete frame always holds whole
        // UTF-8 sequences even when the transport split mid-character.
        let frame = String::from_utf8_lossy(frame);
        let mut data = String::new();
        for line in frame.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(value.strip_prefix(' ').unwrap_or(value));
            }
        }
        if data.is_empty() {
            return None;
        }
        match serde_json::from_str::<StreamEvent>(&data) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!("Skipping undecodable stream frame: {}", e);
                None
            }
        }
    }
}

// ── HTTP transport ────────────────────────────────────────────────────

/// Production transport: one SSE request against the service.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn connect(&self, job_id: &str) -> Result<EventStream, TransportError> {
        let url = format!(
            "{}/api/jobs/{}/stream",
            self.base_url.trim_end_matches('/'),
            job_id
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?
            .error_for_status()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let bytes = response.bytes_stream();
        let stream = futures_util::stream::unfold(
            (bytes, SseParser::new(), VecDeque::new()),
            |(mut bytes, mut parser, mut pending)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((Ok(event), (bytes, parser, pending)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            pending.extend(parser.push(&chunk));
                        }
                        Some(Err(e)) => {
                            return Some((
                                Err(TransportError::Interrupted(e.to_string())),
                                (bytes, parser, pending),
                            ));
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    // ── Event application ─────────────────────────────────────────────

    #[test]
    fn test_chunks_append_and_updates_replace() {
        let mut state = StreamState::default();
        assert!(!apply_event(&mut state, &StreamEvent::chunk("j", "const")));
        assert!(!apply_event(&mut state, &StreamEvent::chunk("j", " x=1")));
        assert_eq!(state.code_buffer, "const x=1");

        assert!(!apply_event(&mut state, &StreamEvent::update("j", "replaced")));
        assert_eq!(state.code_buffer, "replaced");
    }

    #[test]
    fn test_status_only_touches_status() {
        let mut state = StreamState {
            code_buffer: "keep".into(),
            ..StreamState::default()
        };
        apply_event(
            &mut state,
            &StreamEvent::status("j", JobStatus::Generating, "working"),
        );
        assert_eq!(state.status, Some(JobStatus::Generating));
        assert_eq!(state.code_buffer, "keep");
    }

    #[test]
    fn test_complete_is_authoritative() {
        let mut state = StreamState {
            code_buffer: "stale partial".into(),
            is_streaming: true,
            ..StreamState::default()
        };
        let terminal = apply_event(&mut state, &StreamEvent::complete("j", "final code"));
        assert!(terminal);
        assert_eq!(state.code_buffer, "final code");
        assert_eq!(state.status, Some(JobStatus::Generated));
        assert!(!state.is_streaming);
    }

    #[test]
    fn test_error_event_records_last_error() {
        let mut state = StreamState {
            is_streaming: true,
            ..StreamState::default()
        };
        let terminal = apply_event(&mut state, &StreamEvent::error("j", "model unavailable"));
        assert!(terminal);
        assert_eq!(state.last_error.as_deref(), Some("model unavailable"));
        assert!(!state.is_streaming);
    }

    // ── SSE parsing ───────────────────────────────────────────────────

    fn frame(event: &StreamEvent) -> String {
        format!("data: {}\n\n", serde_json::to_string(event).unwrap())
    }

    #[test]
    fn test_parser_decodes_single_frame() {
        let mut parser = SseParser::new();
        let events = parser.push(frame(&StreamEvent::chunk("j", "abc")).as_bytes());
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0].payload, EventPayload::CodeChunk { code } if code == "abc"));
    }

    #[test]
    fn test_parser_handles_frame_split_across_pushes() {
        let full = frame(&StreamEvent::chunk("j", "abc"));
        let (head, tail) = full.as_bytes().split_at(10);

        let mut parser = SseParser::new();
        assert!(parser.push(head).is_empty());
        let events = parser.push(tail);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_parser_reassembles_multibyte_char_split_across_chunks() {
        let full = frame(&StreamEvent::chunk("j", "caf\u{e9} au lait"));
        let bytes = full.as_bytes();
        // Split inside the two-byte encoding of 'é'.
        let at = full.find('\u{e9}').unwrap() + 1;

        let mut parser = SseParser::new();
        assert!(parser.push(&bytes[..at]).is_empty());
        let events = parser.push(&bytes[at..]);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0].payload,
            EventPayload::CodeChunk { code } if code == "caf\u{e9} au lait"
        ));
    }

    #[test]
    fn test_parser_handles_multiple_frames_in_one_push() {
        let mut input = frame(&StreamEvent::chunk("j", "a"));
        input.push_str(&frame(&StreamEvent::chunk("j", "b")));

        let mut parser = SseParser::new();
        let events = parser.push(input.as_bytes());
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_parser_ignores_keepalive_comments() {
        let mut parser = SseParser::new();
        assert!(parser.push(b": keep-alive\n\n").is_empty());
        let events = parser.push(frame(&StreamEvent::chunk("j", "x")).as_bytes());
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_parser_skips_undecodable_payload() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: not json\n\n").is_empty());
        // The stream keeps working afterwards.
        assert_eq!(parser.push(frame(&StreamEvent::chunk("j", "x")).as_bytes()).len(), 1);
    }

    // ── Reconnect behavior ────────────────────────────────────────────

    enum ConnectScript {
        Fail(&'static str),
        Events(Vec<Result<StreamEvent, TransportError>>),
    }

    struct ScriptedTransport {
        script: Mutex<VecDeque<ConnectScript>>,
        connects: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(script: Vec<ConnectScript>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                connects: AtomicU32::new(0),
            })
        }

        fn connect_count(&self) -> u32 {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventTransport for ScriptedTransport {
        async fn connect(&self, _job_id: &str) -> Result<EventStream, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front();
            match step {
                None | Some(ConnectScript::Fail(_)) => {
                    let msg = match step {
                        Some(ConnectScript::Fail(m)) => m,
                        _ => "connection refused",
                    };
                    Err(TransportError::Connect(msg.to_string()))
                }
                Some(ConnectScript::Events(events)) => {
                    Ok(futures_util::stream::iter(events).boxed())
                }
            }
        }
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            max_reconnects: 5,
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(100)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_cap_sets_terminal_error() {
        // Every connection fails; cap of 5 reconnects means 6 attempts total
        // and not one more.
        let transport = ScriptedTransport::new(vec![]);
        let consumer = StreamConsumer::open(
            Arc::clone(&transport) as Arc<dyn EventTransport>,
            "j1",
            fast_config(),
        );

        while !consumer.is_finished() {
            tokio::time::advance(Duration::from_millis(20)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(transport.connect_count(), 6);
        let state = consumer.snapshot();
        assert!(!state.is_streaming);
        let err = state.last_error.unwrap();
        assert!(err.contains("exhausted"), "unexpected error: {}", err);
        assert!(err.contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_and_converges() {
        // First connection drops mid-stream; the second replays the full
        // buffer and completes.
        let transport = ScriptedTransport::new(vec![
            ConnectScript::Events(vec![
                Ok(StreamEvent::chunk("j2", "ab")),
                Err(TransportError::Interrupted("reset by peer".into())),
            ]),
            ConnectScript::Events(vec![
                Ok(StreamEvent::update("j2", "abcd")),
                Ok(StreamEvent::complete("j2", "abcdef")),
            ]),
        ]);
        let consumer = StreamConsumer::open(
            Arc::clone(&transport) as Arc<dyn EventTransport>,
            "j2",
            fast_config(),
        );

        while !consumer.is_finished() {
            tokio::time::advance(Duration::from_millis(20)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(transport.connect_count(), 2);
        let state = consumer.snapshot();
        assert_eq!(state.code_buffer, "abcdef");
        assert_eq!(state.status, Some(JobStatus::Generated));
        assert!(!state.is_streaming);
        assert!(state.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_reconnect() {
        let transport = ScriptedTransport::new(vec![ConnectScript::Fail("down")]);
        let consumer = StreamConsumer::open(
            Arc::clone(&transport) as Arc<dyn EventTransport>,
            "j3",
            ConsumerConfig {
                max_reconnects: 5,
                // Long delay so close() lands while the reconnect timer is
                // pending.
                backoff: Backoff::new(Duration::from_secs(60), Duration::from_secs(60)),
            },
        );

        tokio::task::yield_now().await;
        assert_eq!(transport.connect_count(), 1);

        consumer.close().await;
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_without_terminal_triggers_reconnect() {
        let transport = ScriptedTransport::new(vec![
            // Stream ends cleanly but with no terminal event (lifetime cap).
            ConnectScript::Events(vec![Ok(StreamEvent::chunk("j4", "partial"))]),
            ConnectScript::Events(vec![Ok(StreamEvent::complete("j4", "partial done"))]),
        ]);
        let consumer = StreamConsumer::open(
            Arc::clone(&transport) as Arc<dyn EventTransport>,
            "j4",
            fast_config(),
        );

        while !consumer.is_finished() {
            tokio::time::advance(Duration::from_millis(20)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(transport.connect_count(), 2);
        assert_eq!(consumer.snapshot().code_buffer, "partial done");
    }
}
