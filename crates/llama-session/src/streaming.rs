//! One streamed completion, from `on_start` to its terminal notification.
//!
//! State machine: `Created → Started → Streaming → {Completed | Errored | Cancelled}`.
//!
//! For each token drawn from the engine, in order: record time-to-first-token if it
//! is the first, append it to the response, count it, hand it to the sink. No token
//! is buffered beyond the one in hand.
//!
//! Cancellation is cooperative. The token is checked before each draw and again when
//! a token arrives; a token that arrives after cancellation is discarded, and an
//! engine error that follows a cancellation request is reported as a cancellation.

use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use llama_engine::{CompletionEngine, GenerationRequest};
use llama_runtime::{InferenceMetrics, InferenceTimer, NoopTelemetry, TelemetryHook};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::latch::TerminalLatch;
use crate::session_manager::SessionGuard;
use crate::sink::InferenceSink;

/// Identifier handed out by `start_session`.
pub type SessionId = Uuid;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

/// Which terminal notification a session delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Completed,
    Errored,
    Cancelled,
}

/// Summary returned to the worker once a session has ended.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: SessionId,
    pub outcome: OutcomeKind,
    pub token_count: usize,
    /// Present only for completed sessions.
    pub metrics: Option<InferenceMetrics>,
}

/// How the token loop ended.
enum StreamEnd {
    Exhausted,
    Fault(String),
    Cancelled,
}

/// Drives one request against an engine and reports to its sink.
pub struct StreamingSession {
    id: SessionId,
    request: GenerationRequest,
    sink: Box<dyn InferenceSink>,
    cancel: CancellationToken,
    latch: TerminalLatch,
    state: SessionState,
    response: String,
    token_count: usize,
    telemetry: Option<Box<dyn TelemetryHook>>,
    timer: Option<InferenceTimer>,
    guard: Option<SessionGuard>,
}

impl StreamingSession {
    pub fn new(
        id: SessionId,
        request: GenerationRequest,
        sink: Box<dyn InferenceSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            request,
            sink,
            cancel,
            latch: TerminalLatch::new(),
            state: SessionState::Created,
            response: String::new(),
            token_count: 0,
            telemetry: None,
            timer: None,
            guard: None,
        }
    }

    /// Report timing through `hook` in addition to the sink's metrics.
    pub fn with_telemetry(mut self, hook: Box<dyn TelemetryHook>) -> Self {
        self.telemetry = Some(hook);
        self
    }

    /// Attach the manager's slot guard; it is released just before the terminal
    /// notification so the sink may start the next session.
    pub(crate) fn with_guard(mut self, guard: SessionGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to its terminal outcome.
    pub fn run(mut self, engine: &mut dyn CompletionEngine) -> SessionReport {
        let hook = self
            .telemetry
            .take()
            .unwrap_or_else(|| Box::new(NoopTelemetry));
        self.timer = Some(InferenceTimer::new(hook));
        self.state = SessionState::Started;
        self.sink.on_start();
        tracing::debug!(session_id = %self.id, "session started");

        if self.cancel.is_cancelled() {
            return self.finish(StreamEnd::Cancelled);
        }

        let mut stream = match engine.stream_completion(&self.request) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "engine refused to stream");
                return self.finish(StreamEnd::Fault(e.to_string()));
            }
        };
        self.state = SessionState::Streaming;

        let end = loop {
            if self.cancel.is_cancelled() {
                break StreamEnd::Cancelled;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| stream.next())) {
                Err(payload) => break StreamEnd::Fault(panic_message(payload)),
                Ok(None) => break StreamEnd::Exhausted,
                Ok(Some(Err(e))) => {
                    if self.cancel.is_cancelled() {
                        tracing::debug!(
                            session_id = %self.id,
                            error = %e,
                            "engine stopped after cancellation"
                        );
                        break StreamEnd::Cancelled;
                    }
                    break StreamEnd::Fault(e.to_string());
                }
                Ok(Some(Ok(token))) => {
                    if self.cancel.is_cancelled() {
                        break StreamEnd::Cancelled;
                    }
                    self.deliver(&token);
                }
            }
        };
        drop(stream);

        self.finish(end)
    }

    /// End a session that never reached an engine.
    pub fn abort(mut self, message: impl Into<String>) -> SessionReport {
        self.finish(StreamEnd::Fault(message.into()))
    }

    /// Drop a session that was never handed to a worker, without notifying its sink.
    pub(crate) fn discard(mut self) {
        self.latch.try_acquire();
        self.guard.take();
    }

    fn deliver(&mut self, token: &str) {
        if let Some(timer) = self.timer.as_mut() {
            timer.mark_token();
        }
        self.response.push_str(token);
        self.token_count += 1;
        tracing::trace!(session_id = %self.id, index = self.token_count, "token");
        self.sink.on_token(token);
    }

    fn finish(&mut self, end: StreamEnd) -> SessionReport {
        let outcome = match end {
            StreamEnd::Exhausted => OutcomeKind::Completed,
            StreamEnd::Fault(_) => OutcomeKind::Errored,
            StreamEnd::Cancelled => OutcomeKind::Cancelled,
        };
        let mut report = SessionReport {
            id: self.id,
            outcome,
            token_count: self.token_count,
            metrics: None,
        };

        if !self.latch.try_acquire() {
            return report;
        }

        let metrics = match outcome {
            OutcomeKind::Completed => self.timer.take().map(InferenceTimer::finish),
            _ => {
                self.timer = None;
                self.response.clear();
                None
            }
        };
        report.metrics = metrics;

        // Free the slot before the sink hears about it.
        self.guard.take();

        match end {
            StreamEnd::Exhausted => {
                self.state = SessionState::Completed;
                let response = mem::take(&mut self.response);
                let metrics = metrics.unwrap_or_else(|| {
                    let now = std::time::Instant::now();
                    llama_runtime::compute_metrics(now, None, 0, now)
                });
                self.sink.on_complete(response, metrics);
            }
            StreamEnd::Fault(message) => {
                self.state = SessionState::Errored;
                tracing::warn!(session_id = %self.id, %message, "session failed");
                self.sink.on_error(message);
            }
            StreamEnd::Cancelled => {
                self.state = SessionState::Cancelled;
                tracing::debug!(session_id = %self.id, "session cancelled");
                self.sink.on_cancelled();
            }
        }

        report
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        // A session dropped before reaching a terminal state still owes its sink one,
        // unless the drop is unwinding out of that sink.
        if self.latch.try_acquire() {
            self.guard.take();
            self.state = SessionState::Cancelled;
            self.response.clear();
            if thread::panicking() {
                tracing::warn!(session_id = %self.id, "session abandoned during a panic");
            } else {
                self.sink.on_cancelled();
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("engine panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_engine::ModelSpec;
    use llama_runtime::{LogTelemetry, MockEngine};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl InferenceSink for Recorder {
        fn on_start(&mut self) {
            self.push("start".into());
        }

        fn on_token(&mut self, token: &str) {
            self.push(format!("token:{token}"));
        }

        fn on_complete(&mut self, response: String, metrics: InferenceMetrics) {
            self.push(format!("complete:{response}:{}", metrics.token_count));
        }

        fn on_error(&mut self, message: String) {
            self.push(format!("error:{message}"));
        }

        fn on_cancelled(&mut self) {
            self.push("cancelled".into());
        }
    }

    fn loaded(engine: MockEngine) -> MockEngine {
        let mut engine = engine;
        engine.load(&ModelSpec::new("/models/mock.gguf")).unwrap();
        engine
    }

    fn session(prompt: &str, recorder: &Recorder) -> (StreamingSession, CancellationToken) {
        let cancel = CancellationToken::new();
        let session = StreamingSession::new(
            Uuid::new_v4(),
            GenerationRequest::new(prompt),
            Box::new(recorder.clone()),
            cancel.clone(),
        );
        (session, cancel)
    }

    #[test]
    fn completes_with_concatenated_response() {
        let recorder = Recorder::default();
        let mut engine = loaded(MockEngine::with_script(["Hi", " there", "!"]));
        let (session, _) = session("Hello", &recorder);

        let report = session.run(&mut engine);

        assert_eq!(report.outcome, OutcomeKind::Completed);
        assert_eq!(report.token_count, 3);
        assert_eq!(report.metrics.unwrap().token_count, 3);
        assert_eq!(
            recorder.events(),
            vec![
                "start",
                "token:Hi",
                "token: there",
                "token:!",
                "complete:Hi there!:3"
            ]
        );
    }

    #[test]
    fn pre_cancelled_session_never_streams() {
        let recorder = Recorder::default();
        let mut engine = loaded(MockEngine::with_script(["a"]));
        let probe = engine.probe();
        let (session, cancel) = session("x", &recorder);
        cancel.cancel();

        let report = session.run(&mut engine);

        assert_eq!(report.outcome, OutcomeKind::Cancelled);
        assert_eq!(probe.streams(), 0);
        assert_eq!(recorder.events(), vec!["start", "cancelled"]);
    }

    #[test]
    fn engine_fault_is_reported_once() {
        let recorder = Recorder::default();
        let mut engine = loaded(MockEngine::with_script(["a", "b", "c"]).fail_after(2, "boom"));
        let (session, _) = session("x", &recorder);

        let report = session.run(&mut engine);

        assert_eq!(report.outcome, OutcomeKind::Errored);
        assert!(report.metrics.is_none());
        let events = recorder.events();
        assert_eq!(&events[..3], &["start", "token:a", "token:b"]);
        assert_eq!(events.len(), 4);
        assert!(events[3].starts_with("error:") && events[3].contains("boom"));
    }

    #[test]
    fn refused_stream_is_an_error() {
        let recorder = Recorder::default();
        let mut engine = MockEngine::new();
        let (session, _) = session("x", &recorder);

        let report = session.run(&mut engine);

        assert_eq!(report.outcome, OutcomeKind::Errored);
        assert_eq!(recorder.events().len(), 2);
        assert!(recorder.events()[1].contains("not loaded"));
    }

    #[test]
    fn engine_panic_becomes_error() {
        let recorder = Recorder::default();
        let mut engine = loaded(MockEngine::with_script(["a", "b"]).panic_after(1));
        let (session, _) = session("x", &recorder);

        let report = session.run(&mut engine);

        assert_eq!(report.outcome, OutcomeKind::Errored);
        let events = recorder.events();
        assert_eq!(events[1], "token:a");
        assert!(events[2].contains("engine panicked"));
    }

    #[test]
    fn dropped_session_reports_cancellation() {
        let recorder = Recorder::default();
        let (session, _) = session("x", &recorder);
        drop(session);
        assert_eq!(recorder.events(), vec!["cancelled"]);
    }

    #[test]
    fn abort_skips_start() {
        let recorder = Recorder::default();
        let (session, _) = session("x", &recorder);
        let report = session.abort("model is not loaded");
        assert_eq!(report.outcome, OutcomeKind::Errored);
        assert_eq!(recorder.events(), vec!["error:model is not loaded"]);
    }

    #[test]
    fn telemetry_hook_receives_report() {
        let recorder = Recorder::default();
        let log = LogTelemetry::new();
        let mut engine = loaded(MockEngine::with_script(["a", "b"]));
        let (session, _) = session("x", &recorder);

        session.with_telemetry(Box::new(log.clone())).run(&mut engine);

        assert_eq!(log.last_metrics().unwrap().token_count, 2);
    }
}
