//! End-to-end session manager behavior against the mock engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use llama_runtime::MockEngine;
use llama_session::{
    channel_sink, EngineState, GenerationRequest, InferenceMetrics, InferenceSink,
    SessionConfig, SessionError, SessionEvents, SessionManager, SinkEvent, StaticModelStore,
};

const MODEL_PATH: &str = "/models/mock.gguf";

fn spawn(engine: MockEngine) -> SessionManager {
    SessionManager::spawn(
        StaticModelStore::available(MODEL_PATH),
        SessionConfig::default(),
        move || engine.clone(),
    )
    .unwrap()
}

async fn ready(engine: MockEngine) -> SessionManager {
    let manager = spawn(engine);
    manager.load_model().await.unwrap();
    manager
}

async fn collect(events: SessionEvents) -> Vec<SinkEvent> {
    tokio::time::timeout(Duration::from_secs(10), events.drain())
        .await
        .expect("session did not finish")
}

fn tokens(events: &[SinkEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::Token(t) => Some(t.clone()),
            _ => None,
        })
        .collect()
}

fn terminal_count(events: &[SinkEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

#[tokio::test]
async fn hello_streams_three_tokens_then_completes() {
    let manager = ready(MockEngine::with_script(["Hi", " there", "!"])).await;
    let (sink, events) = channel_sink();

    manager
        .start_session(GenerationRequest::new("Hello"), sink)
        .unwrap();
    let events = collect(events).await;

    assert_eq!(events.len(), 5);
    assert_eq!(events[0], SinkEvent::Started);
    assert_eq!(tokens(&events), vec!["Hi", " there", "!"]);
    match &events[4] {
        SinkEvent::Completed { response, metrics } => {
            assert_eq!(response, "Hi there!");
            assert_eq!(metrics.token_count, 3);
            assert!(metrics.total_time_ms >= metrics.ttft_ms);
        }
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn tokens_arrive_in_engine_order() {
    let prompt = "one two three four five six seven eight";
    let manager = ready(MockEngine::new()).await;
    let (sink, events) = channel_sink();

    manager
        .start_session(GenerationRequest::new(prompt), sink)
        .unwrap();
    let events = collect(events).await;

    let joined: String = tokens(&events).concat();
    assert_eq!(joined, prompt);
    assert!(matches!(
        events.last(),
        Some(SinkEvent::Completed { response, .. }) if response == prompt
    ));
}

#[tokio::test]
async fn events_can_be_consumed_as_a_stream() {
    let manager = ready(MockEngine::with_script(["a", "b"])).await;
    let (sink, events) = channel_sink();

    manager.start_session(GenerationRequest::new("x"), sink).unwrap();
    let events: Vec<SinkEvent> = events.into_stream().collect().await;

    assert_eq!(events.len(), 4);
    assert_eq!(terminal_count(&events), 1);
}

#[tokio::test]
async fn unavailable_models_fail_to_load() {
    let engine = MockEngine::new();
    let probe = engine.probe();
    let manager = SessionManager::spawn(
        StaticModelStore::unavailable(MODEL_PATH),
        SessionConfig::default(),
        move || engine.clone(),
    )
    .unwrap();

    let err = manager.load_model().await.unwrap_err();
    assert!(matches!(&err, SessionError::Load(m) if m.contains("Required model files")));
    assert_eq!(manager.state(), EngineState::Unloaded);
    assert_eq!(probe.loads(), 0);

    let (sink, _events) = channel_sink();
    let err = manager
        .start_session(GenerationRequest::new("Hello"), sink)
        .unwrap_err();
    assert!(matches!(err, SessionError::NotReady(EngineState::Unloaded)));
}

#[tokio::test]
async fn explicit_path_bypasses_the_store() {
    let engine = MockEngine::new();
    let manager = SessionManager::spawn(
        StaticModelStore::unavailable(MODEL_PATH),
        SessionConfig::default(),
        move || engine.clone(),
    )
    .unwrap();

    let path = manager.load_model_at("/elsewhere/model.gguf").await.unwrap();
    assert_eq!(path.to_str(), Some("/elsewhere/model.gguf"));
    assert_eq!(manager.state(), EngineState::Ready);
}

#[tokio::test]
async fn rejected_load_releases_the_engine() {
    let engine = MockEngine::new().reject_load("corrupt weights");
    let probe = engine.probe();
    let manager = spawn(engine);

    let err = manager.load_model().await.unwrap_err();
    assert!(matches!(&err, SessionError::Load(m) if m.contains("corrupt weights")));
    assert_eq!(manager.state(), EngineState::Unloaded);
    assert_eq!(probe.loads(), 1);
    assert_eq!(probe.disposes(), 1);

    // A failed load may be retried.
    assert!(manager.load_model().await.is_err());
    assert_eq!(probe.loads(), 2);
}

#[tokio::test]
async fn second_load_is_rejected() {
    let manager = ready(MockEngine::new()).await;
    assert!(matches!(
        manager.load_model().await,
        Err(SessionError::AlreadyLoaded)
    ));
}

#[tokio::test]
async fn concurrent_loads_load_once() {
    let engine = MockEngine::new().with_load_delay(Duration::from_millis(100));
    let probe = engine.probe();
    let manager = spawn(engine);

    let (first, second) = tokio::join!(manager.load_model(), manager.load_model());

    assert!(first.is_ok());
    assert!(matches!(second, Err(SessionError::LoadInProgress)));
    assert_eq!(probe.loads(), 1);
    assert_eq!(manager.state(), EngineState::Ready);
}

#[tokio::test]
async fn engine_fault_reports_error_without_completion() {
    let engine = MockEngine::with_script(["a", "b", "c"])
        .fail_after(2, "decode failed");
    let manager = ready(engine).await;
    let (sink, events) = channel_sink();

    manager.start_session(GenerationRequest::new("x"), sink).unwrap();
    let events = collect(events).await;

    assert_eq!(tokens(&events), vec!["a", "b"]);
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(events.last(), Some(SinkEvent::Failed(m)) if m.contains("decode failed")));
}

#[tokio::test]
async fn engine_panic_is_contained() {
    let manager = ready(MockEngine::with_script(["a", "b"]).panic_after(1)).await;

    for _ in 0..2 {
        let (sink, events) = channel_sink();
        manager.start_session(GenerationRequest::new("x"), sink).unwrap();
        let events = collect(events).await;

        assert_eq!(tokens(&events), vec!["a"]);
        assert!(matches!(events.last(), Some(SinkEvent::Failed(m)) if m.contains("panicked")));
    }
}

#[tokio::test]
async fn cancel_before_first_token() {
    let (engine, gate) = MockEngine::with_script(["a", "b"]).gated();
    let manager = ready(engine).await;
    let (sink, events) = channel_sink();

    let id = manager.start_session(GenerationRequest::new("x"), sink).unwrap();
    assert!(manager.cancel(id));
    gate.open();

    let events = collect(events).await;
    assert_eq!(events, vec![SinkEvent::Started, SinkEvent::Cancelled]);
}

#[tokio::test]
async fn cancel_mid_stream() {
    let (engine, gate) = MockEngine::with_script(["a", "b", "c", "d"]).gated();
    let manager = ready(engine).await;
    let (sink, mut events) = channel_sink();

    let id = manager.start_session(GenerationRequest::new("x"), sink).unwrap();
    gate.release(2);
    assert_eq!(events.recv().await, Some(SinkEvent::Started));
    assert_eq!(events.recv().await, Some(SinkEvent::Token("a".into())));
    assert_eq!(events.recv().await, Some(SinkEvent::Token("b".into())));

    assert!(manager.cancel(id));
    gate.open();

    let rest = collect(events).await;
    assert_eq!(rest, vec![SinkEvent::Cancelled]);
}

#[tokio::test]
async fn fault_after_cancel_is_reported_as_cancellation() {
    let (engine, gate) = MockEngine::with_script(["a", "b"]).fail_after(1, "late").gated();
    let manager = ready(engine).await;
    let (sink, mut events) = channel_sink();

    let id = manager.start_session(GenerationRequest::new("x"), sink).unwrap();
    gate.release(1);
    assert_eq!(events.recv().await, Some(SinkEvent::Started));
    assert_eq!(events.recv().await, Some(SinkEvent::Token("a".into())));

    assert!(manager.cancel(id));
    gate.open();

    let rest = collect(events).await;
    assert_eq!(rest, vec![SinkEvent::Cancelled]);
}

#[tokio::test]
async fn one_session_at_a_time() {
    let (engine, gate) = MockEngine::with_script(["a", "b"]).gated();
    let manager = ready(engine).await;

    let (first_sink, first_events) = channel_sink();
    let first = manager
        .start_session(GenerationRequest::new("x"), first_sink)
        .unwrap();
    assert_eq!(manager.active_session(), Some(first));

    let (second_sink, second_events) = channel_sink();
    let err = manager
        .start_session(GenerationRequest::new("y"), second_sink)
        .unwrap_err();
    assert!(matches!(err, SessionError::Busy(id) if id == first));
    // The rejected sink was dropped without any notification.
    assert!(collect(second_events).await.is_empty());

    gate.open();
    let events = collect(first_events).await;
    assert!(matches!(events.last(), Some(SinkEvent::Completed { .. })));

    // The slot is free once the terminal event has been delivered.
    assert_eq!(manager.active_session(), None);
    let (sink, events) = channel_sink();
    manager.start_session(GenerationRequest::new("z"), sink).unwrap();
    assert!(matches!(
        collect(events).await.last(),
        Some(SinkEvent::Completed { .. })
    ));
}

#[tokio::test]
async fn cancel_after_terminal_is_a_no_op() {
    let manager = ready(MockEngine::with_script(["a"])).await;
    let (sink, events) = channel_sink();

    let id = manager.start_session(GenerationRequest::new("x"), sink).unwrap();
    let events = collect(events).await;

    assert!(!manager.cancel(id));
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(events.last(), Some(SinkEvent::Completed { .. })));
}

/// Starts a follow-up session from inside `on_complete`.
struct ChainingSink {
    manager: Arc<SessionManager>,
    follow_up: Option<llama_session::ChannelSink>,
    result: Arc<Mutex<Option<bool>>>,
}

impl InferenceSink for ChainingSink {
    fn on_token(&mut self, _token: &str) {}

    fn on_complete(&mut self, _response: String, _metrics: InferenceMetrics) {
        if let Some(sink) = self.follow_up.take() {
            let started = self
                .manager
                .start_session(GenerationRequest::new("again"), sink)
                .is_ok();
            *self.result.lock().unwrap() = Some(started);
        }
    }

    fn on_error(&mut self, _message: String) {}
}

#[tokio::test]
async fn sink_can_start_next_session_on_completion() {
    let manager = Arc::new(ready(MockEngine::with_script(["a"])).await);
    let (follow_up, follow_events) = channel_sink();
    let result = Arc::new(Mutex::new(None));

    manager
        .start_session(
            GenerationRequest::new("first"),
            ChainingSink {
                manager: Arc::clone(&manager),
                follow_up: Some(follow_up),
                result: Arc::clone(&result),
            },
        )
        .unwrap();

    let events = collect(follow_events).await;
    assert_eq!(*result.lock().unwrap(), Some(true));
    assert!(matches!(
        events.last(),
        Some(SinkEvent::Completed { response, .. }) if response == "a"
    ));
}

#[tokio::test]
async fn shutdown_cancels_active_session_and_disposes() {
    let script: Vec<String> = (0..1000).map(|i| format!("t{i} ")).collect();
    let engine = MockEngine::with_script(script).with_token_delay(Duration::from_millis(5));
    let probe = engine.probe();
    let manager = ready(engine).await;
    let (sink, mut events) = channel_sink();

    manager
        .start_session(GenerationRequest::new("x").with_max_tokens(1000), sink)
        .unwrap();
    assert_eq!(events.recv().await, Some(SinkEvent::Started));
    assert!(matches!(events.recv().await, Some(SinkEvent::Token(_))));

    manager.shutdown();

    let rest = collect(events).await;
    assert_eq!(rest.last(), Some(&SinkEvent::Cancelled));
    assert_eq!(terminal_count(&rest), 1);
    assert_eq!(manager.state(), EngineState::Disposed);
    assert_eq!(probe.disposes(), 1);
    assert!(probe.tokens() < 1000);

    let (sink, _events) = channel_sink();
    assert!(matches!(
        manager.start_session(GenerationRequest::new("x"), sink),
        Err(SessionError::ShutDown)
    ));
    assert!(matches!(
        manager.load_model().await,
        Err(SessionError::ShutDown)
    ));

    manager.shutdown();
    assert_eq!(probe.disposes(), 1);
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Panics in `on_token` while holding its lock, so any later callback would panic too.
struct PanickingSink {
    seen: Arc<Mutex<Vec<String>>>,
}

impl InferenceSink for PanickingSink {
    fn on_token(&mut self, token: &str) {
        let mut seen = self.seen.lock().unwrap();
        seen.push(token.to_string());
        panic!("sink rejected {token}");
    }

    fn on_complete(&mut self, _response: String, _metrics: InferenceMetrics) {
        self.seen.lock().unwrap().push("complete".to_string());
    }

    fn on_error(&mut self, message: String) {
        self.seen.lock().unwrap().push(message);
    }

    fn on_cancelled(&mut self) {
        self.seen.lock().unwrap().push("cancelled".to_string());
    }
}

#[tokio::test]
async fn panicking_sink_does_not_take_down_the_worker() {
    let manager = ready(MockEngine::with_script(["a", "b"])).await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    manager
        .start_session(
            GenerationRequest::new("x"),
            PanickingSink {
                seen: Arc::clone(&seen),
            },
        )
        .unwrap();
    wait_until(|| seen.is_poisoned() && manager.active_session().is_none()).await;

    let delivered = seen.lock().unwrap_or_else(|e| e.into_inner()).clone();
    assert_eq!(delivered, vec!["a".to_string()]);

    let (sink, events) = channel_sink();
    manager
        .start_session(GenerationRequest::new("again"), sink)
        .unwrap();
    let events = collect(events).await;
    assert_eq!(tokens(&events), vec!["a", "b"]);
    assert!(matches!(events.last(), Some(SinkEvent::Completed { .. })));
    assert_eq!(manager.state(), EngineState::Ready);
}

/// Shuts the manager down from inside `on_token` and records the engine state it saw.
struct ShutdownOnTokenSink {
    manager: Arc<SessionManager>,
    state_seen: Arc<Mutex<Option<EngineState>>>,
    inner: llama_session::ChannelSink,
}

impl InferenceSink for ShutdownOnTokenSink {
    fn on_start(&mut self) {
        self.inner.on_start();
    }

    fn on_token(&mut self, token: &str) {
        let mut state_seen = self.state_seen.lock().unwrap();
        if state_seen.is_none() {
            self.manager.shutdown();
            *state_seen = Some(self.manager.state());
        }
        self.inner.on_token(token);
    }

    fn on_complete(&mut self, response: String, metrics: InferenceMetrics) {
        self.inner.on_complete(response, metrics);
    }

    fn on_error(&mut self, message: String) {
        self.inner.on_error(message);
    }

    fn on_cancelled(&mut self) {
        self.inner.on_cancelled();
    }
}

#[tokio::test]
async fn shutdown_from_a_sink_disposes_after_the_session_ends() {
    let engine = MockEngine::with_script(["a", "b", "c", "d"]);
    let probe = engine.probe();
    let manager = Arc::new(ready(engine).await);
    let state_seen = Arc::new(Mutex::new(None));
    let (inner, events) = channel_sink();

    manager
        .start_session(
            GenerationRequest::new("x"),
            ShutdownOnTokenSink {
                manager: Arc::clone(&manager),
                state_seen: Arc::clone(&state_seen),
                inner,
            },
        )
        .unwrap();
    let events = collect(events).await;

    assert_eq!(*state_seen.lock().unwrap(), Some(EngineState::Ready));
    assert_eq!(tokens(&events), vec!["a"]);
    assert_eq!(events.last(), Some(&SinkEvent::Cancelled));
    assert_eq!(terminal_count(&events), 1);

    wait_until(|| manager.state() == EngineState::Disposed).await;
    assert_eq!(probe.disposes(), 1);
}

#[tokio::test]
async fn invalid_request_is_rejected_before_admission() {
    let manager = ready(MockEngine::new()).await;
    let (sink, events) = channel_sink();

    let err = manager
        .start_session(GenerationRequest::new("x").with_temperature(0.0), sink)
        .unwrap_err();

    assert!(matches!(err, SessionError::InvalidRequest(_)));
    assert!(collect(events).await.is_empty());
    assert_eq!(manager.active_session(), None);
}

#[tokio::test]
async fn empty_output_completes_with_zero_rates() {
    let manager = ready(MockEngine::with_script(Vec::<String>::new())).await;
    let (sink, events) = channel_sink();

    manager.start_session(GenerationRequest::new("x"), sink).unwrap();
    let events = collect(events).await;

    assert_eq!(events.len(), 2);
    match &events[1] {
        SinkEvent::Completed { response, metrics } => {
            assert!(response.is_empty());
            assert_eq!(metrics.token_count, 0);
            assert_eq!(metrics.tokens_per_sec, 0.0);
            assert_eq!(metrics.decoding_speed, 0.0);
            assert_eq!(metrics.decoding_time_ms, 0.0);
        }
        other => panic!("expected Completed, got {other:?}"),
    }
}

#[tokio::test]
async fn stop_word_ends_the_response() {
    let manager = ready(MockEngine::with_script(["Hello", " world", "</S>", " ignored"])).await;
    let (sink, events) = channel_sink();

    manager.start_session(GenerationRequest::new("x"), sink).unwrap();
    let events = collect(events).await;

    assert_eq!(tokens(&events), vec!["Hello", " world"]);
    assert!(matches!(
        events.last(),
        Some(SinkEvent::Completed { response, .. }) if response == "Hello world"
    ));
}

#[tokio::test]
async fn max_tokens_caps_the_response() {
    let manager = ready(MockEngine::new()).await;
    let (sink, events) = channel_sink();

    manager
        .start_session(GenerationRequest::new("a b c d e").with_max_tokens(2), sink)
        .unwrap();
    let events = collect(events).await;

    assert_eq!(tokens(&events), vec!["a", " b"]);
}

#[tokio::test]
async fn last_metrics_tracks_completed_sessions() {
    let manager = ready(MockEngine::with_script(["a", "b", "c"])).await;
    assert!(manager.last_metrics().is_none());

    let (sink, events) = channel_sink();
    manager.start_session(GenerationRequest::new("x"), sink).unwrap();
    collect(events).await;

    let metrics = manager.last_metrics().unwrap();
    assert_eq!(metrics.token_count, 3);
}

#[test]
fn dropping_an_unloaded_manager_never_builds_an_engine() {
    let engine = MockEngine::new();
    let probe = engine.probe();
    drop(spawn(engine));
    assert_eq!(probe.loads(), 0);
    assert_eq!(probe.disposes(), 0);
}

#[test]
fn config_is_validated_on_spawn() {
    let result = SessionManager::spawn(
        StaticModelStore::available(MODEL_PATH),
        SessionConfig::default().with_command_queue_depth(0),
        MockEngine::new,
    );
    assert!(matches!(result, Err(SessionError::Config(_))));
}
