//! Engine ownership and single-session admission.
//!
//! The engine lives on a dedicated OS thread so blocking decode calls never run on the
//! caller's executor. Callers talk to it through a bounded command queue.
//!
//! ```text
//! +----------------+   Command (crossbeam)    +--------------------+
//! | SessionManager | ------ Load / Run -----> | inference-worker   |
//! | (any thread)   | <----- oneshot reply --- | owns: engine       |
//! |                |                          | runs: one session  |
//! +----------------+                          +--------------------+
//!                                                       |
//!                                              sink callbacks -> consumer
//! ```
//!
//! At most one session is active. The slot is taken in `start_session` and released
//! by a [`SessionGuard`] just before the session's terminal notification, so a sink
//! may start the next session from inside `on_complete`.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use llama_engine::{
    CompletionEngine, EngineState, GenerationRequest, LlamaError, ModelSpec, SamplingParams,
};
use llama_runtime::{InferenceMetrics, LogTelemetry};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::sink::InferenceSink;
use crate::store::ModelStore;
use crate::streaming::{SessionId, SessionReport, StreamingSession};

const MODELS_UNAVAILABLE: &str = "Required model files are not available";

/// The session currently holding the slot.
struct ActiveSession {
    id: SessionId,
    cancel: CancellationToken,
}

struct ManagerState {
    engine: EngineState,
    active: Option<ActiveSession>,
    closed: bool,
}

/// State shared between the manager handle, the worker and live guards.
struct Shared {
    state: Mutex<ManagerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_engine(&self, engine: EngineState) {
        self.lock().engine = engine;
    }
}

/// Holds the active-session slot; dropping it frees the slot.
pub(crate) struct SessionGuard {
    id: SessionId,
    shared: Arc<Shared>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.active.as_ref().is_some_and(|a| a.id == self.id) {
            state.active = None;
        }
    }
}

enum ModelSource {
    Store,
    Path(PathBuf),
}

enum Command {
    Load {
        source: ModelSource,
        reply: oneshot::Sender<Result<PathBuf>>,
    },
    Run(StreamingSession),
    Shutdown,
}

/// Owns one engine on a worker thread and runs one streaming session at a time.
///
/// Every method takes `&self`; share the manager behind an `Arc` to call it from
/// several tasks. Dropping the manager shuts it down.
pub struct SessionManager {
    shared: Arc<Shared>,
    commands: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    telemetry: LogTelemetry,
}

impl SessionManager {
    /// Start the worker thread. The engine is created by `factory` on the worker when
    /// a load is requested, so it never crosses threads after construction.
    pub fn spawn<S, F, E>(store: S, config: SessionConfig, factory: F) -> Result<Self>
    where
        S: ModelStore + 'static,
        F: FnMut() -> E + Send + 'static,
        E: CompletionEngine + 'static,
    {
        config.validate()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(ManagerState {
                engine: EngineState::Unloaded,
                active: None,
                closed: false,
            }),
        });
        let (commands, rx) = bounded::<Command>(config.command_queue_depth);

        let worker = Worker {
            shared: Arc::clone(&shared),
            store,
            sampling: config.sampling.clone(),
            factory,
            engine: None,
        };
        let handle = thread::Builder::new()
            .name(config.worker_name.clone())
            .spawn(move || worker.run(rx))?;

        tracing::debug!(worker = %config.worker_name, "inference worker started");

        Ok(Self {
            shared,
            commands,
            worker: Mutex::new(Some(handle)),
            telemetry: LogTelemetry::new(),
        })
    }

    /// Load the text model the store points at.
    ///
    /// Fails with [`SessionError::Load`] if the store reports missing files or the
    /// engine rejects the model; the manager then stays `Unloaded` and may be retried.
    pub async fn load_model(&self) -> Result<PathBuf> {
        self.request_load(ModelSource::Store).await
    }

    /// Load a model from an explicit path, bypassing the store's availability check.
    pub async fn load_model_at(&self, path: impl Into<PathBuf>) -> Result<PathBuf> {
        self.request_load(ModelSource::Path(path.into())).await
    }

    async fn request_load(&self, source: ModelSource) -> Result<PathBuf> {
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(SessionError::ShutDown);
            }
            match state.engine {
                EngineState::Loading => return Err(SessionError::LoadInProgress),
                EngineState::Ready => return Err(SessionError::AlreadyLoaded),
                EngineState::Disposed => return Err(SessionError::ShutDown),
                EngineState::Unloaded => {}
            }
            if self.commands.send(Command::Load { source, reply }).is_err() {
                return Err(SessionError::WorkerUnavailable);
            }
            state.engine = EngineState::Loading;
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                let mut state = self.shared.lock();
                if state.engine == EngineState::Loading {
                    state.engine = EngineState::Unloaded;
                }
                Err(SessionError::WorkerUnavailable)
            }
        }
    }

    /// Begin streaming a completion for `request` into `sink`.
    ///
    /// Returns as soon as the session is queued on the worker; tokens and the terminal
    /// outcome arrive through the sink.
    pub fn start_session<K>(&self, request: GenerationRequest, sink: K) -> Result<SessionId>
    where
        K: InferenceSink + 'static,
    {
        request.validate().map_err(|e| match e {
            LlamaError::InvalidRequest(message) => SessionError::InvalidRequest(message),
            other => SessionError::InvalidRequest(other.to_string()),
        })?;

        let mut state = self.shared.lock();
        if state.closed {
            return Err(SessionError::ShutDown);
        }
        if state.engine != EngineState::Ready {
            return Err(SessionError::NotReady(state.engine));
        }
        if let Some(active) = &state.active {
            return Err(SessionError::Busy(active.id));
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let guard = SessionGuard {
            id,
            shared: Arc::clone(&self.shared),
        };
        let session = StreamingSession::new(id, request, Box::new(sink), cancel.clone())
            .with_telemetry(Box::new(self.telemetry.clone()))
            .with_guard(guard);
        state.active = Some(ActiveSession { id, cancel });

        // Sent under the lock so a concurrent shutdown queues behind it.
        match self.commands.send(Command::Run(session)) {
            Ok(()) => {
                drop(state);
                tracing::debug!(session_id = %id, "session queued");
                Ok(id)
            }
            Err(err) => {
                state.active = None;
                drop(state);
                if let Command::Run(session) = err.into_inner() {
                    session.discard();
                }
                Err(SessionError::WorkerUnavailable)
            }
        }
    }

    /// Request cancellation of session `id`.
    ///
    /// Returns `false` if `id` is not the active session (unknown, or already ended).
    /// The session observes the request before its next token and reports
    /// `on_cancelled`.
    pub fn cancel(&self, id: SessionId) -> bool {
        let state = self.shared.lock();
        match &state.active {
            Some(active) if active.id == id => {
                active.cancel.cancel();
                tracing::debug!(session_id = %id, "cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Cancel any active session, stop the worker and dispose the engine.
    ///
    /// Idempotent. Blocks until the worker has exited, except when called from the
    /// worker thread itself (from inside a sink callback).
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            if let Some(active) = &state.active {
                active.cancel.cancel();
            }
            if !state.closed {
                state.closed = true;
                tracing::info!("shutting down inference worker");
                // The worker may already be gone; there is nothing left to stop then.
                let _ = self.commands.send(Command::Shutdown);
            }
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // The worker marks the engine disposed once the current session ends.
            tracing::debug!("shutdown requested from the worker; not joining");
            return;
        }
        if handle.join().is_err() {
            tracing::error!("inference worker panicked");
        }
        self.shared.set_engine(EngineState::Disposed);
    }

    pub fn state(&self) -> EngineState {
        self.shared.lock().engine
    }

    /// The session currently holding the slot, if any.
    pub fn active_session(&self) -> Option<SessionId> {
        self.shared.lock().active.as_ref().map(|a| a.id)
    }

    /// Metrics of the most recently completed session.
    pub fn last_metrics(&self) -> Option<InferenceMetrics> {
        self.telemetry.last_metrics()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().closed
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Everything owned by the worker thread.
struct Worker<S, F, E> {
    shared: Arc<Shared>,
    store: S,
    sampling: SamplingParams,
    factory: F,
    engine: Option<E>,
}

impl<S, F, E> Worker<S, F, E>
where
    S: ModelStore,
    F: FnMut() -> E,
    E: CompletionEngine,
{
    fn run(mut self, commands: Receiver<Command>) {
        while let Ok(command) = commands.recv() {
            match command {
                Command::Load { source, reply } => {
                    let result = self.load(source);
                    if reply.send(result).is_err() {
                        tracing::debug!("load requester went away");
                    }
                }
                Command::Run(session) => self.run_session(session),
                Command::Shutdown => break,
            }
        }

        // Anything queued behind the shutdown never runs.
        for command in commands.try_iter() {
            match command {
                Command::Load { reply, .. } => {
                    let _ = reply.send(Err(SessionError::ShutDown));
                }
                Command::Run(session) => drop(session),
                Command::Shutdown => {}
            }
        }

        if let Some(mut engine) = self.engine.take() {
            engine.dispose();
        }
        self.shared.set_engine(EngineState::Disposed);
        tracing::debug!("inference worker stopped");
    }

    fn load(&mut self, source: ModelSource) -> Result<PathBuf> {
        match self.try_load(source) {
            Ok((engine, path)) => {
                self.engine = Some(engine);
                self.shared.set_engine(EngineState::Ready);
                tracing::info!(path = %path.display(), "model loaded");
                Ok(path)
            }
            Err(err) => {
                self.shared.set_engine(EngineState::Unloaded);
                tracing::warn!(error = %err, "model load failed");
                Err(err)
            }
        }
    }

    fn try_load(&mut self, source: ModelSource) -> Result<(E, PathBuf)> {
        let path = match source {
            ModelSource::Store => {
                if !self.store.are_models_available() {
                    return Err(SessionError::Load(MODELS_UNAVAILABLE.to_string()));
                }
                self.store.text_model_path()
            }
            ModelSource::Path(path) => path,
        };
        let spec = ModelSpec::new(path.clone()).with_params(self.sampling.clone());

        let mut engine = panic::catch_unwind(AssertUnwindSafe(|| (self.factory)()))
            .map_err(|_| SessionError::Load("engine construction panicked".to_string()))?;

        match panic::catch_unwind(AssertUnwindSafe(|| engine.load(&spec))) {
            Ok(Ok(())) => Ok((engine, path)),
            Ok(Err(e)) => {
                engine.dispose();
                Err(SessionError::Load(e.to_string()))
            }
            Err(_) => {
                engine.dispose();
                Err(SessionError::Load("engine panicked while loading".to_string()))
            }
        }
    }

    fn run_session(&mut self, session: StreamingSession) {
        let span = tracing::info_span!("session", id = %session.id());
        let _entered = span.enter();

        let report = match self.engine.as_mut() {
            Some(engine) => {
                match panic::catch_unwind(AssertUnwindSafe(|| session.run(engine))) {
                    Ok(report) => report,
                    Err(_) => {
                        tracing::error!("sink panicked; session abandoned");
                        return;
                    }
                }
            }
            None => session.abort("Model is not loaded"),
        };
        log_report(&report);
    }
}

fn log_report(report: &SessionReport) {
    tracing::info!(
        outcome = ?report.outcome,
        tokens = report.token_count,
        "session finished"
    );
}
