//! Deterministic mock backend.
//!
//! [`MockEngine`] implements [`CompletionEngine`] without any model weights. It either
//! echoes the prompt back word by word or replays a fixed script, and can be told to
//! fail, panic, pause between tokens, or wait on a [`StreamGate`] before each token.
//! Clones share a [`MockProbe`] so tests can observe loads, disposes and streams made
//! by handles that were moved onto another thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use llama_engine::{
    CompletionEngine, GenerationRequest, LlamaError, ModelSpec, Result, StopCriteria,
    StopWordStream, TokenStream,
};

/// Shared counters observed across clones of a [`MockEngine`].
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    loads: Arc<AtomicUsize>,
    disposes: Arc<AtomicUsize>,
    streams: Arc<AtomicUsize>,
    tokens: Arc<AtomicUsize>,
}

impl MockProbe {
    /// Number of `load` calls (successful or not).
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn disposes(&self) -> usize {
        self.disposes.load(Ordering::SeqCst)
    }

    /// Number of streams opened.
    pub fn streams(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    /// Number of raw tokens produced, before stop criteria.
    pub fn tokens(&self) -> usize {
        self.tokens.load(Ordering::SeqCst)
    }
}

/// Releases gated tokens one at a time. Dropping the gate opens it for good.
#[derive(Debug)]
pub struct StreamGate {
    tx: Sender<()>,
}

impl StreamGate {
    /// Allow `n` more tokens through.
    pub fn release(&self, n: usize) {
        for _ in 0..n {
            // The receiver lives in the engine; if it is gone there is nothing to release.
            let _ = self.tx.send(());
        }
    }

    /// Open the gate permanently.
    pub fn open(self) {}
}

/// Scripted backend for tests and demos.
#[derive(Debug, Clone, Default)]
pub struct MockEngine {
    script: Option<Vec<String>>,
    fault: Option<(usize, String)>,
    panic_after: Option<usize>,
    load_error: Option<String>,
    token_delay: Option<Duration>,
    load_delay: Option<Duration>,
    gate: Option<Receiver<()>>,
    probe: MockProbe,
    loaded: bool,
    disposed: bool,
}

impl MockEngine {
    /// An engine that echoes the prompt back word by word.
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine that replays `tokens` for every request.
    pub fn with_script<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Some(tokens.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Yield `n` tokens, then fail with an inference error carrying `message`.
    pub fn fail_after(mut self, n: usize, message: impl Into<String>) -> Self {
        self.fault = Some((n, message.into()));
        self
    }

    /// Yield `n` tokens, then panic inside the stream.
    pub fn panic_after(mut self, n: usize) -> Self {
        self.panic_after = Some(n);
        self
    }

    /// Make every `load` call fail with `message`.
    pub fn reject_load(mut self, message: impl Into<String>) -> Self {
        self.load_error = Some(message.into());
        self
    }

    /// Sleep before producing each token.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Sleep inside `load`.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    /// Block before each token until the returned gate releases it.
    pub fn gated(mut self) -> (Self, StreamGate) {
        let (tx, rx) = unbounded();
        self.gate = Some(rx);
        (self, StreamGate { tx })
    }

    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn tokens_for(&self, prompt: &str) -> Vec<String> {
        match &self.script {
            Some(script) => script.clone(),
            None => prompt
                .split_whitespace()
                .enumerate()
                .map(|(i, word)| {
                    if i == 0 {
                        word.to_string()
                    } else {
                        format!(" {word}")
                    }
                })
                .collect(),
        }
    }
}

impl CompletionEngine for MockEngine {
    fn load(&mut self, spec: &ModelSpec) -> Result<()> {
        if let Some(delay) = self.load_delay {
            thread::sleep(delay);
        }
        self.probe.loads.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = &self.load_error {
            return Err(LlamaError::ModelLoad(message.clone()));
        }
        if spec.path.as_os_str().is_empty() {
            return Err(LlamaError::ModelLoad("empty model path".to_string()));
        }

        tracing::debug!(path = %spec.path.display(), "mock model loaded");
        self.loaded = true;
        Ok(())
    }

    fn stream_completion(&mut self, request: &GenerationRequest) -> Result<TokenStream<'_>> {
        if self.disposed {
            return Err(LlamaError::Disposed);
        }
        if !self.loaded {
            return Err(LlamaError::NotLoaded);
        }
        self.probe.streams.fetch_add(1, Ordering::SeqCst);

        let raw = MockTokens {
            tokens: self.tokens_for(&request.prompt),
            pos: 0,
            fault: self.fault.clone(),
            panic_after: self.panic_after,
            delay: self.token_delay,
            gate: self.gate.as_ref(),
            probe: &self.probe,
        };
        Ok(Box::new(StopWordStream::new(
            raw,
            StopCriteria::from_params(&request.params),
        )))
    }

    fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.loaded = false;
            self.probe.disposes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Raw token source behind a mock stream.
struct MockTokens<'a> {
    tokens: Vec<String>,
    pos: usize,
    fault: Option<(usize, String)>,
    panic_after: Option<usize>,
    delay: Option<Duration>,
    gate: Option<&'a Receiver<()>>,
    probe: &'a MockProbe,
}

impl Iterator for MockTokens<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let faulting = matches!(&self.fault, Some((after, _)) if *after == self.pos);
        let panicking = self.panic_after == Some(self.pos);
        if !faulting && !panicking && self.pos >= self.tokens.len() {
            return None;
        }

        // Faults and panics wait on the gate like tokens do.
        if let Some(gate) = self.gate {
            // A disconnected gate means it was opened for good.
            let _ = gate.recv();
        }
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }

        if faulting {
            self.pos += 1;
            let message = self.fault.as_ref().map(|(_, m)| m.clone()).unwrap_or_default();
            return Some(Err(LlamaError::Inference(message)));
        }
        if panicking {
            panic!("mock engine panicked after {} tokens", self.pos);
        }

        let token = self.tokens[self.pos].clone();
        self.pos += 1;
        self.probe.tokens.fetch_add(1, Ordering::SeqCst);
        Some(Ok(token))
    }
}
