//! Session consumers.
//!
//! An [`InferenceSink`] receives the notifications of one session on the worker
//! thread, in order: `on_start`, zero or more `on_token`, then exactly one of
//! `on_complete`, `on_error` or `on_cancelled`.
//!
//! [`ChannelSink`] re-dispatches those notifications as [`SinkEvent`]s over an
//! unbounded ordered channel, so an async consumer (a UI task, an HTTP handler) can
//! drain them on its own executor. Sending never blocks the worker.

use futures::stream::{self, Stream};
use llama_runtime::InferenceMetrics;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Receives the notifications of one streaming session.
pub trait InferenceSink: Send {
    /// The session started; fired before the first token is requested.
    fn on_start(&mut self) {}

    /// A token arrived, in engine emission order.
    fn on_token(&mut self, token: &str);

    /// The engine finished normally. `response` is the concatenation of all tokens.
    fn on_complete(&mut self, response: String, metrics: InferenceMetrics);

    /// The engine faulted. Never used for cancellation.
    fn on_error(&mut self, message: String);

    /// The session was cancelled.
    fn on_cancelled(&mut self) {}
}

impl<S: InferenceSink + ?Sized> InferenceSink for Box<S> {
    fn on_start(&mut self) {
        (**self).on_start()
    }

    fn on_token(&mut self, token: &str) {
        (**self).on_token(token)
    }

    fn on_complete(&mut self, response: String, metrics: InferenceMetrics) {
        (**self).on_complete(response, metrics)
    }

    fn on_error(&mut self, message: String) {
        (**self).on_error(message)
    }

    fn on_cancelled(&mut self) {
        (**self).on_cancelled()
    }
}

/// A session notification as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Started,
    Token(String),
    Completed {
        response: String,
        metrics: InferenceMetrics,
    },
    Failed(String),
    Cancelled,
}

impl SinkEvent {
    /// Whether this event ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SinkEvent::Completed { .. } | SinkEvent::Failed(_) | SinkEvent::Cancelled
        )
    }
}

/// Sink half of [`channel_sink`].
#[derive(Debug)]
pub struct ChannelSink {
    tx: UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    fn send(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("session event dropped: receiver closed");
        }
    }
}

impl InferenceSink for ChannelSink {
    fn on_start(&mut self) {
        self.send(SinkEvent::Started);
    }

    fn on_token(&mut self, token: &str) {
        self.send(SinkEvent::Token(token.to_string()));
    }

    fn on_complete(&mut self, response: String, metrics: InferenceMetrics) {
        self.send(SinkEvent::Completed { response, metrics });
    }

    fn on_error(&mut self, message: String) {
        self.send(SinkEvent::Failed(message));
    }

    fn on_cancelled(&mut self) {
        self.send(SinkEvent::Cancelled);
    }
}

/// Consumer half of [`channel_sink`].
///
/// The channel closes once the session drops its sink, right after the terminal
/// event, so draining until `None` observes the whole session.
#[derive(Debug)]
pub struct SessionEvents {
    rx: UnboundedReceiver<SinkEvent>,
}

impl SessionEvents {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<SinkEvent> {
        self.rx.recv().await
    }

    /// Blocking variant for synchronous consumers.
    ///
    /// Panics if called from within an async execution context.
    pub fn blocking_recv(&mut self) -> Option<SinkEvent> {
        self.rx.blocking_recv()
    }

    /// Take an event if one is queued.
    pub fn try_recv(&mut self) -> Option<SinkEvent> {
        self.rx.try_recv().ok()
    }

    /// Collect every remaining event until the channel closes.
    pub async fn drain(mut self) -> Vec<SinkEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = SinkEvent> {
        stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }
}

/// Create a connected [`ChannelSink`] / [`SessionEvents`] pair.
pub fn channel_sink() -> (ChannelSink, SessionEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink { tx }, SessionEvents { rx })
}
