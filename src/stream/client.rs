//! Stream websocket client.
//!
//! A [`StreamClient`] owns exactly one socket. Outbound `{action, data}`
//! messages are written as JSON text frames; inbound events are dispatched to
//! registered listeners by a background task, one event at a time.
//!
//! Dispatch begins at [`StreamClient::start`]. Events that arrive earlier are
//! held by the transport, so listeners registered between construction and
//! `start` observe every event from `Open` onwards.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, error};

use crate::config::{ConfigError, StreamConfig};
use crate::stream::listeners::{LifecycleCategory, ListenerRegistry};
use crate::stream::proto::{OutboundMessage, EXCHANGES_ACTION};
use crate::stream::transport::{
    Connector, EventCategory, OpenedSocket, ReadyState, Socket, SocketEvent, TungsteniteConnector,
};

/// Client bound to one stream socket.
pub struct StreamClient {
    endpoint: String,
    socket: Box<dyn Socket>,
    listeners: ListenerRegistry,
    dispatch_errors: ErrorSink,
    runtime: Handle,
    pending_events: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    dispatch_task: Option<JoinHandle<()>>,
}

impl StreamClient {
    /// Opens a websocket connection to `endpoint`.
    ///
    /// Returns as soon as the connection attempt has started. Handshake
    /// failures are reported as [`SocketEvent::Error`] followed by
    /// [`SocketEvent::Close`]. Must be called from within a Tokio runtime.
    pub fn connect(endpoint: &str) -> Result<Self, StreamClientError> {
        Self::with_connector(&TungsteniteConnector, endpoint)
    }

    /// Opens a connection to the endpoint of `config`.
    pub fn from_config(config: &StreamConfig) -> Result<Self, StreamClientError> {
        Self::connect(config.require_ws_url()?)
    }

    /// Opens a connection through a caller-supplied connector.
    pub fn with_connector<C>(connector: &C, endpoint: &str) -> Result<Self, StreamClientError>
    where
        C: Connector,
    {
        let runtime = Handle::try_current().map_err(|_| StreamClientError::NoRuntime)?;
        let OpenedSocket { socket, events } = connector.open(endpoint)?;

        debug!(event = "stream_client_created", endpoint);
        Ok(Self {
            endpoint: endpoint.to_string(),
            socket: Box::new(socket),
            listeners: ListenerRegistry::new(),
            dispatch_errors: ErrorSink::default(),
            runtime,
            pending_events: Some(events),
            dispatch_task: None,
        })
    }

    /// Starts delivering socket events to the registered listeners.
    ///
    /// Call once the initial listeners are registered. Later calls do nothing.
    /// Listeners may still be added afterwards; they see events from the next
    /// one dispatched.
    pub fn start(&mut self) {
        let Some(events) = self.pending_events.take() else {
            return;
        };
        debug!(
            event = "stream_dispatch_started",
            endpoint = %self.endpoint,
            listeners = self.listeners.len()
        );
        self.dispatch_task = Some(self.runtime.spawn(dispatch_events(
            events,
            self.listeners.clone(),
            self.dispatch_errors.clone(),
        )));
    }

    /// Returns the endpoint this client was opened with.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the transport's current connection state.
    pub fn ready_state(&self) -> ReadyState {
        self.socket.ready_state()
    }

    /// Sends `{action, data}` as one JSON text frame.
    ///
    /// Fails with [`StreamClientError::NotOpen`] unless the socket is open.
    pub fn send<T>(&self, action: &str, data: &T) -> Result<(), StreamClientError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_value(data)?;
        self.send_message(&OutboundMessage::new(action, data))
    }

    /// Sends a prebuilt outbound message.
    pub fn send_message(&self, message: &OutboundMessage) -> Result<(), StreamClientError> {
        let text = message.to_text()?;
        debug!(
            event = "stream_send",
            action = %message.action,
            bytes = text.len()
        );
        self.socket.send(text)
    }

    /// Asks the server for its exchange list.
    ///
    /// The reply arrives as an `exchanges` action; see
    /// [`StreamClient::add_action_listener`].
    pub fn list_exchanges(&self) -> Result<(), StreamClientError> {
        self.send_message(&OutboundMessage::list_exchanges())
    }

    /// Registers `handler` for a lifecycle category.
    ///
    /// The handler receives the native event unmodified.
    pub fn add_event_listener<F>(&self, category: LifecycleCategory, handler: F)
    where
        F: FnMut(&SocketEvent) + Send + 'static,
    {
        self.listeners.add_passthrough(category.into(), handler);
    }

    /// Registers `handler` for inbound messages, decoded from JSON.
    ///
    /// The handler receives the parsed payload and the raw event. Frames that
    /// fail to parse never reach the handler; the failure is logged and
    /// published on [`StreamClient::take_dispatch_errors`].
    pub fn add_message_listener<F>(&self, handler: F)
    where
        F: FnMut(Value, &SocketEvent) + Send + 'static,
    {
        self.listeners.add_decoded(handler);
    }

    /// Registers `handler` for inbound messages without decoding them.
    pub fn add_raw_message_listener<F>(&self, handler: F)
    where
        F: FnMut(&SocketEvent) + Send + 'static,
    {
        self.listeners.add_passthrough(EventCategory::Message, handler);
    }

    /// Registers `handler` for `{action, data}` messages tagged `action`.
    ///
    /// The handler receives `data`. Frames that are not an action envelope
    /// are reported like any other decode failure.
    pub fn add_action_listener<F>(&self, action: &str, handler: F)
    where
        F: FnMut(Value, &SocketEvent) + Send + 'static,
    {
        self.listeners.add_action(action, handler);
    }

    /// Convenience for listening to the `exchanges` reply.
    pub fn add_exchanges_listener<F>(&self, handler: F)
    where
        F: FnMut(Value, &SocketEvent) + Send + 'static,
    {
        self.add_action_listener(EXCHANGES_ACTION, handler);
    }

    /// Takes the receiver of listener failures raised during dispatch.
    ///
    /// Failures are only queued once a receiver has been taken; earlier ones
    /// are logged and discarded. Returns `None` after the first call.
    pub fn take_dispatch_errors(&mut self) -> Option<mpsc::UnboundedReceiver<StreamClientError>> {
        self.dispatch_errors.subscribe()
    }

    /// Requests a normal close of the socket.
    ///
    /// Registered listeners still receive the resulting close event.
    pub fn close(&self) {
        debug!(event = "stream_close_requested", endpoint = %self.endpoint);
        self.socket.close();
    }

    /// Returns true once the dispatch task has delivered the final event.
    ///
    /// Always false before [`StreamClient::start`].
    pub fn is_finished(&self) -> bool {
        self.dispatch_task
            .as_ref()
            .is_some_and(JoinHandle::is_finished)
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.socket.close();
    }
}

impl std::fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.endpoint)
            .field("ready_state", &self.ready_state())
            .field("listeners", &self.listeners)
            .field("started", &self.pending_events.is_none())
            .finish()
    }
}

/// Errors produced by the stream client and its transport.
#[derive(Debug, Error)]
pub enum StreamClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Endpoint is not a `ws://` or `wss://` URL.
    #[error("invalid websocket endpoint: {0}")]
    InvalidEndpoint(String),

    /// Configuration could not supply an endpoint.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Socket is not in the open state.
    #[error("socket is not open (state: {0:?})")]
    NotOpen(ReadyState),

    /// Transport worker has shut down.
    #[error("socket is closed")]
    SocketClosed,

    /// No Tokio runtime is available to drive the socket.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// A listener panicked while handling an event.
    #[error("listener panicked: {0}")]
    ListenerPanicked(String),
}

/// Optional destination for dispatch failures, attached on first request.
#[derive(Clone, Default)]
struct ErrorSink(Arc<Mutex<Option<mpsc::UnboundedSender<StreamClientError>>>>);

impl ErrorSink {
    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<StreamClientError>> {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        Some(rx)
    }

    fn publish(&self, failure: StreamClientError) {
        let slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = slot.as_ref() {
            let _ = tx.send(failure);
        }
    }
}

async fn dispatch_events(
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    listeners: ListenerRegistry,
    errors: ErrorSink,
) {
    while let Some(socket_event) = events.recv().await {
        for failure in listeners.dispatch(&socket_event) {
            error!(event = "stream_dispatch_failed", error = %failure);
            errors.publish(failure);
        }
    }
    debug!(event = "stream_dispatch_stopped");
}
