//! Socket capability driven by [`StreamClient`](crate::stream::client::StreamClient).
//!
//! A [`Connector`] opens one socket and hands back the socket handle together
//! with the receiver of its [`SocketEvent`]s. The production connector runs a
//! `tokio-tungstenite` worker task; tests substitute an in-memory one.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::stream::client::StreamClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the connection drops without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code reported when the peer's close frame carried no status.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Event categories a socket can emit.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventCategory {
    Open,
    Message,
    Close,
    Error,
}

/// Native socket event, delivered to listeners as received.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SocketEvent {
    /// Handshake completed.
    Open,
    /// Text payload of one inbound frame.
    Message(String),
    /// Connection closed.
    Close {
        /// Close status code.
        code: u16,
        /// Close reason sent by the peer, empty when absent.
        reason: String,
    },
    /// Transport failure description.
    Error(String),
}

impl SocketEvent {
    /// Returns the category this event is dispatched under.
    pub fn category(&self) -> EventCategory {
        match self {
            Self::Open => EventCategory::Open,
            Self::Message(_) => EventCategory::Message,
            Self::Close { .. } => EventCategory::Close,
            Self::Error(_) => EventCategory::Error,
        }
    }

    /// Returns the raw frame text for message events.
    pub fn data(&self) -> Option<&str> {
        match self {
            Self::Message(text) => Some(text),
            _ => None,
        }
    }
}

/// Connection state as tracked by the transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Handle to one open (or opening) socket.
pub trait Socket: Send + Sync {
    /// Transmits one text frame.
    fn send(&self, text: String) -> Result<(), StreamClientError>;

    /// Requests a normal close. Idempotent.
    fn close(&self);

    /// Returns the current connection state.
    fn ready_state(&self) -> ReadyState;
}

/// Socket handle plus the receiver of its lifecycle and message events.
#[derive(Debug)]
pub struct OpenedSocket<S> {
    pub socket: S,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens sockets to an endpoint.
pub trait Connector {
    type Socket: Socket + 'static;

    /// Starts connecting to `endpoint` without waiting for the handshake.
    fn open(&self, endpoint: &str) -> Result<OpenedSocket<Self::Socket>, StreamClientError>;
}

/// Production connector backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    type Socket = TungsteniteSocket;

    fn open(&self, endpoint: &str) -> Result<OpenedSocket<TungsteniteSocket>, StreamClientError> {
        let request = endpoint.into_client_request()?;
        if !matches!(request.uri().scheme_str(), Some("ws") | Some("wss")) {
            return Err(StreamClientError::InvalidEndpoint(endpoint.to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| StreamClientError::NoRuntime)?;

        let state = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        debug!(event = "stream_socket_opening", endpoint);
        runtime.spawn(socket_worker(
            request,
            Arc::clone(&state),
            command_rx,
            event_tx,
        ));

        Ok(OpenedSocket {
            socket: TungsteniteSocket {
                tx: command_tx,
                state,
            },
            events: event_rx,
        })
    }
}

enum SocketCommand {
    Text(String),
    Close,
}

/// Socket handle whose websocket is owned by a background worker.
#[derive(Debug)]
pub struct TungsteniteSocket {
    tx: mpsc::UnboundedSender<SocketCommand>,
    state: Arc<AtomicU8>,
}

impl Socket for TungsteniteSocket {
    fn send(&self, text: String) -> Result<(), StreamClientError> {
        let state = self.ready_state();
        if state != ReadyState::Open {
            return Err(StreamClientError::NotOpen(state));
        }
        self.tx
            .send(SocketCommand::Text(text))
            .map_err(|_| StreamClientError::SocketClosed)
    }

    fn close(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match ReadyState::from_u8(current) {
                    ReadyState::Connecting | ReadyState::Open => Some(ReadyState::Closing as u8),
                    ReadyState::Closing | ReadyState::Closed => None,
                }
            });
        let _ = self.tx.send(SocketCommand::Close);
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }
}

async fn socket_worker(
    request: Request,
    state: Arc<AtomicU8>,
    mut command_rx: mpsc::UnboundedReceiver<SocketCommand>,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
) {
    let connect = connect_async(request);
    tokio::pin!(connect);

    let socket = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((socket, _)) => break socket,
                Err(err) => {
                    warn!(event = "stream_connect_failed", error = %err);
                    let _ = event_tx.send(SocketEvent::Error(err.to_string()));
                    finish(&state, &event_tx, ABNORMAL_CLOSURE, String::new());
                    return;
                }
            },
            command = command_rx.recv() => match command {
                Some(SocketCommand::Text(_)) => {
                    warn!(event = "stream_send_before_open_dropped");
                }
                Some(SocketCommand::Close) | None => {
                    debug!(event = "stream_closed_while_connecting");
                    let _ = event_tx.send(SocketEvent::Error(
                        "connection closed before handshake completed".to_string(),
                    ));
                    finish(&state, &event_tx, ABNORMAL_CLOSURE, String::new());
                    return;
                }
            },
        }
    };

    let opened = state.compare_exchange(
        ReadyState::Connecting as u8,
        ReadyState::Open as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    if opened.is_err() {
        debug!(event = "stream_closed_while_connecting");
        let mut socket = socket;
        let _ = socket.close(None).await;
        let _ = event_tx.send(SocketEvent::Error(
            "connection closed before handshake completed".to_string(),
        ));
        finish(&state, &event_tx, ABNORMAL_CLOSURE, String::new());
        return;
    }
    debug!(event = "stream_socket_open");
    let _ = event_tx.send(SocketEvent::Open);

    let (code, reason) = run_open_socket(socket, &state, &mut command_rx, &event_tx).await;
    finish(&state, &event_tx, code, reason);
}

async fn run_open_socket(
    mut socket: WsStream,
    state: &AtomicU8,
    command_rx: &mut mpsc::UnboundedReceiver<SocketCommand>,
    event_tx: &mpsc::UnboundedSender<SocketEvent>,
) -> (u16, String) {
    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(SocketCommand::Text(text)) => {
                    if let Err(err) = socket.send(Message::Text(text.into())).await {
                        warn!(event = "stream_write_failed", error = %err);
                        let _ = event_tx.send(SocketEvent::Error(err.to_string()));
                        return (ABNORMAL_CLOSURE, String::new());
                    }
                }
                Some(SocketCommand::Close) | None => {
                    state.store(ReadyState::Closing as u8, Ordering::Release);
                    if let Err(err) = socket.close(None).await {
                        debug!(event = "stream_close_send_failed", error = %err);
                        return (ABNORMAL_CLOSURE, String::new());
                    }
                    return drain_until_closed(&mut socket).await;
                }
            },
            inbound = socket.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = event_tx.send(SocketEvent::Message(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    let _ = event_tx.send(SocketEvent::Message(text));
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = socket.send(Message::Pong(payload)).await {
                        warn!(event = "stream_pong_failed", error = %err);
                        let _ = event_tx.send(SocketEvent::Error(err.to_string()));
                        return (ABNORMAL_CLOSURE, String::new());
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    state.store(ReadyState::Closing as u8, Ordering::Release);
                    return close_details(frame);
                }
                Some(Err(err)) => {
                    warn!(event = "stream_read_failed", error = %err);
                    let _ = event_tx.send(SocketEvent::Error(err.to_string()));
                    return (ABNORMAL_CLOSURE, String::new());
                }
                None => return (ABNORMAL_CLOSURE, String::new()),
            },
        }
    }
}

async fn drain_until_closed(socket: &mut WsStream) -> (u16, String) {
    while let Some(inbound) = socket.next().await {
        match inbound {
            Ok(Message::Close(frame)) => return close_details(frame),
            Ok(_) => {}
            Err(_) => break,
        }
    }
    (NO_STATUS_RECEIVED, String::new())
}

fn close_details(frame: Option<CloseFrame>) -> (u16, String) {
    match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
        None => (NO_STATUS_RECEIVED, String::new()),
    }
}

fn finish(
    state: &AtomicU8,
    event_tx: &mpsc::UnboundedSender<SocketEvent>,
    code: u16,
    reason: String,
) {
    state.store(ReadyState::Closed as u8, Ordering::Release);
    debug!(event = "stream_socket_closed", code);
    let _ = event_tx.send(SocketEvent::Close { code, reason });
}

#[cfg(test)]
mod tests {
    use super::{Connector, EventCategory, ReadyState, Socket, SocketEvent, TungsteniteConnector};
    use crate::stream::client::StreamClientError;

    #[test]
    fn events_report_their_category() {
        assert_eq!(SocketEvent::Open.category(), EventCategory::Open);
        assert_eq!(
            SocketEvent::Message("{}".to_string()).category(),
            EventCategory::Message
        );
        assert_eq!(
            SocketEvent::Close {
                code: 1000,
                reason: String::new()
            }
            .category(),
            EventCategory::Close
        );
        assert_eq!(
            SocketEvent::Error("boom".to_string()).category(),
            EventCategory::Error
        );
    }

    #[test]
    fn only_message_events_carry_data() {
        assert_eq!(SocketEvent::Message("1".to_string()).data(), Some("1"));
        assert_eq!(SocketEvent::Open.data(), None);
    }

    #[test]
    fn ready_state_decodes_stored_values() {
        for state in [
            ReadyState::Connecting,
            ReadyState::Open,
            ReadyState::Closing,
            ReadyState::Closed,
        ] {
            assert_eq!(ReadyState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn connector_rejects_non_websocket_scheme() {
        let error = TungsteniteConnector
            .open("http://localhost:8765")
            .expect_err("http scheme is not a websocket endpoint");
        assert!(matches!(
            error,
            StreamClientError::InvalidEndpoint(_) | StreamClientError::WebSocket(_)
        ));
    }

    #[test]
    fn connector_requires_a_runtime() {
        let error = TungsteniteConnector
            .open("ws://localhost:8765")
            .expect_err("no runtime on this thread");
        assert!(matches!(error, StreamClientError::NoRuntime));
    }

    #[test]
    fn failed_handshake_emits_error_then_close() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            let addr = listener.local_addr().expect("addr");
            drop(listener);

            let mut opened = TungsteniteConnector
                .open(&format!("ws://{addr}/"))
                .expect("open is non-blocking");
            assert_eq!(
                opened.socket.ready_state(),
                ReadyState::Connecting
            );

            let first = opened.events.recv().await.expect("error event");
            assert_eq!(first.category(), EventCategory::Error);
            let second = opened.events.recv().await.expect("close event");
            assert_eq!(
                second,
                SocketEvent::Close {
                    code: super::ABNORMAL_CLOSURE,
                    reason: String::new()
                }
            );
            assert_eq!(
                opened.socket.ready_state(),
                ReadyState::Closed
            );
        });
    }

    #[test]
    fn close_while_connecting_moves_to_closing_immediately() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            let addr = listener.local_addr().expect("addr");

            let mut opened = TungsteniteConnector
                .open(&format!("ws://{addr}/"))
                .expect("open is non-blocking");
            opened.socket.close();
            assert_eq!(opened.socket.ready_state(), ReadyState::Closing);
            opened.socket.close();
            assert_eq!(opened.socket.ready_state(), ReadyState::Closing);

            let first = opened.events.recv().await.expect("error event");
            assert_eq!(first.category(), EventCategory::Error);
            let second = opened.events.recv().await.expect("close event");
            assert!(matches!(
                second,
                SocketEvent::Close {
                    code: super::ABNORMAL_CLOSURE,
                    ..
                }
            ));
            assert_eq!(opened.socket.ready_state(), ReadyState::Closed);
            drop(listener);
        });
    }
}
