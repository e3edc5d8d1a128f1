//! Client-facing event transport.
//!
//! Workers never accept TCP connections themselves. Handed-off streams are
//! fed into a [`HandoffListener`], which `axum::serve` drives like any other
//! listener; `GET /socket` upgrades to a WebSocket carrying JSON
//! [`ClientFrame`]s.
//!
//! Each session turns inbound frames into [`WorkerEvent`]s through a single
//! interceptor ([`intercept`]) and writes whatever the routing core queues
//! on the socket's outbox.

pub mod rewind;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Router;
use axum::extract::connect_info::Connected;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::serve::{IncomingStream, Listener};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;

use crate::ids;
use crate::protocol::ClientFrame;
use crate::routing::WorkerEvent;
use crate::routing::socket_manager::{ClientCommand, ClientSocket};
use rewind::Rewind;

/// Events the routing core may queue for one client before it is dropped
/// as too slow.
const OUTBOX_CAPACITY: usize = 256;

const WS_SEND_TIMEOUT: Duration = Duration::from_secs(30);

// ── Handed-off streams ─────────────────────────────────────────────────

/// A client connection after handoff, with its replayed first bytes.
pub enum ClientStream {
    Plain(Rewind<TcpStream>),
    Tls(Box<TlsStream<Rewind<TcpStream>>>),
}

impl AsyncRead for ClientStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Peer information carried with a handed-off stream. `ip` is the client
/// address the master resolved, not the TCP peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddr {
    pub ip: String,
    pub tls: bool,
}

impl Connected<IncomingStream<'_, HandoffListener>> for ClientAddr {
    fn connect_info(stream: IncomingStream<'_, HandoffListener>) -> Self {
        stream.remote_addr().clone()
    }
}

/// Listener whose "accepts" are connections handed off by the master.
pub struct HandoffListener {
    incoming: mpsc::Receiver<(ClientStream, ClientAddr)>,
}

impl HandoffListener {
    pub fn new(capacity: usize) -> (mpsc::Sender<(ClientStream, ClientAddr)>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { incoming: rx })
    }
}

impl Listener for HandoffListener {
    type Io = ClientStream;
    type Addr = ClientAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(conn) => conn,
            // The feeding side is gone; never yield another connection.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(ClientAddr {
            ip: "handoff".to_string(),
            tls: false,
        })
    }
}

// ── WebSocket sessions ─────────────────────────────────────────────────

struct TransportState {
    events: mpsc::UnboundedSender<WorkerEvent>,
}

pub fn router(events: mpsc::UnboundedSender<WorkerEvent>) -> Router {
    Router::new()
        .route("/socket", get(ws_upgrade))
        .with_state(Arc::new(TransportState { events }))
}

/// Serve the client transport on handed-off connections until the listener
/// is dropped.
pub async fn serve(listener: HandoffListener, events: mpsc::UnboundedSender<WorkerEvent>) -> io::Result<()> {
    axum::serve(
        listener,
        router(events).into_make_service_with_connect_info::<ClientAddr>(),
    )
    .await
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<ClientAddr>,
    State(state): State<Arc<TransportState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, addr, state.events.clone()))
}

/// Turn one inbound text frame into a routing event. Malformed frames are
/// dropped.
pub fn intercept(socket_id: &str, text: &str) -> Option<WorkerEvent> {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => Some(WorkerEvent::SocketEvent {
            socket_id: socket_id.to_string(),
            event: frame.event,
            args: frame.args,
        }),
        Err(e) => {
            tracing::debug!(socket = %socket_id, "Dropping malformed client frame: {e}");
            None
        }
    }
}

async fn client_session(mut socket: WebSocket, addr: ClientAddr, events: mpsc::UnboundedSender<WorkerEvent>) {
    let socket_id = ids::socket_id();
    let (outbox_tx, mut outbox) = mpsc::channel(OUTBOX_CAPACITY);
    let client = ClientSocket::new(socket_id.clone(), addr.ip.clone(), None, outbox_tx);
    if events.send(WorkerEvent::SocketConnected(client)).is_err() {
        return;
    }
    tracing::debug!(socket = %socket_id, ip = %addr.ip, tls = addr.tls, "WebSocket session started");

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(event) = intercept(&socket_id, text.as_str()) {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        tracing::debug!(socket = %socket_id, "Ignoring binary frame");
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Ping/Pong handled by axum
                    Some(Err(_)) => break,
                }
            }
            cmd = outbox.recv() => {
                match cmd {
                    Some(ClientCommand::Emit(frame)) => {
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::warn!(socket = %socket_id, "Client frame serialize error: {e}");
                                continue;
                            }
                        };
                        match tokio::time::timeout(WS_SEND_TIMEOUT, socket.send(WsMessage::Text(json.into()))).await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) | Err(_) => {
                                tracing::debug!(socket = %socket_id, "WebSocket send failed or timed out, closing");
                                break;
                            }
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => {
                        let _ = socket.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    let _ = events.send(WorkerEvent::SocketDisconnected { socket_id });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intercept_turns_frames_into_socket_events() {
        match intercept("s1", r#"{"event":"chatMsg","args":[{"msg":"hi"}]}"#) {
            Some(WorkerEvent::SocketEvent { socket_id, event, args }) => {
                assert_eq!(socket_id, "s1");
                assert_eq!(event, "chatMsg");
                assert_eq!(args, vec![serde_json::json!({"msg": "hi"})]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn intercept_drops_malformed_frames() {
        assert!(intercept("s1", "not json").is_none());
        assert!(intercept("s1", r#"{"args":[]}"#).is_none());
    }
}
