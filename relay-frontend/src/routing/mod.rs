//! Worker-side routing core.
//!
//! All routing state (sockets, channels, backend links) is owned by one
//! [`FrontendNode`] task that drains a single event queue. Everything
//! asynchronous (socket I/O, backend links, store lookups, heartbeats) runs
//! in its own task and reports back through [`WorkerEvent`]s, so the core
//! never awaits while holding state and needs no locks.

pub mod backend;
pub mod channel;
pub mod channel_manager;
pub mod socket_manager;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{BackendFrame, ClientFrame};
use crate::store::liveness::LivenessSignal;
use crate::store::resolver::{ChannelResolver, ResolveError};
use channel_manager::ChannelManager;
use socket_manager::{ClientSocket, SocketManager, SocketOutcome};

#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    /// The worker cannot make progress and must exit with the fatal code.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Everything the routing core reacts to.
#[derive(Debug)]
pub enum WorkerEvent {
    SocketConnected(ClientSocket),
    SocketEvent {
        socket_id: String,
        event: String,
        args: Vec<Value>,
    },
    SocketDisconnected {
        socket_id: String,
    },
    ChannelResolved {
        name: String,
        result: Result<String, ResolveError>,
    },
    BackendFrame {
        address: String,
        connection_id: u64,
        frame: BackendFrame,
    },
    BackendClosed {
        address: String,
        connection_id: u64,
    },
    Liveness(LivenessSignal),
}

pub struct FrontendNode {
    node_id: String,
    sockets: SocketManager,
    channels: ChannelManager,
}

impl FrontendNode {
    pub fn new(
        node_id: impl Into<String>,
        resolver: Arc<dyn ChannelResolver>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        fatal_on_no_backend: bool,
    ) -> Self {
        let node_id = node_id.into();
        Self {
            channels: ChannelManager::new(node_id.clone(), resolver, events, fatal_on_no_backend),
            sockets: SocketManager::new(),
            node_id,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn sockets(&self) -> &SocketManager {
        &self.sockets
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    /// Drain `events` until a fatal error occurs or every sender is gone.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<WorkerEvent>) -> Result<(), FrontendError> {
        tracing::info!(node = %self.node_id, "Routing core started");
        while let Some(event) = events.recv().await {
            self.handle(event)?;
        }
        Ok(())
    }

    pub fn handle(&mut self, event: WorkerEvent) -> Result<(), FrontendError> {
        match event {
            WorkerEvent::SocketConnected(socket) => self.sockets.on_connection(socket),
            WorkerEvent::SocketEvent { socket_id, event, args } => {
                self.on_socket_event(&socket_id, event, args);
            }
            WorkerEvent::SocketDisconnected { socket_id } => self.on_socket_disconnected(&socket_id),
            WorkerEvent::ChannelResolved { name, result } => {
                return self.channels.on_channel_resolved(&mut self.sockets, &name, result);
            }
            WorkerEvent::BackendFrame { address, connection_id, frame } => {
                if self.channels.is_current_backend(&address, connection_id) {
                    self.on_backend_frame(frame);
                } else {
                    tracing::debug!(backend = %address, conn = connection_id, "Dropping frame from a released link");
                }
            }
            WorkerEvent::BackendClosed { address, connection_id } => {
                self.channels
                    .on_backend_disconnect(&mut self.sockets, &address, connection_id);
            }
            WorkerEvent::Liveness(signal) => self.on_liveness(signal),
        }
        Ok(())
    }

    fn on_socket_event(&mut self, socket_id: &str, event: String, args: Vec<Value>) {
        match self.sockets.on_event(socket_id, event, args) {
            SocketOutcome::JoinRequested { name } => {
                self.channels
                    .on_socket_join_channel(&mut self.sockets, socket_id, &name);
            }
            SocketOutcome::Forward { channel, event, args } => {
                self.channels.on_socket_event(&channel, socket_id, event, args);
            }
            SocketOutcome::Buffered | SocketOutcome::Ignored => {}
        }
    }

    fn on_socket_disconnected(&mut self, socket_id: &str) {
        let Some(socket) = self.sockets.on_disconnect(socket_id) else {
            return;
        };
        if let Some(channel) = socket.channel {
            self.channels.on_socket_disconnect(&channel, socket_id);
        }
    }

    fn on_backend_frame(&mut self, frame: BackendFrame) {
        match frame {
            BackendFrame::SocketJoinRooms { socket_id, rooms } => {
                self.sockets.on_socket_join_rooms(&socket_id, rooms);
            }
            BackendFrame::SocketLeaveRooms { socket_id, rooms } => {
                self.sockets.on_socket_leave_rooms(&socket_id, rooms);
            }
            BackendFrame::SocketEmit { socket_id, event, args } => {
                self.sockets.emit_to_socket(&socket_id, ClientFrame { event, args });
            }
            BackendFrame::RoomEmit { room, event, args } => {
                let delivered = self.sockets.emit_to_room(&room, &ClientFrame { event, args });
                tracing::trace!(%room, delivered, "Room emit");
            }
            BackendFrame::KickSocket { socket_id } => {
                if self.sockets.kick(&socket_id) {
                    tracing::info!(socket = %socket_id, "Socket kicked by backend");
                }
            }
        }
    }

    fn on_liveness(&mut self, signal: LivenessSignal) {
        match signal {
            LivenessSignal::Renewed | LivenessSignal::SoftTimeout => self.channels.renew_ownership(),
            LivenessSignal::HardTimeout => {
                let count = self.sockets.disconnect_all();
                tracing::error!(node = %self.node_id, count, "Lost the coordination store, disconnecting all sockets");
            }
        }
    }
}
