//! Pooled links to channel backends.
//!
//! At most one live connection exists per backend address. Channels hosted
//! on the same backend share it. Each link is a TCP stream carrying
//! newline-delimited JSON: [`FrontendFrame`]s out, [`BackendFrame`]s in.
//!
//! Frames sent while the link is still connecting are queued and written
//! once it is up. When a link ends for any reason other than an explicit
//! [`BackendConnectionManager::disconnect`], the routing core receives
//! [`WorkerEvent::BackendClosed`] so it can tear down the channels on it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::WorkerEvent;
use crate::protocol::{BackendFrame, FrontendFrame};

enum Outbound {
    Frame(FrontendFrame),
    /// Flush everything queued before this, then close.
    Close,
}

/// Handle to one backend link.
#[derive(Debug)]
pub struct BackendConnection {
    id: u64,
    address: String,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl BackendConnection {
    /// Distinguishes successive links to the same address.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Queue a frame for the backend. Returns false once the link is gone.
    pub fn send(&self, frame: FrontendFrame) -> bool {
        self.outbound.send(Outbound::Frame(frame)).is_ok()
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

pub struct BackendConnectionManager {
    connections: HashMap<String, Arc<BackendConnection>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    next_id: u64,
}

impl BackendConnectionManager {
    pub fn new(events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            connections: HashMap::new(),
            events,
            next_id: 1,
        }
    }

    /// Return the pooled link for `address`, opening one if needed.
    pub fn connect(&mut self, address: &str) -> Arc<BackendConnection> {
        if let Some(conn) = self.connections.get(address) {
            return conn.clone();
        }
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(BackendConnection {
            id,
            address: address.to_string(),
            outbound: tx,
        });
        tokio::spawn(run_link(id, address.to_string(), rx, self.events.clone()));
        tracing::info!(backend = %address, conn = id, "Opening backend connection");
        self.connections.insert(address.to_string(), conn.clone());
        conn
    }

    /// Release a link that no channel uses any more.
    pub fn disconnect(&mut self, conn: &BackendConnection) {
        if self.is_current(conn.address(), conn.id()) {
            self.connections.remove(conn.address());
        }
        conn.close();
        tracing::info!(backend = %conn.address(), conn = conn.id(), "Released backend connection");
    }

    /// Forget a link that closed on its own. Returns false if the event
    /// refers to a link that was already released or replaced.
    pub fn forget_closed(&mut self, address: &str, id: u64) -> bool {
        if !self.is_current(address, id) {
            return false;
        }
        self.connections.remove(address);
        true
    }

    fn is_current(&self, address: &str, id: u64) -> bool {
        self.connections.get(address).is_some_and(|c| c.id() == id)
    }

    pub fn get(&self, address: &str) -> Option<&Arc<BackendConnection>> {
        self.connections.get(address)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// A link with no network behind it, for exercising channel bookkeeping.
#[cfg(test)]
pub(crate) fn tapped_connection(id: u64, address: &str) -> (Arc<BackendConnection>, Tap) {
    let (tx, rx) = mpsc::unbounded_channel();
    let conn = Arc::new(BackendConnection {
        id,
        address: address.to_string(),
        outbound: tx,
    });
    (conn, Tap(rx))
}

#[cfg(test)]
pub(crate) struct Tap(mpsc::UnboundedReceiver<Outbound>);

#[cfg(test)]
impl Tap {
    /// Frames queued so far.
    pub(crate) fn frames(&mut self) -> Vec<FrontendFrame> {
        let mut out = Vec::new();
        while let Ok(item) = self.0.try_recv() {
            if let Outbound::Frame(frame) = item {
                out.push(frame);
            }
        }
        out
    }
}

/// Drive one backend link until either direction ends.
async fn run_link(
    id: u64,
    address: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let stream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(backend = %address, conn = id, "Backend connect failed: {e}");
            let _ = events.send(WorkerEvent::BackendClosed { address, connection_id: id });
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    tracing::info!(backend = %address, conn = id, "Backend link established");
    let (reader, mut writer) = stream.into_split();

    // Read JSON lines from the backend.
    let read_address = address.clone();
    let read_events = events.clone();
    let mut read_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut msg_count: u64 = 0;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<BackendFrame>(&line) {
                    Ok(frame) => {
                        msg_count += 1;
                        let event = WorkerEvent::BackendFrame {
                            address: read_address.clone(),
                            connection_id: id,
                            frame,
                        };
                        if read_events.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(backend = %read_address, "Backend sent invalid frame: {e}, line: {}", line.chars().take(200).collect::<String>());
                    }
                },
                Ok(None) => {
                    tracing::info!(backend = %read_address, "Backend read EOF after {msg_count} messages");
                    break;
                }
                Err(e) => {
                    tracing::warn!(backend = %read_address, "Backend read error after {msg_count} messages: {e}");
                    break;
                }
            }
        }
    });

    // Write JSON lines to the backend.
    let write_address = address.clone();
    let mut write_handle = tokio::spawn(async move {
        while let Some(item) = outbound.recv().await {
            let frame = match item {
                Outbound::Frame(frame) => frame,
                Outbound::Close => break,
            };
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    let line = format!("{json}\n");
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        tracing::warn!(backend = %write_address, "Backend write error: {e}");
                        return;
                    }
                }
                Err(e) => tracing::warn!(backend = %write_address, "Frame serialize error: {e}"),
            }
        }
        let _ = writer.shutdown().await;
    });

    let which = tokio::select! {
        _ = &mut read_handle => "read",
        _ = &mut write_handle => "write",
    };
    read_handle.abort();
    write_handle.abort();
    tracing::info!(backend = %address, conn = id, side = which, "Backend link ended");
    let _ = events.send(WorkerEvent::BackendClosed { address, connection_id: id });
}
