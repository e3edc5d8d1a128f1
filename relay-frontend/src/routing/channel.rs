//! A channel as seen from one worker: the local members and the backend
//! link that carries their traffic.

use std::sync::Arc;

use serde_json::{Value, json};

use super::backend::BackendConnection;
use super::socket_manager::{ClientSocket, SocketManager};
use crate::protocol::{FrontendFrame, JOIN_CHANNEL};

/// Whether a channel still has local members after a departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Occupied,
    Empty,
}

#[derive(Debug)]
pub struct Channel {
    name: String,
    node_id: String,
    connection: Arc<BackendConnection>,
    /// Local members in join order, without duplicates.
    members: Vec<String>,
}

impl Channel {
    pub fn new(name: impl Into<String>, node_id: impl Into<String>, connection: Arc<BackendConnection>) -> Self {
        Self {
            name: name.into(),
            node_id: node_id.into(),
            connection,
            members: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Arc<BackendConnection> {
        &self.connection
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Add a socket: announce it to the backend, replay the join, then flush
    /// whatever the socket sent while it was waiting.
    ///
    /// Returns false (and changes nothing) if the socket is already a member.
    pub fn on_socket_join(&mut self, socket: &mut ClientSocket) -> bool {
        if self.members.iter().any(|id| *id == socket.id) {
            tracing::error!(channel = %self.name, socket = %socket.id, "Socket is already a channel member");
            return false;
        }
        self.members.push(socket.id.clone());

        self.connection.send(FrontendFrame::SocketConnect {
            socket_id: socket.id.clone(),
            node_id: self.node_id.clone(),
            ip: socket.ip.clone(),
            identity: socket.identity.clone(),
        });
        self.connection.send(FrontendFrame::SocketFrame {
            socket_id: socket.id.clone(),
            event: JOIN_CHANNEL.to_string(),
            args: vec![json!({ "name": self.name })],
        });
        for pending in socket.pending_frames.drain(..) {
            self.connection.send(FrontendFrame::SocketFrame {
                socket_id: socket.id.clone(),
                event: pending.event,
                args: pending.args,
            });
        }
        tracing::debug!(channel = %self.name, socket = %socket.id, members = self.members.len(), "Socket joined channel");
        true
    }

    pub fn on_socket_event(&self, socket_id: &str, event: String, args: Vec<Value>) {
        self.connection.send(FrontendFrame::SocketFrame {
            socket_id: socket_id.to_string(),
            event,
            args,
        });
    }

    pub fn on_socket_disconnect(&mut self, socket_id: &str) -> Membership {
        let before = self.members.len();
        self.members.retain(|id| id != socket_id);
        if self.members.len() != before {
            self.connection.send(FrontendFrame::SocketDisconnect {
                socket_id: socket_id.to_string(),
            });
        } else {
            tracing::warn!(channel = %self.name, socket = %socket_id, "Disconnect for a socket that is not a member");
        }
        if self.members.is_empty() {
            Membership::Empty
        } else {
            Membership::Occupied
        }
    }

    /// The backend link died: unbind every member, then force them off.
    ///
    /// Members are unbound first so their disconnects do not route back into
    /// this (already discarded) channel.
    pub fn on_backend_disconnect(&mut self, sockets: &mut SocketManager) -> usize {
        let members = std::mem::take(&mut self.members);
        for id in &members {
            if let Some(socket) = sockets.get_mut(id) {
                socket.channel = None;
            }
        }
        for id in &members {
            sockets.kick(id);
        }
        tracing::warn!(channel = %self.name, backend = %self.connection.address(), count = members.len(), "Backend lost, disconnecting channel members");
        members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::backend::tapped_connection;
    use crate::routing::socket_manager::{ClientCommand, PendingFrame, SocketOutcome};
    use tokio::sync::mpsc;

    fn socket(id: &str) -> (ClientSocket, mpsc::Receiver<ClientCommand>) {
        let (tx, rx) = mpsc::channel(8);
        (ClientSocket::new(id, "1.2.3.4", None, tx), rx)
    }

    #[test]
    fn join_announces_then_replays_then_flushes() {
        let (conn, mut tap) = tapped_connection(1, "b:1");
        let mut channel = Channel::new("lobby", "node-1", conn);
        let (mut s, _rx) = socket("s1");
        s.pending_frames.push_back(PendingFrame { event: "a".into(), args: vec![json!(1)] });
        s.pending_frames.push_back(PendingFrame { event: "b".into(), args: vec![] });

        assert!(channel.on_socket_join(&mut s));
        assert!(s.pending_frames.is_empty());

        let frames = tap.frames();
        assert_eq!(frames.len(), 4);
        assert_eq!(
            frames[0],
            FrontendFrame::SocketConnect {
                socket_id: "s1".into(),
                node_id: "node-1".into(),
                ip: "1.2.3.4".into(),
                identity: None,
            }
        );
        assert_eq!(
            frames[1],
            FrontendFrame::SocketFrame {
                socket_id: "s1".into(),
                event: JOIN_CHANNEL.into(),
                args: vec![json!({ "name": "lobby" })],
            }
        );
        let events: Vec<_> = frames[2..]
            .iter()
            .map(|f| match f {
                FrontendFrame::SocketFrame { event, .. } => event.clone(),
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(events, ["a", "b"]);
    }

    #[test]
    fn duplicate_join_is_refused() {
        let (conn, mut tap) = tapped_connection(1, "b:1");
        let mut channel = Channel::new("lobby", "node-1", conn);
        let (mut s, _rx) = socket("s1");
        assert!(channel.on_socket_join(&mut s));
        tap.frames();
        assert!(!channel.on_socket_join(&mut s));
        assert_eq!(channel.members(), ["s1"]);
        assert!(tap.frames().is_empty());
    }

    #[test]
    fn last_departure_reports_empty() {
        let (conn, mut tap) = tapped_connection(1, "b:1");
        let mut channel = Channel::new("lobby", "node-1", conn);
        let (mut a, _ra) = socket("a");
        let (mut b, _rb) = socket("b");
        channel.on_socket_join(&mut a);
        channel.on_socket_join(&mut b);
        tap.frames();

        assert_eq!(channel.on_socket_disconnect("a"), Membership::Occupied);
        assert_eq!(channel.on_socket_disconnect("b"), Membership::Empty);
        assert_eq!(
            tap.frames(),
            vec![
                FrontendFrame::SocketDisconnect { socket_id: "a".into() },
                FrontendFrame::SocketDisconnect { socket_id: "b".into() },
            ]
        );
    }

    #[test]
    fn backend_loss_unbinds_before_kicking() {
        let (conn, _tap) = tapped_connection(1, "b:1");
        let mut channel = Channel::new("lobby", "node-1", conn);
        let mut sockets = SocketManager::new();
        let (a, mut rx_a) = socket("a");
        sockets.on_connection(a);
        let member = sockets.get_mut("a").unwrap();
        member.channel = Some("lobby".into());
        channel.on_socket_join(member);

        assert_eq!(channel.on_backend_disconnect(&mut sockets), 1);
        assert!(channel.is_empty());
        assert_eq!(sockets.get("a").unwrap().channel, None);
        assert_eq!(rx_a.try_recv().unwrap(), ClientCommand::Disconnect);

        // Unbound but on its way out: a join in that window goes nowhere.
        let outcome = sockets.on_event("a", JOIN_CHANNEL.into(), vec![json!({ "name": "lobby" })]);
        assert_eq!(outcome, SocketOutcome::Ignored);
        assert!(!sockets.get("a").unwrap().pending_join);
    }
}
