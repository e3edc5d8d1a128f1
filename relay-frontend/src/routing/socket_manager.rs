//! Client sockets held by this worker.
//!
//! A socket is bound to at most one channel. Until that binding exists,
//! ordinary events are buffered on the socket in arrival order; the channel
//! flushes them right after announcing the socket to its backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{ClientFrame, Identity, JOIN_CHANNEL};

/// Allowed channel names: 1 to 30 ASCII word characters or `-`.
static CHANNEL_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,30}$").ok());

/// Events a socket may send before its channel binding completes. Going
/// past this disconnects the socket.
pub const PENDING_FRAME_LIMIT: usize = 256;

pub fn is_valid_channel_name(name: &str) -> bool {
    CHANNEL_NAME.as_ref().is_some_and(|re| re.is_match(name))
}

/// Commands from the routing core to a socket's transport task.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Emit(ClientFrame),
    Disconnect,
}

/// An event received before the socket was bound to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFrame {
    pub event: String,
    pub args: Vec<Value>,
}

#[derive(Debug)]
pub struct ClientSocket {
    pub id: String,
    pub ip: String,
    pub identity: Option<Identity>,
    /// Channel this socket is bound to.
    pub channel: Option<String>,
    /// A join is in flight; further joins are ignored.
    pub pending_join: bool,
    pub pending_frames: VecDeque<PendingFrame>,
    pub rooms: HashSet<String>,
    /// A disconnect has been requested; further events are ignored.
    pub closing: bool,
    outbox: mpsc::Sender<ClientCommand>,
}

impl ClientSocket {
    pub fn new(
        id: impl Into<String>,
        ip: impl Into<String>,
        identity: Option<Identity>,
        outbox: mpsc::Sender<ClientCommand>,
    ) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            identity,
            channel: None,
            pending_join: false,
            pending_frames: VecDeque::new(),
            rooms: HashSet::new(),
            closing: false,
            outbox,
        }
    }

    /// Queue an event for the client. Returns false if the client is gone or
    /// not keeping up.
    pub fn emit(&self, frame: ClientFrame) -> bool {
        match self.outbox.try_send(ClientCommand::Emit(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(socket = %self.id, "Client outbox full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the transport to close the connection.
    pub fn force_disconnect(&mut self) {
        self.closing = true;
        // A full outbox means the client is stuck; dropping the command would
        // leave it connected, so fall back to a detached send.
        if let Err(mpsc::error::TrySendError::Full(cmd)) = self.outbox.try_send(ClientCommand::Disconnect) {
            let outbox = self.outbox.clone();
            tokio::spawn(async move {
                let _ = outbox.send(cmd).await;
            });
        }
    }
}

/// What the routing core must do with a client event.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketOutcome {
    /// Nothing to do (unknown socket, invalid or redundant join).
    Ignored,
    /// Held on the socket until its channel binding completes.
    Buffered,
    /// Start joining `name`; the socket is now marked pending.
    JoinRequested { name: String },
    /// Relay to the socket's bound channel.
    Forward {
        channel: String,
        event: String,
        args: Vec<Value>,
    },
}

#[derive(Debug, Default)]
pub struct SocketManager {
    sockets: HashMap<String, ClientSocket>,
    rooms: HashMap<String, HashSet<String>>,
}

impl SocketManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connection(&mut self, socket: ClientSocket) {
        tracing::debug!(socket = %socket.id, ip = %socket.ip, "Client socket connected");
        self.sockets.insert(socket.id.clone(), socket);
    }

    /// Classify an inbound client event.
    pub fn on_event(&mut self, socket_id: &str, event: String, args: Vec<Value>) -> SocketOutcome {
        let Some(socket) = self.sockets.get_mut(socket_id) else {
            tracing::debug!(socket = %socket_id, %event, "Event from unknown socket");
            return SocketOutcome::Ignored;
        };
        if socket.closing {
            tracing::debug!(socket = %socket_id, %event, "Event from a closing socket");
            return SocketOutcome::Ignored;
        }

        if event == JOIN_CHANNEL {
            if socket.channel.is_some() || socket.pending_join {
                tracing::debug!(socket = %socket_id, "Ignoring repeated joinChannel");
                return SocketOutcome::Ignored;
            }
            let name = args
                .first()
                .and_then(|data| data.get("name"))
                .and_then(Value::as_str);
            return match name {
                Some(name) if is_valid_channel_name(name) => {
                    socket.pending_join = true;
                    SocketOutcome::JoinRequested { name: name.to_string() }
                }
                _ => {
                    tracing::debug!(socket = %socket_id, "Rejected joinChannel with invalid name");
                    SocketOutcome::Ignored
                }
            };
        }

        if let Some(channel) = &socket.channel {
            return SocketOutcome::Forward {
                channel: channel.clone(),
                event,
                args,
            };
        }
        if socket.pending_frames.len() >= PENDING_FRAME_LIMIT {
            tracing::warn!(socket = %socket_id, limit = PENDING_FRAME_LIMIT, "Too many events before channel join, disconnecting");
            socket.force_disconnect();
            return SocketOutcome::Ignored;
        }
        socket.pending_frames.push_back(PendingFrame { event, args });
        SocketOutcome::Buffered
    }

    /// Remove a socket, returning it so its channel can be notified.
    pub fn on_disconnect(&mut self, socket_id: &str) -> Option<ClientSocket> {
        let socket = self.sockets.remove(socket_id)?;
        for room in &socket.rooms {
            self.remove_from_room(room, socket_id);
        }
        tracing::debug!(socket = %socket_id, "Client socket disconnected");
        Some(socket)
    }

    pub fn on_socket_join_rooms(&mut self, socket_id: &str, rooms: Vec<String>) {
        let Some(socket) = self.sockets.get_mut(socket_id) else {
            tracing::debug!(socket = %socket_id, "socketJoinRooms for unknown socket");
            return;
        };
        for room in rooms {
            if socket.rooms.insert(room.clone()) {
                self.rooms.entry(room).or_default().insert(socket_id.to_string());
            }
        }
    }

    pub fn on_socket_leave_rooms(&mut self, socket_id: &str, rooms: Vec<String>) {
        let Some(socket) = self.sockets.get_mut(socket_id) else {
            tracing::debug!(socket = %socket_id, "socketLeaveRooms for unknown socket");
            return;
        };
        let left: Vec<String> = rooms.into_iter().filter(|r| socket.rooms.remove(r)).collect();
        for room in &left {
            self.remove_from_room(room, socket_id);
        }
    }

    fn remove_from_room(&mut self, room: &str, socket_id: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(socket_id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    pub fn emit_to_socket(&self, socket_id: &str, frame: ClientFrame) -> bool {
        match self.sockets.get(socket_id) {
            Some(socket) => socket.emit(frame),
            None => false,
        }
    }

    /// Deliver `frame` to every local member of `room`. Returns the number of
    /// sockets it was queued for.
    pub fn emit_to_room(&self, room: &str, frame: &ClientFrame) -> usize {
        let Some(members) = self.rooms.get(room) else {
            return 0;
        };
        members
            .iter()
            .filter_map(|id| self.sockets.get(id))
            .filter(|socket| socket.emit(frame.clone()))
            .count()
    }

    pub fn kick(&mut self, socket_id: &str) -> bool {
        match self.sockets.get_mut(socket_id) {
            Some(socket) => {
                socket.force_disconnect();
                true
            }
            None => false,
        }
    }

    /// Force-disconnect every socket. Returns how many were told to close.
    pub fn disconnect_all(&mut self) -> usize {
        for socket in self.sockets.values_mut() {
            socket.force_disconnect();
        }
        self.sockets.len()
    }

    pub fn get(&self, socket_id: &str) -> Option<&ClientSocket> {
        self.sockets.get(socket_id)
    }

    pub fn get_mut(&mut self, socket_id: &str) -> Option<&mut ClientSocket> {
        self.sockets.get_mut(socket_id)
    }

    pub fn room_members(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, HashSet::len)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn socket(id: &str) -> (ClientSocket, mpsc::Receiver<ClientCommand>) {
        let (tx, rx) = mpsc::channel(8);
        (ClientSocket::new(id, "1.2.3.4", None, tx), rx)
    }

    fn join(name: &str) -> (String, Vec<Value>) {
        (JOIN_CHANNEL.to_string(), vec![json!({ "name": name })])
    }

    #[test]
    fn channel_names_are_ascii_word_characters() {
        assert!(is_valid_channel_name("lobby"));
        assert!(is_valid_channel_name("my-chan_2"));
        assert!(is_valid_channel_name(&"a".repeat(30)));
        assert!(!is_valid_channel_name(""));
        assert!(!is_valid_channel_name(&"a".repeat(31)));
        assert!(!is_valid_channel_name("has space"));
        assert!(!is_valid_channel_name("café"));
        assert!(!is_valid_channel_name("../etc"));
    }

    #[test]
    fn events_before_join_are_buffered_in_order() {
        let mut sockets = SocketManager::new();
        let (s, _rx) = socket("s1");
        sockets.on_connection(s);

        assert_eq!(sockets.on_event("s1", "a".into(), vec![json!(1)]), SocketOutcome::Buffered);
        assert_eq!(sockets.on_event("s1", "b".into(), vec![]), SocketOutcome::Buffered);

        let pending: Vec<_> = sockets.get("s1").unwrap().pending_frames.iter().map(|f| f.event.clone()).collect();
        assert_eq!(pending, ["a", "b"]);
    }

    #[test]
    fn join_marks_pending_and_repeat_join_is_ignored() {
        let mut sockets = SocketManager::new();
        let (s, _rx) = socket("s1");
        sockets.on_connection(s);

        let (event, args) = join("lobby");
        assert_eq!(
            sockets.on_event("s1", event.clone(), args.clone()),
            SocketOutcome::JoinRequested { name: "lobby".into() }
        );
        assert!(sockets.get("s1").unwrap().pending_join);
        assert_eq!(sockets.on_event("s1", event, args), SocketOutcome::Ignored);
    }

    #[test]
    fn invalid_join_is_ignored_without_pending() {
        let mut sockets = SocketManager::new();
        let (s, _rx) = socket("s1");
        sockets.on_connection(s);

        let (event, args) = join("no spaces allowed");
        assert_eq!(sockets.on_event("s1", event, args), SocketOutcome::Ignored);
        assert_eq!(sockets.on_event("s1", JOIN_CHANNEL.into(), vec![]), SocketOutcome::Ignored);
        assert_eq!(
            sockets.on_event("s1", JOIN_CHANNEL.into(), vec![json!({ "name": 5 })]),
            SocketOutcome::Ignored
        );
        assert!(!sockets.get("s1").unwrap().pending_join);
    }

    #[test]
    fn bound_socket_forwards_to_channel() {
        let mut sockets = SocketManager::new();
        let (s, _rx) = socket("s1");
        sockets.on_connection(s);
        sockets.get_mut("s1").unwrap().channel = Some("lobby".into());

        assert_eq!(
            sockets.on_event("s1", "chatMsg".into(), vec![json!({"msg": "hi"})]),
            SocketOutcome::Forward {
                channel: "lobby".into(),
                event: "chatMsg".into(),
                args: vec![json!({"msg": "hi"})],
            }
        );
        let (event, args) = join("other");
        assert_eq!(sockets.on_event("s1", event, args), SocketOutcome::Ignored);
    }

    #[test]
    fn unknown_socket_events_are_ignored() {
        let mut sockets = SocketManager::new();
        assert_eq!(sockets.on_event("ghost", "x".into(), vec![]), SocketOutcome::Ignored);
    }

    #[test]
    fn rooms_track_membership_and_clean_up_on_disconnect() {
        let mut sockets = SocketManager::new();
        let (a, mut rx_a) = socket("a");
        let (b, mut rx_b) = socket("b");
        sockets.on_connection(a);
        sockets.on_connection(b);

        sockets.on_socket_join_rooms("a", vec!["r".into()]);
        sockets.on_socket_join_rooms("b", vec!["r".into(), "s".into()]);
        assert_eq!(sockets.room_members("r"), 2);

        let frame = ClientFrame { event: "hello".into(), args: vec![] };
        assert_eq!(sockets.emit_to_room("r", &frame), 2);
        assert_eq!(rx_a.try_recv().unwrap(), ClientCommand::Emit(frame.clone()));
        assert_eq!(rx_b.try_recv().unwrap(), ClientCommand::Emit(frame.clone()));

        sockets.on_socket_leave_rooms("a", vec!["r".into()]);
        assert_eq!(sockets.room_members("r"), 1);

        sockets.on_disconnect("b");
        assert_eq!(sockets.room_members("r"), 0);
        assert_eq!(sockets.room_members("s"), 0);
        assert_eq!(sockets.emit_to_room("r", &frame), 0);
    }

    #[test]
    fn join_rooms_for_missing_socket_is_a_no_op() {
        let mut sockets = SocketManager::new();
        sockets.on_socket_join_rooms("ghost", vec!["r".into()]);
        assert_eq!(sockets.room_members("r"), 0);
    }

    #[test]
    fn kick_sends_disconnect() {
        let mut sockets = SocketManager::new();
        let (s, mut rx) = socket("s1");
        sockets.on_connection(s);
        assert!(sockets.kick("s1"));
        assert_eq!(rx.try_recv().unwrap(), ClientCommand::Disconnect);
        assert!(!sockets.kick("ghost"));
    }

    #[test]
    fn pre_join_buffer_is_capped() {
        let mut sockets = SocketManager::new();
        let (s, mut rx) = socket("s1");
        sockets.on_connection(s);

        for n in 0..PENDING_FRAME_LIMIT {
            assert_eq!(sockets.on_event("s1", format!("e{n}"), vec![]), SocketOutcome::Buffered);
        }
        assert_eq!(sockets.on_event("s1", "one-too-many".into(), vec![]), SocketOutcome::Ignored);

        let socket = sockets.get("s1").unwrap();
        assert_eq!(socket.pending_frames.len(), PENDING_FRAME_LIMIT);
        assert!(socket.closing);
        assert_eq!(rx.try_recv().unwrap(), ClientCommand::Disconnect);
    }

    #[test]
    fn kicked_socket_cannot_start_a_join() {
        let mut sockets = SocketManager::new();
        let (s, mut rx) = socket("s1");
        sockets.on_connection(s);
        assert!(sockets.kick("s1"));
        assert_eq!(rx.try_recv().unwrap(), ClientCommand::Disconnect);

        let (event, args) = join("lobby");
        assert_eq!(sockets.on_event("s1", event, args), SocketOutcome::Ignored);
        assert_eq!(sockets.on_event("s1", "chatMsg".into(), vec![]), SocketOutcome::Ignored);
        let socket = sockets.get("s1").unwrap();
        assert!(!socket.pending_join);
        assert!(socket.pending_frames.is_empty());
    }
}
