//! Wire formats.
//!
//! Three links carry structured messages:
//!
//! - **master → worker**: one [`HandoffMessage`] per handed-off connection,
//!   sent alongside the connection's file descriptor.
//! - **client ↔ worker**: [`ClientFrame`] JSON text frames on the WebSocket.
//! - **worker ↔ backend**: newline-delimited JSON tagged by `action`
//!   ([`FrontendFrame`] outbound, [`BackendFrame`] inbound).
//!
//! ```json
//! {"action":"socketConnect","socketId":"01J...","nodeId":"frontend-0-9f2c","ip":"1.2.3.4"}
//! {"action":"socketFrame","socketId":"01J...","event":"chatMsg","args":[{"msg":"hi"}]}
//! {"action":"socketJoinRooms","socketId":"01J...","rooms":["lobby"]}
//! ```

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-level control event that binds a socket to a channel.
pub const JOIN_CHANNEL: &str = "joinChannel";

/// Message from the master describing a handed-off connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HandoffMessage {
    #[serde(rename = "connection")]
    Connection {
        /// Base64 of the bytes the master consumed while sniffing headers.
        #[serde(rename = "initialData")]
        initial_data: String,
        #[serde(rename = "realIP")]
        real_ip: String,
        #[serde(rename = "tlsConnection")]
        tls_connection: bool,
    },
}

impl HandoffMessage {
    pub fn connection(initial_data: &[u8], real_ip: String, tls_connection: bool) -> Self {
        Self::Connection {
            initial_data: base64::engine::general_purpose::STANDARD.encode(initial_data),
            real_ip,
            tls_connection,
        }
    }

    /// Decode the consumed bytes that must be replayed in front of the stream.
    pub fn initial_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match self {
            Self::Connection { initial_data, .. } => {
                base64::engine::general_purpose::STANDARD.decode(initial_data)
            }
        }
    }
}

/// An event on the client WebSocket, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Identity attached to a socket by an authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(default)]
    pub rank: i32,
}

/// Frames the frontend sends to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum FrontendFrame {
    #[serde(rename = "socketConnect")]
    SocketConnect {
        #[serde(rename = "socketId")]
        socket_id: String,
        #[serde(rename = "nodeId")]
        node_id: String,
        ip: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<Identity>,
    },
    #[serde(rename = "socketDisconnect")]
    SocketDisconnect {
        #[serde(rename = "socketId")]
        socket_id: String,
    },
    #[serde(rename = "socketFrame")]
    SocketFrame {
        #[serde(rename = "socketId")]
        socket_id: String,
        event: String,
        args: Vec<Value>,
    },
}

/// Frames a backend sends to the frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum BackendFrame {
    /// Add a socket to transport-level broadcast groups.
    #[serde(rename = "socketJoinRooms")]
    SocketJoinRooms {
        #[serde(rename = "socketId")]
        socket_id: String,
        rooms: Vec<String>,
    },
    #[serde(rename = "socketLeaveRooms")]
    SocketLeaveRooms {
        #[serde(rename = "socketId")]
        socket_id: String,
        rooms: Vec<String>,
    },
    /// Deliver one event to one socket.
    #[serde(rename = "socketEmit")]
    SocketEmit {
        #[serde(rename = "socketId")]
        socket_id: String,
        event: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Deliver one event to every local member of a room.
    #[serde(rename = "roomEmit")]
    RoomEmit {
        room: String,
        event: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Disconnect a socket (e.g. kicked or banned by channel logic).
    #[serde(rename = "kickSocket")]
    KickSocket {
        #[serde(rename = "socketId")]
        socket_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handoff_message_uses_documented_field_names() {
        let msg = HandoffMessage::connection(b"GET / HTTP/1.1\r\n", "1.2.3.4".into(), true);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "connection");
        assert_eq!(value["realIP"], "1.2.3.4");
        assert_eq!(value["tlsConnection"], true);
        assert_eq!(value["initialData"], "R0VUIC8gSFRUUC8xLjENCg==");
        assert_eq!(msg.initial_bytes().unwrap(), b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn unknown_handoff_type_is_rejected() {
        let raw = r#"{"type":"shutdown"}"#;
        assert!(serde_json::from_str::<HandoffMessage>(raw).is_err());
    }

    #[test]
    fn socket_connect_omits_missing_identity() {
        let frame = FrontendFrame::SocketConnect {
            socket_id: "s1".into(),
            node_id: "n1".into(),
            ip: "1.2.3.4".into(),
            identity: None,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"action": "socketConnect", "socketId": "s1", "nodeId": "n1", "ip": "1.2.3.4"})
        );
    }

    #[test]
    fn backend_frames_parse_from_wire() {
        let frame: BackendFrame =
            serde_json::from_str(r#"{"action":"socketJoinRooms","socketId":"s1","rooms":["a","b"]}"#)
                .unwrap();
        assert_eq!(
            frame,
            BackendFrame::SocketJoinRooms {
                socket_id: "s1".into(),
                rooms: vec!["a".into(), "b".into()],
            }
        );

        let frame: BackendFrame =
            serde_json::from_str(r#"{"action":"roomEmit","room":"a","event":"chatMsg"}"#).unwrap();
        assert!(matches!(frame, BackendFrame::RoomEmit { ref args, .. } if args.is_empty()));
    }

    #[test]
    fn client_frame_args_default_to_empty() {
        let frame: ClientFrame = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(frame.event, "ping");
        assert!(frame.args.is_empty());
    }
}
