//! WebSocket text protocol message definitions
//! These are the JSON control messages exchanged beside the binary frames

use serde::{Deserialize, Serialize};

/// WebSocket close codes used by the server
pub mod close_code {
    /// Intentional server-side disconnect
    pub const NORMAL: u16 = 1000;
    /// Idle timeout or server shutdown
    pub const GOING_AWAY: u16 = 1001;
    /// Malformed join request
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Unexpected failure while handling the join
    pub const SERVER_ERROR: u16 = 1011;
    /// No room could admit the player right now
    pub const TRY_AGAIN_LATER: u16 = 1013;
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Client tab lost focus; simulation should stop applying its input
    Pause,

    /// Client is back
    Resume,

    /// Application-level latency probe
    Ping {
        /// Client timestamp, echoed back
        t: u64,
    },

    /// Any other message type; ignored
    #[serde(other)]
    Unknown,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Handshake completion after the player was placed in a room
    JoinSuccess {
        user_id: String,
        player_name: String,
        room_id: String,
        capacity: usize,
        /// Players in the room including this one
        player_count: usize,
        server_time: u64,
        debug: bool,
    },

    /// The server is closing this connection on purpose
    Disconnect { reason: String },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },

    /// Connection statistics, sent to debug clients once per stats window
    NetStats { payload: NetStats },
}

/// Published per-connection statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetStats {
    /// Frames received during the last window
    pub packets_per_sec: u64,
    /// Bytes received during the last window
    pub bytes_per_sec: u64,
    /// Frames dropped (malformed, unknown, rate limited) during the last window
    pub dropped_per_sec: u64,
    pub total_bytes: u64,
    /// Number of completed stats windows
    pub total_seconds: u64,
    /// Smoothed inter-arrival jitter in milliseconds (debug connections only)
    pub jitter_ms: f64,
    /// Smoothed round-trip time from transport pings
    pub rtt_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_messages() {
        let pause: ClientMsg = serde_json::from_str(r#"{"type":"pause"}"#).unwrap();
        assert_eq!(pause, ClientMsg::Pause);

        let resume: ClientMsg = serde_json::from_str(r#"{"type":"resume"}"#).unwrap();
        assert_eq!(resume, ClientMsg::Resume);

        let ping: ClientMsg = serde_json::from_str(r#"{"type":"ping","t":17}"#).unwrap();
        assert_eq!(ping, ClientMsg::Ping { t: 17 });
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"emote","payload":{"id":3}}"#).unwrap();
        assert_eq!(msg, ClientMsg::Unknown);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(serde_json::from_str::<ClientMsg>("{not json").is_err());
        assert!(serde_json::from_str::<ClientMsg>(r#"{"kind":"pause"}"#).is_err());
    }

    #[test]
    fn test_server_messages_are_flat_tagged() {
        let json = serde_json::to_value(ServerMsg::Disconnect {
            reason: "superseded".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "disconnect");
        assert_eq!(json["reason"], "superseded");

        let json = serde_json::to_value(ServerMsg::NetStats {
            payload: NetStats {
                packets_per_sec: 60,
                ..Default::default()
            },
        })
        .unwrap();
        assert_eq!(json["type"], "net_stats");
        assert_eq!(json["payload"]["packets_per_sec"], 60);
    }
}
