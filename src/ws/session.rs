//! Per-connection session loop
//!
//! One task per connection reads frames in order, feeds them to the room and
//! runs the connection's stats and heartbeat timers.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

use crate::config::Config;
use crate::game::Room;
use crate::ws::connection::{ConnectionHandle, Frame, Inbound, Outbound};
use crate::ws::protocol::{close_code, ClientMsg, ServerMsg};

/// Timers driving a session
#[derive(Debug, Clone)]
pub struct SessionTimers {
    pub stats_interval: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
}

impl From<&Config> for SessionTimers {
    fn from(config: &Config) -> Self {
        Self {
            stats_interval: config.stats_interval,
            heartbeat_interval: config.heartbeat_interval,
            idle_timeout: config.idle_timeout,
        }
    }
}

/// Why a session loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client sent a close frame
    PeerClosed,
    /// Stream ended without a close frame
    StreamEnded,
    TransportError,
    IdleTimeout,
    /// The server closed the connection (superseded, shutdown)
    ServerClosed,
}

/// Route one classified frame
pub fn dispatch(room: &Room, conn: &ConnectionHandle, inbound: Inbound) {
    let user_id = conn.user_id();
    match inbound {
        Inbound::Input(input) => room.handle_input(user_id, input),
        Inbound::Control(ClientMsg::Pause) => room.set_paused(user_id, true),
        Inbound::Control(ClientMsg::Resume) => room.set_paused(user_id, false),
        Inbound::Control(ClientMsg::Ping { t }) => {
            conn.send_text(&ServerMsg::Pong { t });
        }
        Inbound::Control(ClientMsg::Unknown) => {
            debug!(user_id = %user_id, "Ignoring unknown control message");
        }
        Inbound::Dropped => {}
    }
}

/// Read frames until the connection ends
pub async fn run_session<S>(
    room: &Room,
    conn: &ConnectionHandle,
    mut stream: S,
    timers: &SessionTimers,
) -> SessionEnd
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let start = Instant::now();
    let mut stats_tick = interval_at(start + timers.stats_interval, timers.stats_interval);
    let mut heartbeat = interval_at(start + timers.heartbeat_interval, timers.heartbeat_interval);

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    dispatch(room, conn, conn.on_frame(Frame::Binary(Bytes::from(data))));
                }
                Some(Ok(Message::Text(text))) => {
                    dispatch(room, conn, conn.on_frame(Frame::Text(text)));
                }
                Some(Ok(Message::Pong(payload))) => conn.record_pong(&payload),
                Some(Ok(Message::Ping(_))) => conn.touch(),
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        user_id = %conn.user_id(),
                        code = frame.as_ref().map(|f| f.code),
                        "Client initiated close"
                    );
                    conn.mark_peer_closed();
                    return SessionEnd::PeerClosed;
                }
                Some(Err(e)) => {
                    warn!(user_id = %conn.user_id(), error = %e, "WebSocket error");
                    return SessionEnd::TransportError;
                }
                None => return SessionEnd::StreamEnded,
            },
            _ = stats_tick.tick() => {
                let stats = conn.roll_stats();
                if conn.is_debug() {
                    conn.send_text(&ServerMsg::NetStats { payload: stats });
                }
            }
            _ = heartbeat.tick() => {
                if !conn.is_connected() {
                    return SessionEnd::ServerClosed;
                }
                if conn.idle_for() > timers.idle_timeout {
                    warn!(user_id = %conn.user_id(), room_id = %room.id(), "Connection idle, closing");
                    conn.close(close_code::GOING_AWAY, "idle timeout");
                    return SessionEnd::IdleTimeout;
                }
                conn.send_ping();
            }
        }
    }
}

/// Drain the outbound queue into the socket until a close frame is written
pub async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    user_id: String,
) {
    while let Some(frame) = outbound.recv().await {
        let closing = matches!(frame, Outbound::Close { .. });
        if let Err(e) = sink.send(to_message(frame)).await {
            debug!(user_id = %user_id, error = %e, "WebSocket send failed");
            break;
        }
        if closing {
            break;
        }
    }
}

pub fn close_message(code: u16, reason: impl Into<String>) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into().into(),
    }))
}

fn to_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Binary(data) => Message::Binary(data.to_vec()),
        Outbound::Text(text) => Message::Text(text),
        Outbound::Ping(payload) => Message::Ping(payload),
        Outbound::Close { code, reason } => close_message(code, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::simulation::testing::{RecordingSimulation, SimEvent, WarmupBehavior};
    use crate::game::{Departure, Simulation, WarmupStatus};
    use crate::matchmaking::{Matchmaker, RoomRegistry, RoomSettings};
    use crate::ws::codec::{encode_input, Cursor, InputPacket};
    use crate::ws::connection::ConnectionSettings;
    use std::sync::Arc;

    fn timers() -> SessionTimers {
        SessionTimers {
            stats_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
        }
    }

    async fn ready_room() -> (Arc<Room>, Arc<RecordingSimulation>) {
        let sim = RecordingSimulation::new(WarmupBehavior::Succeed);
        let room = Arc::new(Room::new("room_s".to_string(), 8, sim.clone()));
        room.open();
        room.spawn_warmup();
        while room.warmup_status() == WarmupStatus::Pending {
            tokio::task::yield_now().await;
        }
        (room, sim)
    }

    fn joined(room: &Room, debug: bool) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
        let (conn, rx) =
            ConnectionHandle::new("alice", "Alice", debug, &ConnectionSettings::default());
        room.add_player("alice", "Alice", conn.clone(), debug).unwrap();
        (conn, rx)
    }

    fn input_message(seq: u32) -> Message {
        let input = InputPacket::from_bitmask(seq, 0b10, Cursor { x: 3.0, y: 4.0 });
        Message::Binary(encode_input(&input).to_vec())
    }

    #[tokio::test]
    async fn test_frames_reach_the_room_in_order() {
        let (room, sim) = ready_room().await;
        let (conn, mut rx) = joined(&room, false);
        let frames = vec![
            Ok(input_message(1)),
            Ok(Message::Text(r#"{"type":"pause"}"#.to_string())),
            Ok(Message::Binary(vec![2, 1])),
            Ok(Message::Text("not json".to_string())),
            Ok(input_message(2)),
            Ok(Message::Text(r#"{"type":"resume"}"#.to_string())),
            Ok(Message::Text(r#"{"type":"ping","t":99}"#.to_string())),
            Ok(Message::Close(None)),
            Ok(input_message(3)),
        ];

        let end = run_session(&room, &conn, futures::stream::iter(frames), &timers()).await;

        assert_eq!(end, SessionEnd::PeerClosed);
        let seqs: Vec<u32> = sim
            .events()
            .iter()
            .filter_map(|e| match e {
                SimEvent::Input { input, .. } => Some(input.seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(sim.events().contains(&SimEvent::Paused {
            user_id: "alice".to_string(),
            paused: true
        }));
        assert!(sim.events().contains(&SimEvent::Paused {
            user_id: "alice".to_string(),
            paused: false
        }));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Text(r#"{"type":"pong","t":99}"#.to_string())
        );
        assert_eq!(conn.roll_stats().dropped_per_sec, 2);
    }

    fn matchmaker() -> Matchmaker {
        fn factory(_room_id: &str) -> Arc<dyn Simulation> {
            let sim: Arc<dyn Simulation> = RecordingSimulation::new(WarmupBehavior::Succeed);
            sim
        }
        Matchmaker::new(
            Arc::new(RoomRegistry::new()),
            RoomSettings {
                capacity: 8,
                tick_period: None,
                admission_retries: 1,
            },
            Arc::new(factory),
        )
    }

    #[tokio::test]
    async fn test_client_close_is_not_unexpected() {
        let mm = matchmaker();
        let (conn, _rx) = ConnectionHandle::new("alice", "Alice", false, &ConnectionSettings::default());
        let (bob, _bob_rx) = ConnectionHandle::new("bob", "Bob", false, &ConnectionSettings::default());
        let room = mm.join(&conn).unwrap();
        mm.join(&bob).unwrap();
        let frames = vec![Ok(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        })))];

        let end = run_session(&room, &conn, futures::stream::iter(frames), &timers()).await;
        conn.mark_closed();
        let departure = mm.release(&room, &conn);

        assert_eq!(end, SessionEnd::PeerClosed);
        assert!(conn.was_intentional());
        assert_eq!(departure, Departure::Left { remaining: 1 });
        assert!(!room.has_player("alice"));
        assert_eq!(room.unexpected_departures(), 0);
    }

    #[tokio::test]
    async fn test_stream_end_without_close_is_lost() {
        let mm = matchmaker();
        let (conn, _rx) = ConnectionHandle::new("alice", "Alice", false, &ConnectionSettings::default());
        let (bob, _bob_rx) = ConnectionHandle::new("bob", "Bob", false, &ConnectionSettings::default());
        let room = mm.join(&conn).unwrap();
        mm.join(&bob).unwrap();

        let frames: Vec<Result<Message, axum::Error>> = Vec::new();
        let end = run_session(&room, &conn, futures::stream::iter(frames), &timers()).await;
        conn.mark_closed();
        mm.release(&room, &conn);

        assert_eq!(end, SessionEnd::StreamEnded);
        assert!(!conn.was_intentional());
        assert!(!room.has_player("alice"));
        assert_eq!(room.unexpected_departures(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_ends_session() {
        let (room, _sim) = ready_room().await;
        let (conn, _rx) = joined(&room, false);
        let frames = vec![Err(axum::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )))];

        let end = run_session(&room, &conn, futures::stream::iter(frames), &timers()).await;
        assert_eq!(end, SessionEnd::TransportError);
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let (room, _sim) = ready_room().await;
        let (conn, mut rx) = joined(&room, false);
        let timers = SessionTimers {
            stats_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_millis(10),
            idle_timeout: Duration::from_millis(30),
        };

        let end = run_session(&room, &conn, futures::stream::pending(), &timers).await;

        assert_eq!(end, SessionEnd::IdleTimeout);
        assert!(!conn.was_intentional());
        let mut saw_ping = false;
        let mut saw_close = false;
        while let Ok(frame) = rx.try_recv() {
            match frame {
                Outbound::Ping(_) => saw_ping = true,
                Outbound::Close { code, .. } => saw_close = code == close_code::GOING_AWAY,
                _ => {}
            }
        }
        assert!(saw_ping);
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_server_close_ends_session() {
        let (room, _sim) = ready_room().await;
        let (conn, _rx) = joined(&room, false);
        conn.disconnect("superseded");
        let timers = SessionTimers {
            heartbeat_interval: Duration::from_millis(10),
            ..timers()
        };

        let end = run_session(&room, &conn, futures::stream::pending(), &timers).await;
        assert_eq!(end, SessionEnd::ServerClosed);
    }

    #[tokio::test]
    async fn test_debug_connection_receives_stats() {
        let (room, _sim) = ready_room().await;
        let (conn, mut rx) = joined(&room, true);
        let timers = SessionTimers {
            stats_interval: Duration::from_millis(10),
            ..timers()
        };

        let run = run_session(&room, &conn, futures::stream::pending(), &timers);
        let _ = tokio::time::timeout(Duration::from_millis(60), run).await;

        let Ok(Outbound::Text(text)) = rx.try_recv() else {
            panic!("expected stats message");
        };
        assert!(text.contains(r#""type":"net_stats""#));
        assert!(conn.stats().total_seconds >= 1);
    }

    #[test]
    fn test_close_message() {
        let Message::Close(Some(frame)) = close_message(close_code::POLICY_VIOLATION, "userId required")
        else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 1008);
        assert_eq!(frame.reason, "userId required");
    }
}
