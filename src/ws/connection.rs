//! Per-connection handle
//!
//! Wraps one WebSocket: classifies inbound frames, queues outbound frames for
//! the writer task, tracks transport state and rolling statistics.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::util::rate_limit::InputRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::codec::{decode_input, InputPacket};
use crate::ws::protocol::{close_code, ClientMsg, NetStats, ServerMsg};

/// Transport state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    Connected = 0,
    /// Close requested, waiting for the socket to finish
    Closing = 1,
    Closed = 2,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connected,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Frame queued for the socket writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Binary(Bytes),
    Text(String),
    Ping(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Inbound frame, independent of the transport library
#[derive(Debug, Clone)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
}

/// Classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Input(InputPacket),
    Control(ClientMsg),
    /// Malformed, foreign or rate limited; already counted
    Dropped,
}

/// Tunables for a connection
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub outbound_buffer: usize,
    pub input_rate_limit: u32,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            outbound_buffer: config.outbound_buffer,
            input_rate_limit: config.input_rate_limit,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Accumulator for the current stats window
#[derive(Debug, Default)]
struct StatsWindow {
    packets: u64,
    bytes: u64,
    dropped: u64,
    last_arrival: Option<Instant>,
    last_gap_ms: Option<f64>,
    jitter_ms: f64,
    srtt_ms: Option<f64>,
    last_seen: Option<Instant>,
}

/// Handle to one player's connection
pub struct ConnectionHandle {
    id: Uuid,
    user_id: String,
    player_name: String,
    debug: bool,
    created_at: Instant,
    state: AtomicU8,
    intentional_close: AtomicBool,
    outbound: mpsc::Sender<Outbound>,
    limiter: InputRateLimiter,
    window: Mutex<StatsWindow>,
    published: Mutex<NetStats>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue
    pub fn new(
        user_id: impl Into<String>,
        player_name: impl Into<String>,
        debug: bool,
        settings: &ConnectionSettings,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::channel(settings.outbound_buffer.max(1));
        let handle = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            player_name: player_name.into(),
            debug,
            created_at: Instant::now(),
            state: AtomicU8::new(TransportState::Connected as u8),
            intentional_close: AtomicBool::new(false),
            outbound,
            limiter: InputRateLimiter::new(settings.input_rate_limit),
            window: Mutex::new(StatsWindow::default()),
            published: Mutex::new(NetStats::default()),
        });
        (handle, outbound_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Whether either side closed this connection on purpose
    pub fn was_intentional(&self) -> bool {
        self.intentional_close.load(Ordering::Acquire)
    }

    /// Queue a binary frame. Silently dropped unless connected.
    pub fn send(&self, frame: Bytes) -> bool {
        self.enqueue(Outbound::Binary(frame))
    }

    /// Queue a control message. Silently dropped unless connected.
    pub fn send_text(&self, msg: &ServerMsg) -> bool {
        match serde_json::to_string(msg) {
            Ok(json) => self.enqueue(Outbound::Text(json)),
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "Failed to serialize server message");
                false
            }
        }
    }

    /// Queue a transport ping carrying the send time for RTT measurement
    pub fn send_ping(&self) -> bool {
        self.enqueue(Outbound::Ping(unix_millis().to_le_bytes().to_vec()))
    }

    fn enqueue(&self, frame: Outbound) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(user_id = %self.user_id, "Outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close on purpose. The departure will not be reported as unexpected.
    pub fn disconnect(&self, reason: &str) {
        self.intentional_close.store(true, Ordering::Release);
        self.send_text(&ServerMsg::Disconnect {
            reason: reason.to_string(),
        });
        self.request_close(close_code::NORMAL, reason);
    }

    /// Close because of a transport or policy problem
    pub fn close(&self, code: u16, reason: &str) {
        self.request_close(code, reason);
    }

    fn request_close(&self, code: u16, reason: &str) {
        let was_connected = self
            .state
            .compare_exchange(
                TransportState::Connected as u8,
                TransportState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if was_connected {
            let _ = self.outbound.try_send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// The client sent a close frame
    pub fn mark_peer_closed(&self) {
        self.intentional_close.store(true, Ordering::Release);
    }

    /// The socket is gone
    pub fn mark_closed(&self) {
        self.state
            .store(TransportState::Closed as u8, Ordering::Release);
    }

    /// Account for and classify one inbound frame
    pub fn on_frame(&self, frame: Frame) -> Inbound {
        let len = match &frame {
            Frame::Binary(data) => data.len(),
            Frame::Text(text) => text.len(),
        };
        self.record_arrival(len);

        let inbound = match frame {
            Frame::Binary(data) => {
                if !self.limiter.check() {
                    debug!(user_id = %self.user_id, "Input rate limited");
                    Inbound::Dropped
                } else {
                    decode_input(&data).map_or(Inbound::Dropped, Inbound::Input)
                }
            }
            Frame::Text(text) => match serde_json::from_str::<ClientMsg>(&text) {
                Ok(msg) => Inbound::Control(msg),
                Err(e) => {
                    warn!(user_id = %self.user_id, error = %e, "Failed to parse client message");
                    Inbound::Dropped
                }
            },
        };

        if inbound == Inbound::Dropped {
            self.window.lock().dropped += 1;
        }
        inbound
    }

    fn record_arrival(&self, bytes: usize) {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.packets += 1;
        window.bytes += bytes as u64;
        window.last_seen = Some(now);

        if self.debug {
            if let Some(previous) = window.last_arrival {
                let gap_ms = now.duration_since(previous).as_secs_f64() * 1000.0;
                if let Some(last_gap) = window.last_gap_ms {
                    let deviation = (gap_ms - last_gap).abs();
                    window.jitter_ms += (deviation - window.jitter_ms) / 16.0;
                }
                window.last_gap_ms = Some(gap_ms);
            }
        }
        window.last_arrival = Some(now);
    }

    /// Keep-alive traffic that is not a game frame
    pub fn touch(&self) {
        self.window.lock().last_seen = Some(Instant::now());
    }

    /// Feed a transport pong; payload is the ping's send time
    pub fn record_pong(&self, payload: &[u8]) {
        let mut window = self.window.lock();
        window.last_seen = Some(Instant::now());

        let Ok(sent) = <[u8; 8]>::try_from(payload) else {
            return;
        };
        let sample = unix_millis().saturating_sub(u64::from_le_bytes(sent)) as f64;
        window.srtt_ms = Some(match window.srtt_ms {
            Some(srtt) => srtt * 0.875 + sample * 0.125,
            None => sample,
        });
    }

    /// Time since the last inbound frame, pong or handshake
    pub fn idle_for(&self) -> Duration {
        self.window
            .lock()
            .last_seen
            .unwrap_or(self.created_at)
            .elapsed()
    }

    /// Close the current stats window: publish it and reset the accumulator
    pub fn roll_stats(&self) -> NetStats {
        let mut window = self.window.lock();
        let mut published = self.published.lock();

        published.packets_per_sec = window.packets;
        published.bytes_per_sec = window.bytes;
        published.dropped_per_sec = window.dropped;
        published.total_bytes += window.bytes;
        published.total_seconds += 1;
        published.jitter_ms = window.jitter_ms;
        published.rtt_ms = window.srtt_ms;

        window.packets = 0;
        window.bytes = 0;
        window.dropped = 0;

        *published
    }

    /// Last published stats snapshot
    pub fn stats(&self) -> NetStats {
        *self.published.lock()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::codec::{encode_input, Cursor};

    fn handle(debug: bool) -> (Arc<ConnectionHandle>, mpsc::Receiver<Outbound>) {
        ConnectionHandle::new("user-1", "Tester", debug, &ConnectionSettings::default())
    }

    fn input_frame(seq: u32) -> Frame {
        let input = InputPacket::from_bitmask(seq, 0b1, Cursor { x: 1.0, y: 2.0 });
        Frame::Binary(Bytes::copy_from_slice(&encode_input(&input)))
    }

    #[test]
    fn test_new_handle_is_connected() {
        let (conn, _rx) = handle(false);
        assert_eq!(conn.user_id(), "user-1");
        assert_eq!(conn.player_name(), "Tester");
        assert!(conn.is_connected());
        assert!(!conn.was_intentional());
    }

    #[test]
    fn test_send_queues_frames() {
        let (conn, mut rx) = handle(false);

        assert!(conn.send(Bytes::from_static(b"\x01delta")));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Binary(Bytes::from_static(b"\x01delta"))
        );
    }

    #[test]
    fn test_send_after_close_is_noop() {
        let (conn, mut rx) = handle(false);
        conn.close(close_code::GOING_AWAY, "idle timeout");

        assert_eq!(conn.state(), TransportState::Closing);
        assert!(!conn.send(Bytes::from_static(b"late")));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Outbound::Close { code: close_code::GOING_AWAY, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_with_full_queue_drops() {
        let settings = ConnectionSettings {
            outbound_buffer: 1,
            ..Default::default()
        };
        let (conn, _rx) = ConnectionHandle::new("u", "n", false, &settings);

        assert!(conn.send(Bytes::from_static(b"a")));
        assert!(!conn.send(Bytes::from_static(b"b")));
        assert!(conn.is_connected());
    }

    #[test]
    fn test_disconnect_is_intentional() {
        let (conn, mut rx) = handle(false);
        conn.disconnect("superseded");

        assert!(conn.was_intentional());
        assert_eq!(conn.state(), TransportState::Closing);

        let Outbound::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected disconnect notice");
        };
        assert!(text.contains(r#""type":"disconnect""#));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close {
                code: close_code::NORMAL,
                reason: "superseded".to_string()
            }
        );
    }

    #[test]
    fn test_close_only_once() {
        let (conn, mut rx) = handle(false);
        conn.close(close_code::GOING_AWAY, "first");
        conn.close(close_code::SERVER_ERROR, "second");
        conn.mark_closed();

        assert_eq!(conn.state(), TransportState::Closed);
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Close { code: close_code::GOING_AWAY, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_on_frame_classifies() {
        let (conn, _rx) = handle(false);

        assert!(matches!(conn.on_frame(input_frame(3)), Inbound::Input(i) if i.seq == 3));
        assert_eq!(
            conn.on_frame(Frame::Text(r#"{"type":"pause"}"#.to_string())),
            Inbound::Control(ClientMsg::Pause)
        );
        assert_eq!(
            conn.on_frame(Frame::Binary(Bytes::from_static(&[2, 0, 0]))),
            Inbound::Dropped
        );
        assert_eq!(
            conn.on_frame(Frame::Text("{{{".to_string())),
            Inbound::Dropped
        );
    }

    #[test]
    fn test_rate_limited_input_dropped() {
        let settings = ConnectionSettings {
            input_rate_limit: 2,
            ..Default::default()
        };
        let (conn, _rx) = ConnectionHandle::new("u", "n", false, &settings);

        assert!(matches!(conn.on_frame(input_frame(1)), Inbound::Input(_)));
        assert!(matches!(conn.on_frame(input_frame(2)), Inbound::Input(_)));
        assert_eq!(conn.on_frame(input_frame(3)), Inbound::Dropped);
    }

    #[test]
    fn test_roll_stats_publishes_and_resets() {
        let (conn, _rx) = handle(false);
        conn.on_frame(input_frame(1));
        conn.on_frame(input_frame(2));
        conn.on_frame(Frame::Binary(Bytes::from_static(&[9])));

        assert_eq!(conn.stats(), NetStats::default());

        let first = conn.roll_stats();
        assert_eq!(first.packets_per_sec, 3);
        assert_eq!(first.bytes_per_sec, 31);
        assert_eq!(first.dropped_per_sec, 1);
        assert_eq!(first.total_seconds, 1);
        assert_eq!(conn.stats(), first);

        let second = conn.roll_stats();
        assert_eq!(second.packets_per_sec, 0);
        assert_eq!(second.total_bytes, 31);
        assert_eq!(second.total_seconds, 2);
    }

    #[test]
    fn test_jitter_only_for_debug() {
        let (plain, _rx1) = handle(false);
        let (debug, _rx2) = handle(true);

        for seq in 0..4 {
            plain.on_frame(input_frame(seq));
            debug.on_frame(input_frame(seq));
            std::thread::sleep(Duration::from_millis(if seq % 2 == 0 { 1 } else { 8 }));
        }

        assert_eq!(plain.roll_stats().jitter_ms, 0.0);
        assert!(debug.roll_stats().jitter_ms > 0.0);
    }

    #[test]
    fn test_record_pong() {
        let (conn, _rx) = handle(false);
        let sent = unix_millis().saturating_sub(40);
        conn.record_pong(&sent.to_le_bytes());
        conn.record_pong(b"junk");

        let rtt = conn.roll_stats().rtt_ms.unwrap();
        assert!(rtt >= 40.0 && rtt < 1000.0);
    }

    #[test]
    fn test_idle_for_resets_on_traffic() {
        let (conn, _rx) = handle(false);
        std::thread::sleep(Duration::from_millis(20));
        assert!(conn.idle_for() >= Duration::from_millis(20));

        conn.touch();
        assert!(conn.idle_for() < Duration::from_millis(20));
    }
}
