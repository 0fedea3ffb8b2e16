//! Room state and authoritative tick loop

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::util::time::unix_millis;
use crate::ws::codec::{encode_delta, InputPacket};
use crate::ws::connection::ConnectionHandle;

use super::simulation::{LeaveReason, Simulation};

/// Reason sent to a connection replaced by a newer one for the same user
pub const SUPERSEDED_REASON: &str = "superseded";

/// Admission phase of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Constructed, not yet accepting players
    Created,
    /// Accepting players (the room is "running")
    Open,
    /// Emptied or shut down; never reopens
    Terminated,
}

/// Progress of the background warmup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupStatus {
    Pending,
    Ready,
    /// Warmup errored; the room keeps serving in a degraded state
    Failed,
}

/// Observable lifecycle state, derived from phase and warmup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    Created,
    WarmingUp,
    Running,
    Terminated,
}

/// Result of a successful `add_player`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Joined,
    /// An existing connection for the same user was replaced and closed
    Replaced,
}

/// Result of a removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// Nothing to remove
    NotPresent,
    Left { remaining: usize },
    /// The last player left; the room is terminated. Reported once per room.
    Emptied,
}

/// Room errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Room is full")]
    Full,
    #[error("Room is not running")]
    NotRunning,
}

/// Room information for listing
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    pub id: String,
    pub state: RoomState,
    pub warmup: WarmupStatus,
    pub players: usize,
    pub capacity: usize,
    pub age_secs: u64,
    pub created_at_ms: u64,
    /// Last simulation tick
    pub tick: u32,
}

struct RoomInner {
    phase: RoomPhase,
    players: HashMap<String, Arc<ConnectionHandle>>,
}

/// One capacity-bounded game instance and its players
pub struct Room {
    id: String,
    capacity: usize,
    created_at: Instant,
    created_at_ms: u64,
    inner: Mutex<RoomInner>,
    warmup: Mutex<WarmupStatus>,
    simulation: Arc<dyn Simulation>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    tick: AtomicU32,
    unexpected_departures: AtomicU64,
    discarded_inputs: AtomicU64,
}

impl Room {
    pub fn new(id: String, capacity: usize, simulation: Arc<dyn Simulation>) -> Self {
        Self {
            id,
            capacity,
            created_at: Instant::now(),
            created_at_ms: unix_millis(),
            inner: Mutex::new(RoomInner {
                phase: RoomPhase::Created,
                players: HashMap::new(),
            }),
            warmup: Mutex::new(WarmupStatus::Pending),
            simulation,
            tasks: Mutex::new(Vec::new()),
            tick: AtomicU32::new(0),
            unexpected_departures: AtomicU64::new(0),
            discarded_inputs: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn player_count(&self) -> usize {
        self.inner.lock().players.len()
    }

    pub fn has_player(&self, user_id: &str) -> bool {
        self.inner.lock().players.contains_key(user_id)
    }

    pub fn phase(&self) -> RoomPhase {
        self.inner.lock().phase
    }

    /// Accepting players
    pub fn is_running(&self) -> bool {
        self.phase() == RoomPhase::Open
    }

    pub fn warmup_status(&self) -> WarmupStatus {
        *self.warmup.lock()
    }

    pub fn state(&self) -> RoomState {
        match (self.phase(), self.warmup_status()) {
            (RoomPhase::Created, _) => RoomState::Created,
            (RoomPhase::Open, WarmupStatus::Pending) => RoomState::WarmingUp,
            (RoomPhase::Open, _) => RoomState::Running,
            (RoomPhase::Terminated, _) => RoomState::Terminated,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn unexpected_departures(&self) -> u64 {
        self.unexpected_departures.load(Ordering::Relaxed)
    }

    pub fn discarded_inputs(&self) -> u64 {
        self.discarded_inputs.load(Ordering::Relaxed)
    }

    pub fn current_tick(&self) -> u32 {
        self.tick.load(Ordering::Relaxed)
    }

    /// Start accepting players
    pub fn open(&self) {
        let mut inner = self.inner.lock();
        if inner.phase == RoomPhase::Created {
            inner.phase = RoomPhase::Open;
        }
    }

    /// Register a player's connection. A second connection for the same user
    /// replaces the first, which is closed.
    pub fn add_player(
        &self,
        user_id: &str,
        player_name: &str,
        connection: Arc<ConnectionHandle>,
        debug: bool,
    ) -> Result<Admission, RoomError> {
        let previous = {
            let mut inner = self.inner.lock();
            if inner.phase != RoomPhase::Open {
                return Err(RoomError::NotRunning);
            }
            if !inner.players.contains_key(user_id) && inner.players.len() >= self.capacity {
                return Err(RoomError::Full);
            }
            inner.players.insert(user_id.to_string(), connection)
        };

        match previous {
            Some(old) => {
                info!(room_id = %self.id, user_id = %user_id, "Player reconnected, closing previous connection");
                old.disconnect(SUPERSEDED_REASON);
                self.simulation.player_rejoined(user_id, player_name, debug);
                Ok(Admission::Replaced)
            }
            None => {
                info!(room_id = %self.id, user_id = %user_id, player_name = %player_name, "Player joined room");
                self.simulation.player_joined(user_id, player_name, debug);
                Ok(Admission::Joined)
            }
        }
    }

    /// Remove a player. Removing an absent player is a no-op.
    pub fn remove_player(&self, user_id: &str) -> Departure {
        self.remove_entry(user_id, None, LeaveReason::Removed)
    }

    /// Remove a player only if it is still registered with this connection
    pub fn remove_connection(
        &self,
        user_id: &str,
        connection_id: Uuid,
        reason: LeaveReason,
    ) -> Departure {
        self.remove_entry(user_id, Some(connection_id), reason)
    }

    fn remove_entry(
        &self,
        user_id: &str,
        connection_id: Option<Uuid>,
        reason: LeaveReason,
    ) -> Departure {
        let departure = {
            let mut inner = self.inner.lock();
            let matches = inner
                .players
                .get(user_id)
                .is_some_and(|conn| connection_id.map_or(true, |id| conn.id() == id));
            if !matches {
                return Departure::NotPresent;
            }

            inner.players.remove(user_id);
            if inner.players.is_empty() && inner.phase == RoomPhase::Open {
                inner.phase = RoomPhase::Terminated;
                Departure::Emptied
            } else {
                Departure::Left {
                    remaining: inner.players.len(),
                }
            }
        };

        if reason == LeaveReason::Lost {
            self.unexpected_departures.fetch_add(1, Ordering::Relaxed);
            warn!(room_id = %self.id, user_id = %user_id, "Player connection lost");
        } else {
            info!(room_id = %self.id, user_id = %user_id, reason = ?reason, "Player left room");
        }
        self.simulation.player_left(user_id, reason);

        if departure == Departure::Emptied {
            info!(room_id = %self.id, "Room is empty, terminating");
            self.abort_tasks();
        }
        departure
    }

    /// Forward one frame of input to the simulation
    pub fn handle_input(&self, user_id: &str, input: InputPacket) {
        if !self.has_player(user_id) {
            trace!(room_id = %self.id, user_id = %user_id, "Input from departed player");
            return;
        }
        if self.warmup_status() == WarmupStatus::Pending {
            self.discarded_inputs.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.simulation.handle_input(user_id, input);
    }

    pub fn set_paused(&self, user_id: &str, paused: bool) {
        if self.has_player(user_id) {
            debug!(room_id = %self.id, user_id = %user_id, paused, "Pause state changed");
            self.simulation.set_paused(user_id, paused);
        }
    }

    /// Send a frame to every player in the room
    pub fn broadcast(&self, frame: Bytes) -> usize {
        let players: Vec<Arc<ConnectionHandle>> =
            self.inner.lock().players.values().cloned().collect();

        players
            .iter()
            .filter(|conn| conn.send(frame.clone()))
            .count()
    }

    /// Advance the simulation one tick and broadcast its delta
    pub fn tick(&self) -> Option<Bytes> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let payload = self.simulation.tick(tick)?;
        let frame = encode_delta(tick, &payload);
        self.broadcast(frame.clone());
        Some(frame)
    }

    /// Run the simulation's warmup in the background
    pub fn spawn_warmup(self: &Arc<Self>) {
        let room = Arc::downgrade(self);
        let warmup = self.simulation.warmup();
        let task = tokio::spawn(async move {
            let result = warmup.await;
            if let Some(room) = room.upgrade() {
                room.finish_warmup(result);
            }
        });
        self.tasks.lock().push(task);
    }

    fn finish_warmup(&self, result: anyhow::Result<()>) {
        let status = match result {
            Ok(()) => {
                info!(room_id = %self.id, "Room warmup complete");
                WarmupStatus::Ready
            }
            Err(e) => {
                error!(room_id = %self.id, error = %e, "Room warmup failed, continuing degraded");
                WarmupStatus::Failed
            }
        };
        *self.warmup.lock() = status;
    }

    /// Drive `tick` at a fixed rate until the room terminates
    pub fn spawn_ticker(self: &Arc<Self>, period: Duration) {
        let room: Weak<Room> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(room) = room.upgrade() else { break };
                if room.phase() == RoomPhase::Terminated {
                    break;
                }
                room.tick();
            }
        });
        self.tasks.lock().push(task);
    }

    /// Disconnect every player on purpose
    pub fn disconnect_all(&self, reason: &str) -> usize {
        let players: Vec<Arc<ConnectionHandle>> =
            self.inner.lock().players.values().cloned().collect();
        for conn in &players {
            conn.disconnect(reason);
        }
        players.len()
    }

    /// Stop admitting players and cancel background work
    pub fn terminate(&self) {
        self.inner.lock().phase = RoomPhase::Terminated;
        self.abort_tasks();
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            state: self.state(),
            warmup: self.warmup_status(),
            players: self.player_count(),
            capacity: self.capacity,
            age_secs: self.age().as_secs(),
            created_at_ms: self.created_at_ms,
            tick: self.current_tick(),
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("state", &self.state())
            .field("players", &self.player_count())
            .finish()
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
