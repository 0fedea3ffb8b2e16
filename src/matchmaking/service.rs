//! Matchmaking service - assigns connections to rooms and evicts empty ones

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::game::{Departure, LeaveReason, Room, RoomError, SimulationFactory};
use crate::util::time::tick_interval;
use crate::ws::connection::ConnectionHandle;
use crate::ws::protocol::close_code;

use super::registry::RoomRegistry;

/// Reason sent to every player when the server stops
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Room tunables applied by the matchmaker
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub capacity: usize,
    /// Tick period; `None` leaves ticking to the caller
    pub tick_period: Option<Duration>,
    /// Extra matchmaking attempts after losing an admission race
    pub admission_retries: u32,
}

impl From<&Config> for RoomSettings {
    fn from(config: &Config) -> Self {
        Self {
            capacity: config.room_capacity,
            tick_period: Some(tick_interval(config.tick_rate)),
            admission_retries: config.admission_retries,
        }
    }
}

/// Join failures surfaced to the acceptor
#[derive(Debug, Clone, thiserror::Error)]
pub enum JoinError {
    #[error("No room could admit the player after {attempts} attempts: {last}")]
    NoRoomAvailable { attempts: u32, last: RoomError },
}

impl JoinError {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::NoRoomAvailable { .. } => close_code::TRY_AGAIN_LATER,
        }
    }
}

/// Matchmaking service
pub struct Matchmaker {
    registry: Arc<RoomRegistry>,
    settings: RoomSettings,
    factory: Arc<dyn SimulationFactory>,
    /// Serializes scan-and-create so concurrent joins do not open duplicate rooms
    admission: Mutex<()>,
}

impl Matchmaker {
    pub fn new(
        registry: Arc<RoomRegistry>,
        settings: RoomSettings,
        factory: Arc<dyn SimulationFactory>,
    ) -> Self {
        Self {
            registry,
            settings,
            factory,
            admission: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    /// First running room with a free slot, or a freshly created one
    pub fn find_or_create_room(&self) -> Arc<Room> {
        let _guard = self.admission.lock();

        let available = self
            .registry
            .rooms()
            .into_iter()
            .find(|room| room.is_running() && room.player_count() < room.capacity());
        if let Some(room) = available {
            return room;
        }

        self.create_room()
    }

    fn create_room(&self) -> Arc<Room> {
        let id = self.registry.next_room_id();
        let simulation = self.factory.create(&id);
        let room = Arc::new(Room::new(id, self.settings.capacity, simulation));

        room.open();
        self.registry.insert(room.clone());
        room.spawn_warmup();
        if let Some(period) = self.settings.tick_period {
            room.spawn_ticker(period);
        }

        info!(
            room_id = %room.id(),
            active_rooms = self.registry.len(),
            "Created new room"
        );
        room
    }

    /// Place a connection in a room
    pub fn join(&self, conn: &Arc<ConnectionHandle>) -> Result<Arc<Room>, JoinError> {
        let user_id = conn.user_id();
        let mut attempts = 0;

        loop {
            attempts += 1;

            // A reconnecting user goes back to the room that still holds them
            let room = match self.registry.find_player(user_id) {
                Some(room) if room.is_running() => room,
                _ => self.find_or_create_room(),
            };

            match room.add_player(user_id, conn.player_name(), conn.clone(), conn.is_debug()) {
                Ok(_) => {
                    info!(
                        user_id = %user_id,
                        room_id = %room.id(),
                        players = room.player_count(),
                        "Player assigned to room"
                    );
                    return Ok(room);
                }
                Err(e) if attempts <= self.settings.admission_retries => {
                    warn!(user_id = %user_id, room_id = %room.id(), error = %e, "Lost admission race, retrying");
                }
                Err(e) => {
                    return Err(JoinError::NoRoomAvailable { attempts, last: e });
                }
            }
        }
    }

    /// Remove a finished connection from its room, evicting the room if it emptied
    pub fn release(&self, room: &Room, conn: &ConnectionHandle) -> Departure {
        let reason = if conn.was_intentional() {
            LeaveReason::Disconnected
        } else {
            LeaveReason::Lost
        };

        let departure = room.remove_connection(conn.user_id(), conn.id(), reason);
        if departure == Departure::Emptied {
            self.evict(room.id());
        }
        departure
    }

    /// Remove a player by id from a room, evicting the room if it emptied
    pub fn remove_player(&self, room: &Room, user_id: &str) -> Departure {
        let departure = room.remove_player(user_id);
        if departure == Departure::Emptied {
            self.evict(room.id());
        }
        departure
    }

    /// Drop a room from the registry. Safe to call more than once.
    pub fn evict(&self, room_id: &str) -> bool {
        match self.registry.remove(room_id) {
            Some(room) => {
                room.terminate();
                info!(room_id = %room_id, active_rooms = self.registry.len(), "Room removed from registry");
                true
            }
            None => false,
        }
    }

    /// Disconnect everyone and drop every room
    pub fn shutdown(&self) {
        let _guard = self.admission.lock();

        for room in self.registry.rooms() {
            let players = room.disconnect_all(SHUTDOWN_REASON);
            room.terminate();
            self.registry.remove(room.id());
            info!(room_id = %room.id(), players, "Room shut down");
        }
    }
}
