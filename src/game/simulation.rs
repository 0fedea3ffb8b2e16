//! Interface to the authoritative game simulation
//!
//! The session layer owns rooms, players and the wire; the rules of the game
//! live behind [`Simulation`]. One simulation instance is created per room.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::ws::codec::InputPacket;

/// Why a player left a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Removed by the server without a transport event
    Removed,
    /// Connection closed on purpose (superseded, shutdown)
    Disconnected,
    /// Connection dropped, errored or timed out
    Lost,
}

/// Authoritative simulation for one room.
///
/// Every method except `warmup` runs on a connection or tick task and must
/// return promptly.
pub trait Simulation: Send + Sync {
    /// Prepare the simulation (preload data, build the world). Runs in the
    /// background while the room already accepts players.
    fn warmup(&self) -> BoxFuture<'static, anyhow::Result<()>>;

    fn player_joined(&self, user_id: &str, player_name: &str, debug: bool);

    fn player_left(&self, user_id: &str, reason: LeaveReason);

    /// A new connection replaced the player's previous one. Per-connection
    /// state (sequence numbers, pause) starts over.
    fn player_rejoined(&self, user_id: &str, player_name: &str, debug: bool) {
        self.player_left(user_id, LeaveReason::Disconnected);
        self.player_joined(user_id, player_name, debug);
    }

    fn handle_input(&self, user_id: &str, input: InputPacket);

    fn set_paused(&self, user_id: &str, paused: bool);

    /// Advance one tick. Returns the state delta to broadcast, if any.
    fn tick(&self, tick: u32) -> Option<Bytes>;
}

/// Creates the simulation for a newly created room
pub trait SimulationFactory: Send + Sync {
    fn create(&self, room_id: &str) -> Arc<dyn Simulation>;
}

impl<F> SimulationFactory for F
where
    F: Fn(&str) -> Arc<dyn Simulation> + Send + Sync,
{
    fn create(&self, room_id: &str) -> Arc<dyn Simulation> {
        self(room_id)
    }
}
