//! Built-in simulation that mirrors player input back to the room
//!
//! Carries no game rules. It keeps every player's latest input and pause
//! state and, on ticks where something changed, emits:
//!
//! `[count:u8]` then per player
//! `[slot:u8][flags:u8][bitmask:u16 LE][seq:u32 LE][x:f32 LE][y:f32 LE]`
//!
//! `flags` bit 0 is the pause state. Slots are assigned on join and reused.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::debug;

use crate::ws::codec::InputPacket;

use super::simulation::{LeaveReason, Simulation};

/// Size of one player record in the mirror payload
pub const RECORD_LEN: usize = 16;

const FLAG_PAUSED: u8 = 1;

#[derive(Debug, Clone, Copy)]
struct MirrorPlayer {
    slot: u8,
    paused: bool,
    input: InputPacket,
}

#[derive(Debug, Default)]
struct MirrorState {
    players: HashMap<String, MirrorPlayer>,
    dirty: bool,
}

impl MirrorState {
    fn free_slot(&self) -> u8 {
        (0..=u8::MAX)
            .find(|slot| self.players.values().all(|p| p.slot != *slot))
            .unwrap_or(u8::MAX)
    }
}

pub struct MirrorSimulation {
    room_id: String,
    state: Mutex<MirrorState>,
}

impl MirrorSimulation {
    pub fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            state: Mutex::new(MirrorState::default()),
        }
    }

    /// Factory entry point
    pub fn create(room_id: &str) -> Arc<dyn Simulation> {
        Arc::new(Self::new(room_id))
    }
}

impl Simulation for MirrorSimulation {
    fn warmup(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        let room_id = self.room_id.clone();
        Box::pin(async move {
            debug!(room_id = %room_id, "Mirror simulation ready");
            Ok(())
        })
    }

    fn player_joined(&self, user_id: &str, _player_name: &str, _debug: bool) {
        let mut state = self.state.lock();
        let slot = state.free_slot();
        state.players.insert(
            user_id.to_string(),
            MirrorPlayer {
                slot,
                paused: false,
                input: InputPacket::default(),
            },
        );
        state.dirty = true;
    }

    fn player_rejoined(&self, user_id: &str, player_name: &str, debug: bool) {
        let mut state = self.state.lock();
        match state.players.get_mut(user_id) {
            Some(player) => {
                player.paused = false;
                player.input = InputPacket::default();
                state.dirty = true;
            }
            None => {
                drop(state);
                self.player_joined(user_id, player_name, debug);
            }
        }
    }

    fn player_left(&self, user_id: &str, _reason: LeaveReason) {
        let mut state = self.state.lock();
        if state.players.remove(user_id).is_some() {
            state.dirty = true;
        }
    }

    fn handle_input(&self, user_id: &str, input: InputPacket) {
        let mut state = self.state.lock();
        let Some(player) = state.players.get_mut(user_id) else {
            return;
        };
        // Frames arrive in order per connection; seq is informational
        if player.paused {
            return;
        }
        player.input = input;
        state.dirty = true;
    }

    fn set_paused(&self, user_id: &str, paused: bool) {
        let mut state = self.state.lock();
        if let Some(player) = state.players.get_mut(user_id) {
            if player.paused != paused {
                player.paused = paused;
                state.dirty = true;
            }
        }
    }

    fn tick(&self, _tick: u32) -> Option<Bytes> {
        let mut state = self.state.lock();
        if !state.dirty {
            return None;
        }
        state.dirty = false;

        let mut players: Vec<&MirrorPlayer> = state.players.values().collect();
        players.sort_by_key(|p| p.slot);
        let count = players.len().min(usize::from(u8::MAX));

        let mut payload = BytesMut::with_capacity(1 + count * RECORD_LEN);
        payload.put_u8(count as u8);
        for player in players.into_iter().take(count) {
            payload.put_u8(player.slot);
            payload.put_u8(if player.paused { FLAG_PAUSED } else { 0 });
            payload.put_u16_le(player.input.bitmask());
            payload.put_u32_le(player.input.seq);
            payload.put_f32_le(player.input.cursor.x);
            payload.put_f32_le(player.input.cursor.y);
        }

        Some(payload.freeze())
    }
}
