//! Binary wire codec for per-frame traffic
//!
//! Two fixed-layout frames share the binary channel, distinguished by their
//! leading type byte:
//!
//! - Input (client -> server, 15 bytes):
//!   `[type=2][bitmask:u16 LE][seq:u32 LE][cursor_x:f32 LE][cursor_y:f32 LE]`
//! - State delta (server -> client):
//!   `[type=1][tick:u32 LE][payload...]`, payload opaque and passed through
//!
//! Decoding never fails loudly: short or foreign frames yield `None` and the
//! caller drops them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Type byte of a state delta frame
pub const DELTA_FRAME_TYPE: u8 = 1;
/// Type byte of an input frame
pub const INPUT_FRAME_TYPE: u8 = 2;
/// Exact size of an input frame
pub const INPUT_FRAME_LEN: usize = 15;
/// Size of the delta header preceding the payload
pub const DELTA_HEADER_LEN: usize = 5;

/// Bit positions inside the input bitmask. Shared with the browser client.
pub mod bits {
    pub const MOVE_UP: u16 = 1 << 0;
    pub const MOVE_DOWN: u16 = 1 << 1;
    pub const MOVE_LEFT: u16 = 1 << 2;
    pub const MOVE_RIGHT: u16 = 1 << 3;
    pub const SHOOT: u16 = 1 << 4;
    pub const TRADE_LONG: u16 = 1 << 5;
    pub const BET_UP: u16 = 1 << 6;
    pub const BET_DOWN: u16 = 1 << 7;
    pub const BET_ALL: u16 = 1 << 8;
    pub const BET_MIN: u16 = 1 << 9;
    pub const TRADE_SHORT: u16 = 1 << 10;
    pub const TRADE_SETTLE: u16 = 1 << 11;
}

/// Kind of a binary frame, from its leading byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Delta,
    Input,
    Unknown(u8),
    Empty,
}

impl FrameKind {
    pub fn of(frame: &[u8]) -> Self {
        match frame.first() {
            Some(&DELTA_FRAME_TYPE) => Self::Delta,
            Some(&INPUT_FRAME_TYPE) => Self::Input,
            Some(&other) => Self::Unknown(other),
            None => Self::Empty,
        }
    }
}

/// Held movement keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Movement {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
}

/// Actions pressed during the frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Actions {
    pub shoot: bool,
    pub trade_long: bool,
    pub bet_up: bool,
    pub bet_down: bool,
    pub bet_all: bool,
    pub bet_min: bool,
    pub trade_short: bool,
    pub trade_settle: bool,
}

/// Cursor position in world space
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Cursor {
    pub x: f32,
    pub y: f32,
}

/// One frame of player intent
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputPacket {
    /// Client sequence number; a hint for reconciliation, not an ordering guarantee
    pub seq: u32,
    pub movement: Movement,
    pub actions: Actions,
    pub cursor: Cursor,
}

impl InputPacket {
    /// Pack movement and actions into the wire bitmask
    pub fn bitmask(&self) -> u16 {
        let flags = [
            (self.movement.up, bits::MOVE_UP),
            (self.movement.down, bits::MOVE_DOWN),
            (self.movement.left, bits::MOVE_LEFT),
            (self.movement.right, bits::MOVE_RIGHT),
            (self.actions.shoot, bits::SHOOT),
            (self.actions.trade_long, bits::TRADE_LONG),
            (self.actions.bet_up, bits::BET_UP),
            (self.actions.bet_down, bits::BET_DOWN),
            (self.actions.bet_all, bits::BET_ALL),
            (self.actions.bet_min, bits::BET_MIN),
            (self.actions.trade_short, bits::TRADE_SHORT),
            (self.actions.trade_settle, bits::TRADE_SETTLE),
        ];

        flags
            .iter()
            .filter(|(set, _)| *set)
            .fold(0, |mask, (_, bit)| mask | bit)
    }

    /// Build a packet from a wire bitmask. Bits 12-15 are ignored.
    pub fn from_bitmask(seq: u32, mask: u16, cursor: Cursor) -> Self {
        let has = |bit: u16| mask & bit != 0;
        Self {
            seq,
            movement: Movement {
                up: has(bits::MOVE_UP),
                down: has(bits::MOVE_DOWN),
                left: has(bits::MOVE_LEFT),
                right: has(bits::MOVE_RIGHT),
            },
            actions: Actions {
                shoot: has(bits::SHOOT),
                trade_long: has(bits::TRADE_LONG),
                bet_up: has(bits::BET_UP),
                bet_down: has(bits::BET_DOWN),
                bet_all: has(bits::BET_ALL),
                bet_min: has(bits::BET_MIN),
                trade_short: has(bits::TRADE_SHORT),
                trade_settle: has(bits::TRADE_SETTLE),
            },
            cursor,
        }
    }
}

/// Encode an input packet into its fixed 15-byte frame
pub fn encode_input(input: &InputPacket) -> [u8; INPUT_FRAME_LEN] {
    let mut frame = [0u8; INPUT_FRAME_LEN];
    let mut out = &mut frame[..];
    out.put_u8(INPUT_FRAME_TYPE);
    out.put_u16_le(input.bitmask());
    out.put_u32_le(input.seq);
    out.put_f32_le(input.cursor.x);
    out.put_f32_le(input.cursor.y);
    frame
}

/// Decode an input frame. Returns `None` for short or non-input frames.
pub fn decode_input(frame: &[u8]) -> Option<InputPacket> {
    if frame.len() < INPUT_FRAME_LEN || frame[0] != INPUT_FRAME_TYPE {
        return None;
    }

    let mut buf = &frame[1..INPUT_FRAME_LEN];
    let mask = buf.get_u16_le();
    let seq = buf.get_u32_le();
    let cursor = Cursor {
        x: buf.get_f32_le(),
        y: buf.get_f32_le(),
    };

    Some(InputPacket::from_bitmask(seq, mask, cursor))
}

/// A parsed state delta frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaFrame {
    pub tick: u32,
    pub payload: Bytes,
}

/// Frame an opaque simulation payload as a state delta
pub fn encode_delta(tick: u32, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(DELTA_HEADER_LEN + payload.len());
    frame.put_u8(DELTA_FRAME_TYPE);
    frame.put_u32_le(tick);
    frame.put_slice(payload);
    frame.freeze()
}

/// Parse a state delta frame. The payload shares the input buffer.
pub fn parse_delta(frame: &Bytes) -> Option<DeltaFrame> {
    if frame.len() < DELTA_HEADER_LEN || frame[0] != DELTA_FRAME_TYPE {
        return None;
    }

    let tick = (&frame[1..DELTA_HEADER_LEN]).get_u32_le();
    Some(DeltaFrame {
        tick,
        payload: frame.slice(DELTA_HEADER_LEN..),
    })
}
