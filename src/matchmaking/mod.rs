//! Room registry and matchmaking

pub mod registry;
pub mod service;

pub use registry::RoomRegistry;
pub use service::{JoinError, Matchmaker, RoomSettings};
