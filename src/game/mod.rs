//! Rooms and the simulation interface they drive

pub mod mirror;
pub mod room;
pub mod simulation;

pub use mirror::MirrorSimulation;
pub use room::{Admission, Departure, Room, RoomError, RoomPhase, RoomState, RoomSummary, WarmupStatus};
pub use simulation::{LeaveReason, Simulation, SimulationFactory};
