//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::{MirrorSimulation, SimulationFactory};
use crate::matchmaking::{Matchmaker, RoomRegistry, RoomSettings};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<RoomRegistry>,
    pub matchmaker: Arc<Matchmaker>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self::with_factory(config, Arc::new(MirrorSimulation::create))
    }

    /// Build state around a custom simulation
    pub fn with_factory(config: Config, factory: Arc<dyn SimulationFactory>) -> Self {
        let config = Arc::new(config);

        let registry = Arc::new(RoomRegistry::new());
        let matchmaker = Arc::new(Matchmaker::new(
            registry.clone(),
            RoomSettings::from(config.as_ref()),
            factory,
        ));

        Self {
            config,
            registry,
            matchmaker,
        }
    }
}
