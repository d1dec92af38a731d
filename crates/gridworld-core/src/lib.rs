//! Core types for the GridWorld workspace: the entity-component registry,
//! the toroidal world map, the deterministic RNG, and the tick pipeline.

pub mod components;
pub mod events;
pub mod registry;
pub mod rng;
pub mod systems;
pub mod world;

mod movement;

pub use components::{
    Moveable, Name, Position, Predation, RandomMover, Scorable, SimConfig, SimpleBrain,
    SimpleBrainMover, SimpleBrainSeer, TickCounter,
};
pub use events::{Event, EventData, EventsLog};
pub use registry::{Component, EntityId, Registry, RegistryError};
pub use rng::Pcg32;
pub use systems::{destroy_entity, rebuild_world, TickRunner};
pub use world::{World, WorldError};
