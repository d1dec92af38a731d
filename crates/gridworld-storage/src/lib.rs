//! State serialization for GridWorld registries: a schema-checked JSON
//! envelope, a compact little-endian binary envelope, and the name-keyed
//! dispatch tables the simulation façade drives.

use gridworld_core::{RegistryError, WorldError};
use thiserror::Error;

pub mod binary;
pub mod json;
pub mod schema;

pub use binary::{state_from_binary, state_to_binary};
pub use json::{state_from_json, state_to_json};
pub use schema::{
    component_spec, component_specs, singleton_spec, singleton_specs, ComponentSpec, SingletonSpec,
};

/// Errors raised while encoding or decoding simulation state.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid state payload: {0}")]
    Invalid(String),
    #[error("unknown component name: {0}")]
    UnknownComponent(String),
    #[error("unknown singleton name: {0}")]
    UnknownSingleton(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    World(#[from] WorldError),
}

impl CodecError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}
