//! Per-entity component types and the plain singleton values.
//!
//! Wire field names follow the serialized state format; defaults follow the
//! values a freshly assigned component carries.

use ndarray::{Array1, Array2};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// World-coordinate cell position. Not normalized until read through the
/// spatial index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

/// Accumulated movement intent; zeroed after movement resolution each tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Moveable {
    pub x_force: i32,
    pub y_force: i32,
}

/// Informational naming: a family ("major") and personal ("minor") name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Name {
    #[serde(rename = "major_name")]
    pub major: String,
    #[serde(rename = "minor_name")]
    pub minor: String,
}

/// Reads the world through a Manhattan diamond into the input neuron layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleBrainSeer {
    pub neuron_offset: i32,
    pub sight_radius: i32,
}

impl Default for SimpleBrainSeer {
    fn default() -> Self {
        // Offset 1 leaves the bias neuron untouched.
        Self {
            neuron_offset: 1,
            sight_radius: 2,
        }
    }
}

/// Reads four output neurons into movement forces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleBrainMover {
    pub neuron_offset: i32,
}

/// Predator behavior parameters and cooldown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predation {
    pub no_predation_until_tick: u64,
    pub ticks_between_predations: u32,
    pub predate_all: bool,
}

impl Default for Predation {
    fn default() -> Self {
        Self {
            no_predation_until_tick: 0,
            ticks_between_predations: 1,
            predate_all: true,
        }
    }
}

/// Tag marking entities that jitter their forces each tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RandomMover;

/// Prey score; predation decrements it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scorable {
    pub score: i32,
}

/// Errors raised when validating a brain's layer topology.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrainTopologyError {
    #[error("brain needs exactly one more neuron layer than synapse layers")]
    LayerCountMismatch,
    #[error("synapse layer {index} rows {rows} do not match input layer width {expected}")]
    InputMismatch {
        index: usize,
        rows: usize,
        expected: usize,
    },
    #[error("synapse layer {index} columns {cols} do not match output layer width {expected}")]
    OutputMismatch {
        index: usize,
        cols: usize,
        expected: usize,
    },
}

/// A feed-forward brain: one row-vector of neurons per layer and one dense
/// synapse matrix between consecutive layers.
///
/// Every non-terminal layer carries a bias neuron in column 0 that the layer
/// product never overwrites; it is initialized to 1 and stays 1 at tick
/// boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleBrain {
    pub synapses: Vec<Array2<f32>>,
    pub neurons: Vec<Array1<f32>>,
    pub child_mutation_chance: f32,
    pub child_mutation_strength: f32,
}

impl Default for SimpleBrain {
    /// The stock 27 -> 9 -> 4 topology: all neurons one, all synapses zero.
    fn default() -> Self {
        Self {
            synapses: vec![Array2::zeros((27, 8)), Array2::zeros((9, 4))],
            neurons: vec![Array1::ones(27), Array1::ones(9), Array1::ones(4)],
            child_mutation_chance: 0.5,
            child_mutation_strength: 0.2,
        }
    }
}

impl SimpleBrain {
    /// Build a zeroed brain from per-layer neuron counts (bias neurons are
    /// added to every layer except the last).
    #[must_use]
    pub fn layered(counts: &[usize]) -> Self {
        let mut neurons = Vec::with_capacity(counts.len());
        let mut synapses = Vec::with_capacity(counts.len().saturating_sub(1));
        for i in 0..counts.len().saturating_sub(1) {
            let inputs = counts[i] + 1;
            let outputs = counts[i + 1];
            neurons.push(Array1::ones(inputs));
            synapses.push(Array2::zeros((inputs, outputs)));
        }
        if let Some(last) = counts.last() {
            neurons.push(Array1::ones(*last));
        }
        Self {
            synapses,
            neurons,
            child_mutation_chance: 0.5,
            child_mutation_strength: 0.2,
        }
    }

    /// Check the dimension invariant: `len(neurons) == len(synapses) + 1`,
    /// each synapse layer's rows match its input layer, and its columns match
    /// the output layer minus the bias column (except for the last layer).
    pub fn validate(&self) -> Result<(), BrainTopologyError> {
        if self.neurons.len() != self.synapses.len() + 1 {
            return Err(BrainTopologyError::LayerCountMismatch);
        }
        for (index, synapse) in self.synapses.iter().enumerate() {
            let (rows, cols) = synapse.dim();
            let expected_rows = self.neurons[index].len();
            if rows != expected_rows {
                return Err(BrainTopologyError::InputMismatch {
                    index,
                    rows,
                    expected: expected_rows,
                });
            }
            let out_width = self.neurons[index + 1].len();
            let expected_cols = if index == self.synapses.len() - 1 {
                out_width
            } else {
                out_width.saturating_sub(1)
            };
            if cols != expected_cols {
                return Err(BrainTopologyError::OutputMismatch {
                    index,
                    cols,
                    expected: expected_cols,
                });
            }
        }
        Ok(())
    }
}

// Wire shape: matrices as nested row arrays, row-vectors as flat arrays.
impl Serialize for SimpleBrain {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let synapses: Vec<Vec<Vec<f32>>> = self
            .synapses
            .iter()
            .map(|m| m.rows().into_iter().map(|r| r.to_vec()).collect())
            .collect();
        let neurons: Vec<Vec<f32>> = self.neurons.iter().map(|n| n.to_vec()).collect();

        let mut s = serializer.serialize_struct("SimpleBrain", 4)?;
        s.serialize_field("child_mutation_chance", &self.child_mutation_chance)?;
        s.serialize_field("child_mutation_strength", &self.child_mutation_strength)?;
        s.serialize_field("synapses", &synapses)?;
        s.serialize_field("neurons", &neurons)?;
        s.end()
    }
}

impl<'de> Deserialize<'de> for SimpleBrain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Wire {
            child_mutation_chance: f32,
            child_mutation_strength: f32,
            synapses: Vec<Vec<Vec<f32>>>,
            neurons: Vec<Vec<f32>>,
        }

        let wire = Wire::deserialize(deserializer)?;
        let mut synapses = Vec::with_capacity(wire.synapses.len());
        for (index, rows) in wire.synapses.into_iter().enumerate() {
            let row_count = rows.len();
            let col_count = rows.first().map_or(0, Vec::len);
            if rows.iter().any(|r| r.len() != col_count) {
                return Err(de::Error::custom(format!(
                    "synapse matrix {index} is not rectangular"
                )));
            }
            let flat: Vec<f32> = rows.into_iter().flatten().collect();
            let matrix = Array2::from_shape_vec((row_count, col_count), flat)
                .map_err(de::Error::custom)?;
            synapses.push(matrix);
        }
        let neurons = wire.neurons.into_iter().map(Array1::from_vec).collect();
        Ok(Self {
            synapses,
            neurons,
            child_mutation_chance: wire.child_mutation_chance,
            child_mutation_strength: wire.child_mutation_strength,
        })
    }
}

/// Current tick, starting at 0 when the registry is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickCounter {
    pub tick: u64,
}

/// Evolution tuning knobs.
///
/// `evo_ticks_per_evolution` is advisory; the trigger itself is the bitmask
/// check in the evolution system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimConfig {
    pub evo_ticks_per_evolution: u32,
    pub evo_winner_count: u32,
    pub evo_new_entity_count: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            evo_ticks_per_evolution: 10_000,
            evo_winner_count: 6,
            evo_new_entity_count: 3,
        }
    }
}
