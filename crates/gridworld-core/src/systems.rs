//! The tick pipeline: eight ordered systems that mutate the registry.
//!
//! Order is part of the observable contract: tick-increment, seer,
//! brain-calc, mover, random-movement, movement, predation, evolution,
//! event-log finalize.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::components::{
    Moveable, Name, Position, Predation, RandomMover, Scorable, SimConfig, SimpleBrain,
    SimpleBrainMover, SimpleBrainSeer, TickCounter,
};
use crate::events::{Event, EventData, EventsLog};
use crate::movement::MovementScratch;
use crate::registry::{EntityId, Registry, RegistryError};
use crate::rng::{Pcg32, DEFAULT_STREAM};
use crate::world::{World, WorldError};

/// Runs the pipeline, owning the movement resolver's scratch buffers.
#[derive(Default)]
pub struct TickRunner {
    movement: MovementScratch,
}

impl TickRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One full pipeline invocation; advances the tick counter by exactly 1.
    pub fn tick(&mut self, reg: &mut Registry) {
        tick_increment(reg);
        simple_brain_seer(reg);
        simple_brain_calc(reg);
        simple_brain_mover(reg);
        random_movement(reg);
        self.movement(reg);
        predation(reg);
        evolution(reg);
        finalize_event_log(reg);
    }

    /// The movement-resolution system alone.
    pub fn movement(&mut self, reg: &mut Registry) {
        crate::movement::run(reg, &mut self.movement);
    }
}

pub fn tick_increment(reg: &mut Registry) {
    reg.ctx_mut::<TickCounter>().tick += 1;
}

/// Write the Manhattan diamond around each seer into its input neurons: two
/// values per cell, `(1,0)` for a predator, `(0,1)` for any other occupant,
/// `(0,0)` for an empty cell.
pub fn simple_brain_seer(reg: &mut Registry) {
    let mut sensed: Vec<(f32, f32)> = Vec::new();
    for e in reg.entities_with::<SimpleBrain>() {
        let Ok(seer) = reg.get::<SimpleBrainSeer>(e).copied() else {
            continue;
        };
        let Ok(position) = reg.get::<Position>(e).copied() else {
            continue;
        };

        sensed.clear();
        {
            let world = reg.ctx::<World>();
            let radius = seer.sight_radius;
            for dy in -radius..=radius {
                let x_radius = radius - dy.abs();
                for dx in -x_radius..=x_radius {
                    let occupant = world.get(position.x + dx, position.y + dy);
                    if occupant.is_null() {
                        sensed.push((0.0, 0.0));
                    } else if reg.has::<Predation>(occupant) {
                        sensed.push((1.0, 0.0));
                    } else {
                        sensed.push((0.0, 1.0));
                    }
                }
            }
        }

        let Ok(brain) = reg.get_mut::<SimpleBrain>(e) else {
            continue;
        };
        let Some(input) = brain.neurons.first_mut() else {
            continue;
        };
        let mut offset = seer.neuron_offset.max(0) as usize;
        for (predator, other) in &sensed {
            if offset + 1 >= input.len() {
                break;
            }
            input[offset] = *predator;
            input[offset + 1] = *other;
            offset += 2;
        }
    }
}

fn relu(values: &mut ndarray::Array1<f32>) {
    for v in values.iter_mut() {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}

// Explicit accumulation order: ascending rows per output column.
fn row_times_matrix(row: &ndarray::Array1<f32>, matrix: &ndarray::Array2<f32>) -> Vec<f32> {
    let (rows, cols) = matrix.dim();
    let n = row.len().min(rows);
    let mut out = vec![0.0f32; cols];
    for (c, slot) in out.iter_mut().enumerate() {
        let mut acc = 0.0f32;
        for r in 0..n {
            acc += row[r] * matrix[[r, c]];
        }
        *slot = acc;
    }
    out
}

/// Feed each brain forward: ReLU the input layer in place, multiply into the
/// next layer (preserving its bias column except on the output layer), and
/// ReLU the final outputs.
pub fn simple_brain_calc(reg: &mut Registry) {
    for (_, brain) in reg.view_mut::<SimpleBrain>() {
        if brain.neurons.len() != brain.synapses.len() + 1 {
            continue;
        }
        for i in 0..brain.synapses.len() {
            let has_bias = i != brain.synapses.len() - 1;
            relu(&mut brain.neurons[i]);
            let product = row_times_matrix(&brain.neurons[i], &brain.synapses[i]);
            let output = &mut brain.neurons[i + 1];
            if has_bias {
                let writable = output.len().saturating_sub(1).min(product.len());
                for k in 0..writable {
                    output[k + 1] = product[k];
                }
            } else {
                let writable = output.len().min(product.len());
                for k in 0..writable {
                    output[k] = product[k];
                }
            }
        }
        if let Some(last) = brain.neurons.last_mut() {
            relu(last);
        }
    }
}

/// Translate four output neurons into movement forces: `+x, -x, +y, -y`,
/// each scaled by 4 with truncation toward zero.
pub fn simple_brain_mover(reg: &mut Registry) {
    for e in reg.entities_with::<SimpleBrain>() {
        let Ok(mover) = reg.get::<SimpleBrainMover>(e).copied() else {
            continue;
        };
        let outputs = {
            let Ok(brain) = reg.get::<SimpleBrain>(e) else {
                continue;
            };
            let Some(last) = brain.neurons.last() else {
                continue;
            };
            let base = mover.neuron_offset.max(0) as usize;
            let mut values = [0.0f32; 4];
            for (k, value) in values.iter_mut().enumerate() {
                let Some(v) = last.get(base + k) else {
                    continue;
                };
                *value = *v;
            }
            values
        };
        let Ok(moveable) = reg.get_mut::<Moveable>(e) else {
            continue;
        };
        moveable.x_force += 4 * outputs[0].trunc() as i32;
        moveable.x_force -= 4 * outputs[1].trunc() as i32;
        moveable.y_force += 4 * outputs[2].trunc() as i32;
        moveable.y_force -= 4 * outputs[3].trunc() as i32;
    }
}

/// Jitter one axis of each random mover by `rng() % 7 - 3`.
pub fn random_movement(reg: &mut Registry) {
    for e in reg.entities_with::<RandomMover>() {
        if !reg.has::<Moveable>(e) {
            continue;
        }
        let (vertical, delta) = {
            let Ok(rng) = reg.get_mut::<Pcg32>(e) else {
                continue;
            };
            let vertical = rng.next() % 2 == 0;
            let delta = (rng.next() % 7) as i32 - 3;
            (vertical, delta)
        };
        let Ok(moveable) = reg.get_mut::<Moveable>(e) else {
            continue;
        };
        if vertical {
            moveable.y_force += delta;
        } else {
            moveable.x_force += delta;
        }
    }
}

/// Predators off cooldown scan their Manhattan-1 neighborhood and decrement
/// prey scores, then re-arm the cooldown.
pub fn predation(reg: &mut Registry) {
    let tick = reg.ctx::<TickCounter>().tick;
    for e in reg.entities_with::<Predation>() {
        let Ok(predation) = reg.get::<Predation>(e).copied() else {
            continue;
        };
        if tick < predation.no_predation_until_tick {
            continue;
        }
        let Ok(position) = reg.get::<Position>(e).copied() else {
            continue;
        };
        if !reg.has::<Pcg32>(e) {
            continue;
        }

        let mut victims: Vec<EntityId> = Vec::new();
        {
            let world = reg.ctx::<World>();
            for dy in -1..=1i32 {
                let x_radius = 1 - dy.abs();
                for dx in -x_radius..=x_radius {
                    let occupant = world.get(position.x + dx, position.y + dy);
                    if !occupant.is_null() && reg.has::<Scorable>(occupant) {
                        victims.push(occupant);
                    }
                }
            }
        }
        if victims.is_empty() {
            continue;
        }

        if predation.predate_all {
            for victim in &victims {
                if let Ok(scorable) = reg.get_mut::<Scorable>(*victim) {
                    scorable.score -= 1;
                }
            }
        } else {
            let pick = {
                let Ok(rng) = reg.get_mut::<Pcg32>(e) else {
                    continue;
                };
                rng.next() as usize % victims.len()
            };
            if let Ok(scorable) = reg.get_mut::<Scorable>(victims[pick]) {
                scorable.score -= 1;
            }
        }
        if let Ok(state) = reg.get_mut::<Predation>(e) {
            state.no_predation_until_tick =
                tick + u64::from(state.ticks_between_predations);
        }
    }
}

fn scored_snapshot(reg: &Registry, ranked: &[(i32, EntityId)]) -> BTreeMap<String, EventData> {
    let mut scored = BTreeMap::new();
    for (score, e) in ranked {
        let mut entry = BTreeMap::from([("score".to_owned(), EventData::I32(*score))]);
        if let Ok(name) = reg.get::<Name>(*e) {
            entry.insert("major_name".to_owned(), EventData::str(name.major.clone()));
            entry.insert("minor_name".to_owned(), EventData::str(name.minor.clone()));
        }
        scored.insert(e.to_string(), EventData::Map(entry));
    }
    scored
}

fn place_at_free_cell(
    reg: &mut Registry,
    e: EntityId,
    cell: usize,
) -> Position {
    let world = reg.ctx_mut::<World>();
    let position = Position {
        x: world.x_of(cell),
        y: world.y_of(cell),
    };
    world.map_mut()[cell] = e;
    position
}

/// The selection step. Fires when the freshly incremented tick has its low
/// 13 bits clear (every 8192 ticks; never on the very first invocation).
/// Ranks every Scorable, keeps the configured number of winners, destroys the
/// rest, spawns one mutated child per winner plus a batch of fresh entities,
/// and stages a single `evolution` event describing the generation.
pub fn evolution(reg: &mut Registry) {
    let tick = reg.ctx::<TickCounter>().tick;
    if tick & 0x1FFF != 0 {
        return;
    }
    let config = *reg.ctx::<SimConfig>();
    let winner_count = config.evo_winner_count as usize;

    let mut ranked: Vec<(i32, EntityId)> = {
        let (entities, scores) = reg.dense::<Scorable>();
        entities
            .iter()
            .zip(scores)
            .map(|(e, s)| (s.score, *e))
            .collect()
    };
    ranked.sort_by(|a, b| b.cmp(a));

    let winners: Vec<EntityId> = ranked.iter().take(winner_count).map(|(_, e)| *e).collect();
    let losers: Vec<EntityId> = ranked.iter().skip(winner_count).map(|(_, e)| *e).collect();
    let scored = scored_snapshot(reg, &ranked);

    for loser in &losers {
        if let Err(err) = destroy_entity(reg, *loser) {
            warn!(%loser, %err, "failed to destroy evolution loser");
        }
    }

    let mut available: Vec<usize> = reg
        .ctx::<World>()
        .map()
        .iter()
        .enumerate()
        .filter(|(_, occupant)| occupant.is_null())
        .map(|(index, _)| index)
        .collect();

    let mut new_entities = BTreeMap::new();

    for parent in &winners {
        if !reg.has::<Pcg32>(*parent) {
            continue;
        }
        let child = reg.create();
        if let Err(err) = reg.stamp(child, *parent) {
            warn!(%parent, %err, "failed to stamp evolution child");
            let _ = reg.destroy(child);
            continue;
        }
        let seed = match reg.get_mut::<Pcg32>(*parent) {
            Ok(rng) => u64::from(rng.next()),
            Err(_) => {
                let _ = reg.destroy(child);
                continue;
            }
        };
        let mut child_rng = Pcg32::new(seed, DEFAULT_STREAM);

        if available.is_empty() {
            warn!(tick, "no free cells for evolution child");
            let _ = reg.destroy(child);
            continue;
        }
        let pick = child_rng.next() as usize % available.len();
        let cell = available.swap_remove(pick);
        let position = place_at_free_cell(reg, child, cell);
        let _ = reg.assign(child, position);

        if let Ok(brain) = reg.get_mut::<SimpleBrain>(child) {
            let chance = brain.child_mutation_chance;
            let strength = brain.child_mutation_strength;
            for matrix in &mut brain.synapses {
                for weight in matrix.iter_mut() {
                    let roll = child_rng.unit_f32();
                    let magnitude = child_rng.unit_f32();
                    if roll <= chance {
                        *weight += ((magnitude - 0.5) * strength).clamp(-1.0, 1.0);
                    }
                }
            }
        }
        if let Ok(name) = reg.get_mut::<Name>(child) {
            name.minor = format!("T{tick}-P{parent}");
        }
        let _ = reg.assign(child, child_rng);

        new_entities.insert(
            child.to_string(),
            EventData::List(vec![EventData::str(parent.to_string())]),
        );
    }

    for i in 0..config.evo_new_entity_count {
        if available.is_empty() {
            warn!(tick, "no free cells for fresh evolution entities");
            break;
        }
        let e = reg.create();
        let mut rng = Pcg32::new(tick.wrapping_mul(3).wrapping_add(u64::from(i)), DEFAULT_STREAM);
        let mut brain = SimpleBrain::default();
        for matrix in &mut brain.synapses {
            for weight in matrix.iter_mut() {
                *weight = rng.unit_f32() * 2.0 - 1.0;
            }
        }
        let pick = rng.next() as usize % available.len();
        let cell = available.swap_remove(pick);
        let position = place_at_free_cell(reg, e, cell);

        let _ = reg.assign(
            e,
            Name {
                major: format!("T{tick}-I{i}"),
                minor: format!("T{tick}-ROOT"),
            },
        );
        let _ = reg.assign(e, position);
        let _ = reg.assign(e, brain);
        let _ = reg.assign(e, rng);
        let _ = reg.assign(e, SimpleBrainSeer::default());
        let _ = reg.assign(e, SimpleBrainMover::default());
        let _ = reg.assign(e, Moveable::default());
        let _ = reg.assign(e, Scorable::default());

        new_entities.insert(e.to_string(), EventData::List(Vec::new()));
    }

    debug!(
        tick,
        winners = winners.len(),
        losers = losers.len(),
        spawned = new_entities.len(),
        "evolution generation"
    );

    let payload = EventData::Map(BTreeMap::from([
        ("scored_entities".to_owned(), EventData::Map(scored)),
        (
            "winners".to_owned(),
            EventData::List(
                winners
                    .iter()
                    .map(|e| EventData::str(e.to_string()))
                    .collect(),
            ),
        ),
        (
            "losers".to_owned(),
            EventData::List(
                losers
                    .iter()
                    .map(|e| EventData::str(e.to_string()))
                    .collect(),
            ),
        ),
        ("new_entities".to_owned(), EventData::Map(new_entities)),
    ]));
    reg.ctx_mut::<EventsLog>().log(Event {
        name: "evolution".to_owned(),
        data: payload,
    });
}

pub fn finalize_event_log(reg: &mut Registry) {
    reg.ctx_mut::<EventsLog>().finalize();
}

/// Destroy an entity, clearing its world-map slot first if it had one.
pub fn destroy_entity(reg: &mut Registry, e: EntityId) -> Result<(), RegistryError> {
    if let Ok(position) = reg.get::<Position>(e).copied() {
        let world = reg.ctx_mut::<World>();
        let index = world.index_of(position.x, position.y);
        if world.map()[index] == e {
            world.map_mut()[index] = EntityId::NULL;
        }
    }
    reg.destroy(e)
}

/// Rebuild the world map from Position components. Tolerates any externally
/// imposed state that did not maintain the map, but rejects two entities in
/// one cell.
pub fn rebuild_world(reg: &mut Registry) -> Result<(), WorldError> {
    let placed: Vec<(EntityId, Position)> = reg
        .view::<Position>()
        .map(|(e, position)| (e, *position))
        .collect();
    let world = reg.ctx_mut::<World>();
    world.reset_map();
    for (e, position) in placed {
        let index = world.index_of(position.x, position.y);
        if !world.map()[index].is_null() {
            return Err(WorldError::PositionCollision {
                x: world.normalize_x(position.x),
                y: world.normalize_y(position.y),
            });
        }
        world.map_mut()[index] = e;
    }
    Ok(())
}
