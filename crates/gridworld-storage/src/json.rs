//! The JSON state envelope.
//!
//! Typed `serde` parsing is the schema gate: a payload that does not match
//! the envelope shape fails before any registry is touched. Key order on
//! write follows struct declaration order, so serializing the same state
//! twice yields identical bytes.

use gridworld_core::registry::Component;
use gridworld_core::{
    rebuild_world, EntityId, Event, EventsLog, Moveable, Name, Pcg32, Position, Predation,
    RandomMover, Registry, Scorable, SimConfig, SimpleBrain, SimpleBrainMover, SimpleBrainSeer,
    TickCounter, World,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::CodecError;

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ComEntry<T> {
    #[serde(rename = "EID")]
    pub eid: u64,
    #[serde(rename = "Com")]
    pub com: T,
}

#[derive(Serialize, Deserialize, Default)]
pub(crate) struct EventsLogWire {
    pub events_last_tick: Vec<Event>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SingletonsWire {
    // Optional across source revisions; always emitted on write.
    #[serde(
        rename = "SSimulationConfig",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    config: Option<SimConfig>,
    #[serde(rename = "STickCounter")]
    tick: u64,
    #[serde(rename = "SWorld")]
    world: World,
    #[serde(rename = "SEventsLog")]
    events: EventsLogWire,
    #[serde(rename = "RNG", default, skip_serializing_if = "Option::is_none")]
    rng: Option<Pcg32>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ComponentsWire {
    #[serde(rename = "Position")]
    position: Vec<ComEntry<Position>>,
    #[serde(rename = "Moveable")]
    moveable: Vec<ComEntry<Moveable>>,
    #[serde(rename = "Name")]
    name: Vec<ComEntry<Name>>,
    #[serde(rename = "RNG")]
    rng: Vec<ComEntry<Pcg32>>,
    #[serde(rename = "SimpleBrain")]
    simple_brain: Vec<ComEntry<SimpleBrain>>,
    #[serde(rename = "SimpleBrainSeer")]
    simple_brain_seer: Vec<ComEntry<SimpleBrainSeer>>,
    #[serde(rename = "SimpleBrainMover")]
    simple_brain_mover: Vec<ComEntry<SimpleBrainMover>>,
    #[serde(rename = "Predation")]
    predation: Vec<ComEntry<Predation>>,
    #[serde(rename = "Scorable")]
    scorable: Vec<ComEntry<Scorable>>,
    #[serde(rename = "RandomMover")]
    random_mover: Vec<u64>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StateWire {
    entities: Vec<u64>,
    singletons: SingletonsWire,
    components: ComponentsWire,
}

fn collect<T: Component>(reg: &Registry) -> Vec<ComEntry<T>> {
    reg.view::<T>()
        .map(|(e, com)| ComEntry {
            eid: e.raw(),
            com: com.clone(),
        })
        .collect()
}

/// Serialize a registry into the canonical JSON envelope.
pub fn state_to_json(reg: &Registry) -> Result<String, CodecError> {
    let wire = StateWire {
        entities: reg.raw_entities().iter().map(|e| e.raw()).collect(),
        singletons: SingletonsWire {
            config: Some(*reg.ctx::<SimConfig>()),
            tick: reg.ctx::<TickCounter>().tick,
            world: reg.ctx::<World>().clone(),
            events: EventsLogWire {
                events_last_tick: reg.ctx::<EventsLog>().events_last_tick.clone(),
            },
            rng: Some(reg.ctx::<Pcg32>().clone()),
        },
        components: ComponentsWire {
            position: collect(reg),
            moveable: collect(reg),
            name: collect(reg),
            rng: collect(reg),
            simple_brain: collect(reg),
            simple_brain_seer: collect(reg),
            simple_brain_mover: collect(reg),
            predation: collect(reg),
            scorable: collect(reg),
            random_mover: reg
                .dense::<RandomMover>()
                .0
                .iter()
                .map(|e| e.raw())
                .collect(),
        },
    };
    serde_json::to_string(&wire).map_err(|err| CodecError::invalid(err.to_string()))
}

fn assign_entries<T>(reg: &mut Registry, entries: Vec<ComEntry<T>>) -> Result<(), CodecError>
where
    T: Component + DeserializeOwned,
{
    for entry in entries {
        reg.assign(EntityId::from_raw(entry.eid), entry.com)?;
    }
    Ok(())
}

/// Parse the canonical JSON envelope into a fresh registry.
///
/// The world map is rebuilt from Position components; two entities sharing a
/// cell is a state corruption, not a parse error.
pub fn state_from_json(json: &str) -> Result<Registry, CodecError> {
    let wire: StateWire =
        serde_json::from_str(json).map_err(|err| CodecError::invalid(err.to_string()))?;
    build_registry(wire)
}

fn build_registry(wire: StateWire) -> Result<Registry, CodecError> {
    let mut reg = Registry::new();
    reg.set_entities(
        wire.entities
            .into_iter()
            .map(EntityId::from_raw)
            .collect(),
    )?;

    reg.set_ctx(TickCounter {
        tick: wire.singletons.tick,
    });
    reg.set_ctx(wire.singletons.world);
    reg.set_ctx(EventsLog {
        events_last_tick: wire.singletons.events.events_last_tick,
        new_events: Vec::new(),
    });
    reg.set_ctx(wire.singletons.config.unwrap_or_default());
    reg.set_ctx(wire.singletons.rng.unwrap_or_default());

    for entry in &wire.components.simple_brain {
        entry
            .com
            .validate()
            .map_err(|err| CodecError::invalid(err.to_string()))?;
    }

    assign_entries(&mut reg, wire.components.position)?;
    assign_entries(&mut reg, wire.components.moveable)?;
    assign_entries(&mut reg, wire.components.name)?;
    assign_entries(&mut reg, wire.components.rng)?;
    assign_entries(&mut reg, wire.components.simple_brain)?;
    assign_entries(&mut reg, wire.components.simple_brain_seer)?;
    assign_entries(&mut reg, wire.components.simple_brain_mover)?;
    assign_entries(&mut reg, wire.components.predation)?;
    assign_entries(&mut reg, wire.components.scorable)?;
    for eid in wire.components.random_mover {
        reg.assign(EntityId::from_raw(eid), RandomMover)?;
    }

    rebuild_world(&mut reg)?;
    Ok(reg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_registry() -> Registry {
        let mut reg = Registry::new();
        reg.set_ctx(World::sized(4, 4));
        reg.ctx_mut::<TickCounter>().tick = 17;
        let a = reg.create();
        reg.assign(a, Position { x: 1, y: 2 }).expect("assign");
        reg.assign(a, Moveable { x_force: 0, y_force: 0 })
            .expect("assign");
        reg.assign(a, Pcg32::new(5, 6)).expect("assign");
        reg.assign(a, RandomMover).expect("assign");
        let b = reg.create();
        reg.assign(b, Position { x: 3, y: 0 }).expect("assign");
        reg.assign(b, Scorable { score: -4 }).expect("assign");
        reg.assign(
            b,
            Name {
                major: "maj".into(),
                minor: "min".into(),
            },
        )
        .expect("assign");
        reg.assign(b, SimpleBrain::default()).expect("assign");
        reg.assign(b, SimpleBrainSeer::default()).expect("assign");
        reg.assign(b, SimpleBrainMover::default()).expect("assign");
        let c = reg.create();
        reg.destroy(c).expect("destroy");
        rebuild_world(&mut reg).expect("rebuild");
        reg
    }

    #[test]
    fn json_round_trip_is_bitwise_stable() {
        let reg = seeded_registry();
        let first = state_to_json(&reg).expect("serialize");
        let restored = state_from_json(&first).expect("deserialize");
        let second = state_to_json(&restored).expect("reserialize");
        assert_eq!(first, second);
    }

    #[test]
    fn envelope_keys_follow_canonical_order() {
        let reg = seeded_registry();
        let json = state_to_json(&reg).expect("serialize");
        let entities = json.find("\"entities\"").expect("entities key");
        let singletons = json.find("\"singletons\"").expect("singletons key");
        let components = json.find("\"components\"").expect("components key");
        assert!(entities < singletons && singletons < components);
        let position = json.find("\"Position\"").expect("Position key");
        let random_mover = json.find("\"RandomMover\"").expect("RandomMover key");
        assert!(position < random_mover);
    }

    #[test]
    fn missing_optional_singletons_fall_back_to_defaults() {
        let json = r#"{
            "entities": [],
            "singletons": {
                "STickCounter": 3,
                "SWorld": {"width": 2, "height": 2},
                "SEventsLog": {"events_last_tick": []}
            },
            "components": {
                "Position": [], "Moveable": [], "Name": [], "RNG": [],
                "SimpleBrain": [], "SimpleBrainSeer": [], "SimpleBrainMover": [],
                "Predation": [], "Scorable": [], "RandomMover": []
            }
        }"#;
        let reg = state_from_json(json).expect("deserialize");
        assert_eq!(reg.ctx::<TickCounter>().tick, 3);
        assert_eq!(reg.ctx::<SimConfig>().evo_winner_count, 6);
        assert_eq!(reg.ctx::<Pcg32>(), &Pcg32::default());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            state_from_json("{"),
            Err(CodecError::Invalid(_))
        ));
        assert!(matches!(
            state_from_json(r#"{"entities": "not an array"}"#),
            Err(CodecError::Invalid(_))
        ));
    }

    #[test]
    fn component_on_unknown_entity_is_rejected() {
        let json = r#"{
            "entities": [],
            "singletons": {
                "STickCounter": 0,
                "SWorld": {"width": 2, "height": 2},
                "SEventsLog": {"events_last_tick": []}
            },
            "components": {
                "Position": [{"EID": 9, "Com": {"x": 0, "y": 0}}],
                "Moveable": [], "Name": [], "RNG": [],
                "SimpleBrain": [], "SimpleBrainSeer": [], "SimpleBrainMover": [],
                "Predation": [], "Scorable": [], "RandomMover": []
            }
        }"#;
        assert!(matches!(
            state_from_json(json),
            Err(CodecError::Registry(_))
        ));
    }

    #[test]
    fn colliding_positions_are_rejected_on_load() {
        let json = r#"{
            "entities": [0, 1],
            "singletons": {
                "STickCounter": 0,
                "SWorld": {"width": 2, "height": 2},
                "SEventsLog": {"events_last_tick": []}
            },
            "components": {
                "Position": [
                    {"EID": 0, "Com": {"x": 0, "y": 0}},
                    {"EID": 1, "Com": {"x": 2, "y": 2}}
                ],
                "Moveable": [], "Name": [], "RNG": [],
                "SimpleBrain": [], "SimpleBrainSeer": [], "SimpleBrainMover": [],
                "Predation": [], "Scorable": [], "RandomMover": []
            }
        }"#;
        assert!(matches!(state_from_json(json), Err(CodecError::World(_))));
    }

    #[test]
    fn invalid_brain_topology_is_rejected_on_load() {
        let json = r#"{
            "entities": [0],
            "singletons": {
                "STickCounter": 0,
                "SWorld": {"width": 2, "height": 2},
                "SEventsLog": {"events_last_tick": []}
            },
            "components": {
                "Position": [], "Moveable": [], "Name": [], "RNG": [],
                "SimpleBrain": [{"EID": 0, "Com": {
                    "child_mutation_chance": 0.5,
                    "child_mutation_strength": 0.2,
                    "synapses": [[[0.0, 0.0], [0.0, 0.0]]],
                    "neurons": [[1.0, 1.0], [1.0, 1.0, 1.0]]
                }}],
                "SimpleBrainSeer": [], "SimpleBrainMover": [],
                "Predation": [], "Scorable": [], "RandomMover": []
            }
        }"#;
        assert!(matches!(state_from_json(json), Err(CodecError::Invalid(_))));
    }

    #[test]
    fn unknown_envelope_keys_are_rejected() {
        let extra_top_level = r#"{
            "entities": [],
            "bogus": true,
            "singletons": {
                "STickCounter": 0,
                "SWorld": {"width": 2, "height": 2},
                "SEventsLog": {"events_last_tick": []}
            },
            "components": {
                "Position": [], "Moveable": [], "Name": [], "RNG": [],
                "SimpleBrain": [], "SimpleBrainSeer": [], "SimpleBrainMover": [],
                "Predation": [], "Scorable": [], "RandomMover": []
            }
        }"#;
        assert!(matches!(
            state_from_json(extra_top_level),
            Err(CodecError::Invalid(_))
        ));

        let misspelled_singleton = r#"{
            "entities": [],
            "singletons": {
                "STickCounter": 0,
                "SWorld": {"width": 2, "height": 2},
                "SEventsLog": {"events_last_tick": []},
                "STickCouner": 1
            },
            "components": {
                "Position": [], "Moveable": [], "Name": [], "RNG": [],
                "SimpleBrain": [], "SimpleBrainSeer": [], "SimpleBrainMover": [],
                "Predation": [], "Scorable": [], "RandomMover": []
            }
        }"#;
        assert!(matches!(
            state_from_json(misspelled_singleton),
            Err(CodecError::Invalid(_))
        ));

        let extra_entry_key = r#"{
            "entities": [0],
            "singletons": {
                "STickCounter": 0,
                "SWorld": {"width": 2, "height": 2},
                "SEventsLog": {"events_last_tick": []}
            },
            "components": {
                "Position": [{"EID": 0, "Com": {"x": 0, "y": 0}, "Extra": 1}],
                "Moveable": [], "Name": [], "RNG": [],
                "SimpleBrain": [], "SimpleBrainSeer": [], "SimpleBrainMover": [],
                "Predation": [], "Scorable": [], "RandomMover": []
            }
        }"#;
        assert!(matches!(
            state_from_json(extra_entry_key),
            Err(CodecError::Invalid(_))
        ));
    }

    #[test]
    fn events_survive_the_round_trip() {
        use gridworld_core::EventData;
        let mut reg = Registry::new();
        reg.set_ctx(EventsLog {
            events_last_tick: vec![Event {
                name: "evolution".into(),
                data: EventData::List(vec![EventData::I32(1), EventData::Null]),
            }],
            new_events: Vec::new(),
        });
        let json = state_to_json(&reg).expect("serialize");
        let restored = state_from_json(&json).expect("deserialize");
        assert_eq!(
            restored.ctx::<EventsLog>().events_last_tick,
            reg.ctx::<EventsLog>().events_last_tick
        );
    }
}
