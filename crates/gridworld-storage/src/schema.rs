//! Name-keyed dispatch tables over the component and singleton sets.
//!
//! Each entry maps a wire name to erased operations over a registry; the
//! simulation façade drives these for the per-name operations of the public
//! API. The table order is the canonical wire order.

use std::any::TypeId;
use std::sync::OnceLock;

use gridworld_core::registry::Component;
use gridworld_core::{
    rebuild_world, EntityId, EventsLog, Moveable, Name, Pcg32, Position, Predation, RandomMover,
    Registry, Scorable, SimConfig, SimpleBrain, SimpleBrainMover, SimpleBrainSeer, TickCounter,
    World,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::json::EventsLogWire;
use crate::CodecError;

/// Erased operations for one named component type.
pub struct ComponentSpec {
    pub name: &'static str,
    pub type_id: TypeId,
    pub has: fn(&Registry, EntityId) -> bool,
    pub assign_default: fn(&mut Registry, EntityId) -> Result<(), CodecError>,
    pub assign_json: fn(&mut Registry, EntityId, &Value) -> Result<(), CodecError>,
    pub remove: fn(&mut Registry, EntityId) -> Result<(), CodecError>,
    pub to_json: fn(&Registry, EntityId) -> Result<String, CodecError>,
}

/// Erased operations for one named singleton.
pub struct SingletonSpec {
    pub name: &'static str,
    pub to_json: fn(&Registry) -> Result<String, CodecError>,
    pub from_json: fn(&mut Registry, &Value) -> Result<(), CodecError>,
}

trait WireComponent: Component + Default + Serialize + DeserializeOwned {
    const NAME: &'static str;

    fn check(&self) -> Result<(), CodecError> {
        Ok(())
    }
}

impl WireComponent for Position {
    const NAME: &'static str = "Position";
}

impl WireComponent for Moveable {
    const NAME: &'static str = "Moveable";
}

impl WireComponent for Name {
    const NAME: &'static str = "Name";
}

impl WireComponent for Pcg32 {
    const NAME: &'static str = "RNG";
}

impl WireComponent for SimpleBrain {
    const NAME: &'static str = "SimpleBrain";

    fn check(&self) -> Result<(), CodecError> {
        self.validate()
            .map_err(|err| CodecError::invalid(err.to_string()))
    }
}

impl WireComponent for SimpleBrainSeer {
    const NAME: &'static str = "SimpleBrainSeer";
}

impl WireComponent for SimpleBrainMover {
    const NAME: &'static str = "SimpleBrainMover";
}

impl WireComponent for Predation {
    const NAME: &'static str = "Predation";
}

impl WireComponent for Scorable {
    const NAME: &'static str = "Scorable";
}

fn typed_spec<T: WireComponent>() -> ComponentSpec {
    ComponentSpec {
        name: T::NAME,
        type_id: TypeId::of::<T>(),
        has: |reg, e| reg.has::<T>(e),
        assign_default: |reg, e| {
            reg.assign(e, T::default())?;
            Ok(())
        },
        assign_json: |reg, e, value| {
            let com: T = serde_json::from_value(value.clone())
                .map_err(|err| CodecError::invalid(err.to_string()))?;
            com.check()?;
            reg.assign(e, com)?;
            Ok(())
        },
        remove: |reg, e| {
            reg.remove::<T>(e)?;
            Ok(())
        },
        to_json: |reg, e| {
            let com = reg.get::<T>(e)?;
            serde_json::to_string(com).map_err(|err| CodecError::invalid(err.to_string()))
        },
    }
}

fn tag_spec<T: Component + Default>(name: &'static str) -> ComponentSpec {
    ComponentSpec {
        name,
        type_id: TypeId::of::<T>(),
        has: |reg, e| reg.has::<T>(e),
        assign_default: |reg, e| {
            reg.assign(e, T::default())?;
            Ok(())
        },
        // Tags carry no payload; any supplied value is ignored.
        assign_json: |reg, e, _value| {
            reg.assign(e, T::default())?;
            Ok(())
        },
        remove: |reg, e| {
            reg.remove::<T>(e)?;
            Ok(())
        },
        to_json: |reg, e| {
            reg.get::<T>(e)?;
            Ok("null".to_owned())
        },
    }
}

/// The component dispatch table, in canonical wire order.
pub fn component_specs() -> &'static [ComponentSpec] {
    static SPECS: OnceLock<Vec<ComponentSpec>> = OnceLock::new();
    SPECS.get_or_init(|| {
        vec![
            typed_spec::<Position>(),
            typed_spec::<Moveable>(),
            typed_spec::<Name>(),
            typed_spec::<Pcg32>(),
            typed_spec::<SimpleBrain>(),
            typed_spec::<SimpleBrainSeer>(),
            typed_spec::<SimpleBrainMover>(),
            typed_spec::<Predation>(),
            typed_spec::<Scorable>(),
            tag_spec::<RandomMover>("RandomMover"),
        ]
    })
}

/// Look up a component spec by wire name.
pub fn component_spec(name: &str) -> Result<&'static ComponentSpec, CodecError> {
    component_specs()
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| CodecError::UnknownComponent(name.to_owned()))
}

/// The singleton dispatch table, in canonical wire order.
pub fn singleton_specs() -> &'static [SingletonSpec] {
    static SPECS: OnceLock<Vec<SingletonSpec>> = OnceLock::new();
    SPECS.get_or_init(|| {
        vec![
            SingletonSpec {
                name: "SSimulationConfig",
                to_json: |reg| {
                    serde_json::to_string(reg.ctx::<SimConfig>())
                        .map_err(|err| CodecError::invalid(err.to_string()))
                },
                from_json: |reg, value| {
                    let config: SimConfig = serde_json::from_value(value.clone())
                        .map_err(|err| CodecError::invalid(err.to_string()))?;
                    reg.set_ctx(config);
                    Ok(())
                },
            },
            SingletonSpec {
                name: "STickCounter",
                to_json: |reg| Ok(reg.ctx::<TickCounter>().tick.to_string()),
                from_json: |reg, value| {
                    let tick = value.as_u64().ok_or_else(|| {
                        CodecError::invalid("STickCounter must be an unsigned integer")
                    })?;
                    reg.set_ctx(TickCounter { tick });
                    Ok(())
                },
            },
            SingletonSpec {
                name: "SWorld",
                to_json: |reg| {
                    serde_json::to_string(reg.ctx::<World>())
                        .map_err(|err| CodecError::invalid(err.to_string()))
                },
                // Resizing resets the map, so it is rebuilt from Positions
                // before the new state becomes observable.
                from_json: |reg, value| {
                    let world: World = serde_json::from_value(value.clone())
                        .map_err(|err| CodecError::invalid(err.to_string()))?;
                    reg.set_ctx(world);
                    rebuild_world(reg)?;
                    Ok(())
                },
            },
            SingletonSpec {
                name: "SEventsLog",
                to_json: |reg| {
                    let wire = EventsLogWire {
                        events_last_tick: reg.ctx::<EventsLog>().events_last_tick.clone(),
                    };
                    serde_json::to_string(&wire)
                        .map_err(|err| CodecError::invalid(err.to_string()))
                },
                from_json: |reg, value| {
                    let wire: EventsLogWire = serde_json::from_value(value.clone())
                        .map_err(|err| CodecError::invalid(err.to_string()))?;
                    reg.set_ctx(EventsLog {
                        events_last_tick: wire.events_last_tick,
                        new_events: Vec::new(),
                    });
                    Ok(())
                },
            },
            SingletonSpec {
                name: "RNG",
                to_json: |reg| {
                    serde_json::to_string(reg.ctx::<Pcg32>())
                        .map_err(|err| CodecError::invalid(err.to_string()))
                },
                from_json: |reg, value| {
                    let rng: Pcg32 = serde_json::from_value(value.clone())
                        .map_err(|err| CodecError::invalid(err.to_string()))?;
                    reg.set_ctx(rng);
                    Ok(())
                },
            },
        ]
    })
}

/// Look up a singleton spec by wire name.
pub fn singleton_spec(name: &str) -> Result<&'static SingletonSpec, CodecError> {
    singleton_specs()
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| CodecError::UnknownSingleton(name.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_names_match_wire_order() {
        let names: Vec<_> = component_specs().iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "Position",
                "Moveable",
                "Name",
                "RNG",
                "SimpleBrain",
                "SimpleBrainSeer",
                "SimpleBrainMover",
                "Predation",
                "Scorable",
                "RandomMover",
            ]
        );
    }

    #[test]
    fn singleton_names_match_wire_order() {
        let names: Vec<_> = singleton_specs().iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "SSimulationConfig",
                "STickCounter",
                "SWorld",
                "SEventsLog",
                "RNG",
            ]
        );
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(matches!(
            component_spec("Nope"),
            Err(CodecError::UnknownComponent(_))
        ));
        assert!(matches!(
            singleton_spec("Nope"),
            Err(CodecError::UnknownSingleton(_))
        ));
    }

    #[test]
    fn assign_json_round_trips_through_to_json() {
        let mut reg = Registry::new();
        let e = reg.create();
        let spec = component_spec("Position").expect("spec");
        let value: Value = serde_json::from_str(r#"{"x": 3, "y": -1}"#).expect("value");
        (spec.assign_json)(&mut reg, e, &value).expect("assign");
        assert!((spec.has)(&reg, e));
        let json = (spec.to_json)(&reg, e).expect("to_json");
        assert_eq!(json, r#"{"x":3,"y":-1}"#);
        (spec.remove)(&mut reg, e).expect("remove");
        assert!(!(spec.has)(&reg, e));
    }

    #[test]
    fn assign_default_uses_component_defaults() {
        let mut reg = Registry::new();
        let e = reg.create();
        let spec = component_spec("SimpleBrainSeer").expect("spec");
        (spec.assign_default)(&mut reg, e).expect("assign");
        let seer = reg.get::<SimpleBrainSeer>(e).expect("seer");
        assert_eq!(seer.neuron_offset, 1);
        assert_eq!(seer.sight_radius, 2);
    }

    #[test]
    fn tag_spec_ignores_payload_and_reports_null() {
        let mut reg = Registry::new();
        let e = reg.create();
        let spec = component_spec("RandomMover").expect("spec");
        let value = Value::Bool(true);
        (spec.assign_json)(&mut reg, e, &value).expect("assign");
        assert_eq!((spec.to_json)(&reg, e).expect("to_json"), "null");
    }

    #[test]
    fn invalid_brain_payload_is_rejected() {
        let mut reg = Registry::new();
        let e = reg.create();
        let spec = component_spec("SimpleBrain").expect("spec");
        let value: Value = serde_json::from_str(
            r#"{
                "child_mutation_chance": 0.5,
                "child_mutation_strength": 0.2,
                "synapses": [[[0.0], [0.0]]],
                "neurons": [[1.0, 1.0], [1.0, 1.0]]
            }"#,
        )
        .expect("value");
        assert!(matches!(
            (spec.assign_json)(&mut reg, e, &value),
            Err(CodecError::Invalid(_))
        ));
        assert!(!reg.has::<SimpleBrain>(e));
    }

    #[test]
    fn sworld_from_json_rebuilds_the_map() {
        let mut reg = Registry::new();
        let e = reg.create();
        reg.assign(e, Position { x: 1, y: 1 }).expect("assign");
        let spec = singleton_spec("SWorld").expect("spec");
        let value: Value = serde_json::from_str(r#"{"width": 3, "height": 3}"#).expect("value");
        (spec.from_json)(&mut reg, &value).expect("from_json");
        assert_eq!(reg.ctx::<World>().get(1, 1), e);
    }

    #[test]
    fn stickcounter_uses_bare_integer_form() {
        let mut reg = Registry::new();
        reg.ctx_mut::<TickCounter>().tick = 42;
        let spec = singleton_spec("STickCounter").expect("spec");
        assert_eq!((spec.to_json)(&reg).expect("to_json"), "42");
        (spec.from_json)(&mut reg, &Value::from(7u64)).expect("from_json");
        assert_eq!(reg.ctx::<TickCounter>().tick, 7);
    }
}
