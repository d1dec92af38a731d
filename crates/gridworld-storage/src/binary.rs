//! Compact binary state envelope.
//!
//! All integers are little-endian. Strings are `len:u64` + UTF-8 bytes,
//! sequences are `count:u64` + items, maps are `count:u64` + (key, value)
//! pairs. Component arrays pack `count`, the entity-id array, then the
//! values. The byte layout is contractual, so everything is written by hand
//! rather than through a general-purpose serializer.

use gridworld_core::registry::Component;
use gridworld_core::{
    rebuild_world, EntityId, Event, EventData, EventsLog, Moveable, Name, Pcg32, Position,
    Predation, RandomMover, Registry, Scorable, SimConfig, SimpleBrain, SimpleBrainMover,
    SimpleBrainSeer, TickCounter, World,
};
use ndarray::{Array1, Array2};

use crate::CodecError;

// ── Primitive writers ───────────────────────────────────────────

fn write_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_bool(out: &mut Vec<u8>, v: bool) {
    out.push(u8::from(v));
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    write_u64(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

// ── Primitive reader ────────────────────────────────────────────

pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::invalid("unexpected end of binary state"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    fn read_i32(&mut self) -> Result<i32, CodecError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(bytes))
    }

    fn read_f32(&mut self) -> Result<f32, CodecError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(f32::from_le_bytes(bytes))
    }

    fn read_f64(&mut self) -> Result<f64, CodecError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(bytes))
    }

    fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::invalid(format!("invalid bool byte {other}"))),
        }
    }

    fn read_count(&mut self) -> Result<usize, CodecError> {
        let count = self.read_u64()?;
        usize::try_from(count)
            .map_err(|_| CodecError::invalid(format!("count {count} exceeds address space")))
    }

    fn read_str(&mut self) -> Result<String, CodecError> {
        let len = self.read_count()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| CodecError::invalid(format!("invalid UTF-8 string: {err}")))
    }
}

// ── Event payloads ──────────────────────────────────────────────

fn write_event_data(out: &mut Vec<u8>, data: &EventData) {
    match data {
        EventData::Null => write_u8(out, 0),
        EventData::I32(v) => {
            write_u8(out, 1);
            write_i32(out, *v);
        }
        EventData::F64(v) => {
            write_u8(out, 2);
            write_f64(out, *v);
        }
        EventData::Str(v) => {
            write_u8(out, 3);
            write_str(out, v);
        }
        EventData::Map(map) => {
            write_u8(out, 4);
            write_u64(out, map.len() as u64);
            for (key, value) in map {
                write_str(out, key);
                write_event_data(out, value);
            }
        }
        EventData::List(items) => {
            write_u8(out, 5);
            write_u64(out, items.len() as u64);
            for item in items {
                write_event_data(out, item);
            }
        }
    }
}

fn read_event_data(r: &mut ByteReader<'_>) -> Result<EventData, CodecError> {
    match r.read_u8()? {
        0 => Ok(EventData::Null),
        1 => Ok(EventData::I32(r.read_i32()?)),
        2 => Ok(EventData::F64(r.read_f64()?)),
        3 => Ok(EventData::Str(r.read_str()?)),
        4 => {
            let count = r.read_count()?;
            let mut map = std::collections::BTreeMap::new();
            for _ in 0..count {
                let key = r.read_str()?;
                let value = read_event_data(r)?;
                map.insert(key, value);
            }
            Ok(EventData::Map(map))
        }
        5 => {
            let count = r.read_count()?;
            let mut items = Vec::new();
            for _ in 0..count {
                items.push(read_event_data(r)?);
            }
            Ok(EventData::List(items))
        }
        tag => Err(CodecError::invalid(format!("invalid variant tag {tag}"))),
    }
}

fn write_event(out: &mut Vec<u8>, event: &Event) {
    write_str(out, &event.name);
    write_event_data(out, &event.data);
}

fn read_event(r: &mut ByteReader<'_>) -> Result<Event, CodecError> {
    Ok(Event {
        name: r.read_str()?,
        data: read_event_data(r)?,
    })
}

// ── Matrices ────────────────────────────────────────────────────

fn write_matrix(out: &mut Vec<u8>, matrix: &Array2<f32>) {
    let (rows, cols) = matrix.dim();
    write_u64(out, rows as u64);
    write_u64(out, cols as u64);
    for row in matrix.rows() {
        for v in row {
            write_f32(out, *v);
        }
    }
}

fn read_matrix(r: &mut ByteReader<'_>) -> Result<Array2<f32>, CodecError> {
    let rows = r.read_count()?;
    let cols = r.read_count()?;
    let total = rows
        .checked_mul(cols)
        .ok_or_else(|| CodecError::invalid("matrix dimensions overflow"))?;
    let mut flat = Vec::new();
    for _ in 0..total {
        flat.push(r.read_f32()?);
    }
    Array2::from_shape_vec((rows, cols), flat)
        .map_err(|err| CodecError::invalid(err.to_string()))
}

fn write_row(out: &mut Vec<u8>, row: &Array1<f32>) {
    write_u64(out, row.len() as u64);
    for v in row {
        write_f32(out, *v);
    }
}

fn read_row(r: &mut ByteReader<'_>) -> Result<Array1<f32>, CodecError> {
    let cols = r.read_count()?;
    let mut values = Vec::new();
    for _ in 0..cols {
        values.push(r.read_f32()?);
    }
    Ok(Array1::from_vec(values))
}

// ── Per-component codecs ────────────────────────────────────────

trait BinaryComponent: Component {
    fn write(out: &mut Vec<u8>, value: &Self);
    fn read(r: &mut ByteReader<'_>) -> Result<Self, CodecError>;
}

impl BinaryComponent for Position {
    fn write(out: &mut Vec<u8>, value: &Self) {
        write_i32(out, value.x);
        write_i32(out, value.y);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            x: r.read_i32()?,
            y: r.read_i32()?,
        })
    }
}

impl BinaryComponent for Moveable {
    fn write(out: &mut Vec<u8>, value: &Self) {
        write_i32(out, value.x_force);
        write_i32(out, value.y_force);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            x_force: r.read_i32()?,
            y_force: r.read_i32()?,
        })
    }
}

impl BinaryComponent for Name {
    fn write(out: &mut Vec<u8>, value: &Self) {
        write_str(out, &value.major);
        write_str(out, &value.minor);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            major: r.read_str()?,
            minor: r.read_str()?,
        })
    }
}

impl BinaryComponent for Pcg32 {
    fn write(out: &mut Vec<u8>, value: &Self) {
        write_u64(out, value.state());
        write_u64(out, value.stream());
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let state = r.read_u64()?;
        let stream = r.read_u64()?;
        Ok(Self::from_parts(state, stream))
    }
}

impl BinaryComponent for SimpleBrain {
    fn write(out: &mut Vec<u8>, value: &Self) {
        write_f32(out, value.child_mutation_chance);
        write_f32(out, value.child_mutation_strength);
        write_u64(out, value.synapses.len() as u64);
        for matrix in &value.synapses {
            write_matrix(out, matrix);
        }
        write_u64(out, value.neurons.len() as u64);
        for row in &value.neurons {
            write_row(out, row);
        }
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let child_mutation_chance = r.read_f32()?;
        let child_mutation_strength = r.read_f32()?;
        let synapse_count = r.read_count()?;
        let mut synapses = Vec::new();
        for _ in 0..synapse_count {
            synapses.push(read_matrix(r)?);
        }
        let neuron_count = r.read_count()?;
        let mut neurons = Vec::new();
        for _ in 0..neuron_count {
            neurons.push(read_row(r)?);
        }
        let brain = Self {
            synapses,
            neurons,
            child_mutation_chance,
            child_mutation_strength,
        };
        brain
            .validate()
            .map_err(|err| CodecError::invalid(err.to_string()))?;
        Ok(brain)
    }
}

impl BinaryComponent for SimpleBrainSeer {
    fn write(out: &mut Vec<u8>, value: &Self) {
        write_i32(out, value.neuron_offset);
        write_i32(out, value.sight_radius);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            neuron_offset: r.read_i32()?,
            sight_radius: r.read_i32()?,
        })
    }
}

impl BinaryComponent for SimpleBrainMover {
    fn write(out: &mut Vec<u8>, value: &Self) {
        write_i32(out, value.neuron_offset);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            neuron_offset: r.read_i32()?,
        })
    }
}

impl BinaryComponent for Predation {
    fn write(out: &mut Vec<u8>, value: &Self) {
        write_u64(out, value.no_predation_until_tick);
        write_u32(out, value.ticks_between_predations);
        write_bool(out, value.predate_all);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            no_predation_until_tick: r.read_u64()?,
            ticks_between_predations: r.read_u32()?,
            predate_all: r.read_bool()?,
        })
    }
}

impl BinaryComponent for Scorable {
    fn write(out: &mut Vec<u8>, value: &Self) {
        write_i32(out, value.score);
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            score: r.read_i32()?,
        })
    }
}

fn write_component_array<T: BinaryComponent>(reg: &Registry, out: &mut Vec<u8>) {
    let (entities, values) = reg.dense::<T>();
    write_u64(out, entities.len() as u64);
    for e in entities {
        write_u64(out, e.raw());
    }
    for value in values {
        T::write(out, value);
    }
}

fn read_component_array<T: BinaryComponent>(
    reg: &mut Registry,
    r: &mut ByteReader<'_>,
) -> Result<(), CodecError> {
    let count = r.read_count()?;
    let mut entities = Vec::new();
    for _ in 0..count {
        entities.push(EntityId::from_raw(r.read_u64()?));
    }
    for e in entities {
        let value = T::read(r)?;
        reg.assign(e, value)?;
    }
    Ok(())
}

fn write_tag_array<T: Component>(reg: &Registry, out: &mut Vec<u8>) {
    let (entities, _) = reg.dense::<T>();
    write_u64(out, entities.len() as u64);
    for e in entities {
        write_u64(out, e.raw());
    }
}

fn read_tag_array<T: Component + Default>(
    reg: &mut Registry,
    r: &mut ByteReader<'_>,
) -> Result<(), CodecError> {
    let count = r.read_count()?;
    for _ in 0..count {
        let e = EntityId::from_raw(r.read_u64()?);
        reg.assign(e, T::default())?;
    }
    Ok(())
}

// ── Whole-state envelope ────────────────────────────────────────

/// Pack a registry into the compact binary envelope.
pub fn state_to_binary(reg: &Registry) -> Vec<u8> {
    let mut out = Vec::new();

    let entities = reg.raw_entities();
    write_u64(&mut out, entities.len() as u64);
    for e in entities {
        write_u64(&mut out, e.raw());
    }

    let config = reg.ctx::<SimConfig>();
    write_u32(&mut out, config.evo_ticks_per_evolution);
    write_u32(&mut out, config.evo_winner_count);
    write_u32(&mut out, config.evo_new_entity_count);

    write_u64(&mut out, reg.ctx::<TickCounter>().tick);

    let world = reg.ctx::<World>();
    write_i32(&mut out, world.width());
    write_i32(&mut out, world.height());

    let events = &reg.ctx::<EventsLog>().events_last_tick;
    write_u64(&mut out, events.len() as u64);
    for event in events {
        write_event(&mut out, event);
    }

    let rng = reg.ctx::<Pcg32>();
    write_u64(&mut out, rng.state());
    write_u64(&mut out, rng.stream());

    write_component_array::<Position>(reg, &mut out);
    write_component_array::<Moveable>(reg, &mut out);
    write_component_array::<Name>(reg, &mut out);
    write_component_array::<Pcg32>(reg, &mut out);
    write_component_array::<SimpleBrain>(reg, &mut out);
    write_component_array::<SimpleBrainSeer>(reg, &mut out);
    write_component_array::<SimpleBrainMover>(reg, &mut out);
    write_component_array::<Predation>(reg, &mut out);
    write_component_array::<Scorable>(reg, &mut out);
    write_tag_array::<RandomMover>(reg, &mut out);

    out
}

/// Parse the compact binary envelope into a fresh registry.
pub fn state_from_binary(bytes: &[u8]) -> Result<Registry, CodecError> {
    let mut r = ByteReader::new(bytes);
    let mut reg = Registry::new();

    let entity_count = r.read_count()?;
    let mut entities = Vec::new();
    for _ in 0..entity_count {
        entities.push(EntityId::from_raw(r.read_u64()?));
    }
    reg.set_entities(entities)?;

    reg.set_ctx(SimConfig {
        evo_ticks_per_evolution: r.read_u32()?,
        evo_winner_count: r.read_u32()?,
        evo_new_entity_count: r.read_u32()?,
    });

    reg.set_ctx(TickCounter {
        tick: r.read_u64()?,
    });

    let width = r.read_i32()?;
    let height = r.read_i32()?;
    if width <= 0 || height <= 0 {
        return Err(CodecError::invalid(format!(
            "world dimensions {width}x{height} must be positive"
        )));
    }
    reg.set_ctx(World::sized(width, height));

    let event_count = r.read_count()?;
    let mut events_last_tick = Vec::new();
    for _ in 0..event_count {
        events_last_tick.push(read_event(&mut r)?);
    }
    reg.set_ctx(EventsLog {
        events_last_tick,
        new_events: Vec::new(),
    });

    let state = r.read_u64()?;
    let stream = r.read_u64()?;
    reg.set_ctx(Pcg32::from_parts(state, stream));

    read_component_array::<Position>(&mut reg, &mut r)?;
    read_component_array::<Moveable>(&mut reg, &mut r)?;
    read_component_array::<Name>(&mut reg, &mut r)?;
    read_component_array::<Pcg32>(&mut reg, &mut r)?;
    read_component_array::<SimpleBrain>(&mut reg, &mut r)?;
    read_component_array::<SimpleBrainSeer>(&mut reg, &mut r)?;
    read_component_array::<SimpleBrainMover>(&mut reg, &mut r)?;
    read_component_array::<Predation>(&mut reg, &mut r)?;
    read_component_array::<Scorable>(&mut reg, &mut r)?;
    read_tag_array::<RandomMover>(&mut reg, &mut r)?;

    if r.remaining() != 0 {
        return Err(CodecError::invalid(format!(
            "{} trailing bytes after binary state",
            r.remaining()
        )));
    }

    rebuild_world(&mut reg)?;
    Ok(reg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_registry() -> Registry {
        let mut reg = Registry::new();
        reg.set_ctx(World::sized(5, 5));
        reg.ctx_mut::<TickCounter>().tick = 8191;
        reg.set_ctx(Pcg32::new(11, 13));
        let a = reg.create();
        reg.assign(a, Position { x: 4, y: 4 }).expect("assign");
        reg.assign(a, Moveable { x_force: 2, y_force: -2 })
            .expect("assign");
        reg.assign(a, SimpleBrain::default()).expect("assign");
        reg.assign(a, Predation::default()).expect("assign");
        reg.assign(a, Pcg32::new(1, 2)).expect("assign");
        let b = reg.create();
        reg.assign(b, Position { x: 0, y: 0 }).expect("assign");
        reg.assign(b, Scorable { score: 7 }).expect("assign");
        reg.assign(b, RandomMover).expect("assign");
        reg.assign(
            b,
            Name {
                major: "major".into(),
                minor: "minor".into(),
            },
        )
        .expect("assign");
        let dead = reg.create();
        reg.destroy(dead).expect("destroy");
        rebuild_world(&mut reg).expect("rebuild");
        reg
    }

    #[test]
    fn binary_round_trip_is_byte_identical() {
        let reg = seeded_registry();
        let first = state_to_binary(&reg);
        let restored = state_from_binary(&first).expect("deserialize");
        let second = state_to_binary(&restored);
        assert_eq!(first, second);
    }

    #[test]
    fn binary_and_json_agree_on_state() {
        let reg = seeded_registry();
        let via_binary = state_from_binary(&state_to_binary(&reg)).expect("binary");
        let json_a = crate::json::state_to_json(&reg).expect("json");
        let json_b = crate::json::state_to_json(&via_binary).expect("json");
        assert_eq!(json_a, json_b);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let reg = seeded_registry();
        let bytes = state_to_binary(&reg);
        for len in [0, 4, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                matches!(state_from_binary(&bytes[..len]), Err(CodecError::Invalid(_))),
                "truncation at {len} must fail"
            );
        }
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let reg = seeded_registry();
        let mut bytes = state_to_binary(&reg);
        bytes.push(0);
        assert!(matches!(
            state_from_binary(&bytes),
            Err(CodecError::Invalid(_))
        ));
    }

    #[test]
    fn events_pack_with_tag_bytes() {
        use std::collections::BTreeMap;
        let mut reg = Registry::new();
        reg.set_ctx(EventsLog {
            events_last_tick: vec![Event {
                name: "evolution".into(),
                data: EventData::Map(BTreeMap::from([
                    ("count".to_owned(), EventData::I32(2)),
                    ("ratio".to_owned(), EventData::F64(0.25)),
                    ("tag".to_owned(), EventData::Null),
                    (
                        "ids".to_owned(),
                        EventData::List(vec![EventData::str("1"), EventData::str("2")]),
                    ),
                ])),
            }],
            new_events: Vec::new(),
        });
        let restored = state_from_binary(&state_to_binary(&reg)).expect("round trip");
        assert_eq!(
            restored.ctx::<EventsLog>().events_last_tick,
            reg.ctx::<EventsLog>().events_last_tick
        );
    }

    #[test]
    fn rng_component_survives_binary_round_trip() {
        let reg = seeded_registry();
        let restored = state_from_binary(&state_to_binary(&reg)).expect("round trip");
        let (entities, _) = reg.dense::<Pcg32>();
        let e = entities[0];
        let mut original = reg.get::<Pcg32>(e).expect("rng").clone();
        let mut recovered = restored.get::<Pcg32>(e).expect("rng").clone();
        assert_eq!(original, recovered);
        assert_eq!(original.next(), recovered.next());
    }
}
