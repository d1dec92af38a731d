//! Structured per-tick events: staged into `new_events` during a tick,
//! published as `events_last_tick` by the finalize system.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// Tagged payload value carried by events.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum EventData {
    #[default]
    Null,
    I32(i32),
    F64(f64),
    Str(String),
    Map(BTreeMap<String, EventData>),
    List(Vec<EventData>),
}

impl EventData {
    /// Convenience constructor for string payloads.
    pub fn str(value: impl Into<String>) -> Self {
        Self::Str(value.into())
    }
}

impl Serialize for EventData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::I32(v) => serializer.serialize_i32(*v),
            Self::F64(v) => serializer.serialize_f64(*v),
            Self::Str(v) => serializer.serialize_str(v),
            Self::Map(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    m.serialize_entry(key, value)?;
                }
                m.end()
            }
            Self::List(items) => {
                let mut s = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    s.serialize_element(item)?;
                }
                s.end()
            }
        }
    }
}

struct EventDataVisitor;

impl<'de> Visitor<'de> for EventDataVisitor {
    type Value = EventData;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("null, an integer, a float, a string, an object, or an array")
    }

    fn visit_unit<E: de::Error>(self) -> Result<EventData, E> {
        Ok(EventData::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<EventData, E> {
        Ok(EventData::Null)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<EventData, E> {
        Ok(EventData::I32(i32::from(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<EventData, E> {
        match i32::try_from(v) {
            Ok(small) => Ok(EventData::I32(small)),
            Err(_) => Ok(EventData::F64(v as f64)),
        }
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<EventData, E> {
        match i32::try_from(v) {
            Ok(small) => Ok(EventData::I32(small)),
            Err(_) => Ok(EventData::F64(v as f64)),
        }
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<EventData, E> {
        Ok(EventData::F64(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<EventData, E> {
        Ok(EventData::Str(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<EventData, E> {
        Ok(EventData::Str(v))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<EventData, A::Error> {
        let mut map = BTreeMap::new();
        while let Some((key, value)) = access.next_entry()? {
            map.insert(key, value);
        }
        Ok(EventData::Map(map))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<EventData, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = access.next_element()? {
            items.push(item);
        }
        Ok(EventData::List(items))
    }
}

impl<'de> Deserialize<'de> for EventData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(EventDataVisitor)
    }
}

/// A named event with a structured payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub data: EventData,
}

/// Singleton staging/publishing pair for events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventsLog {
    pub events_last_tick: Vec<Event>,
    pub new_events: Vec<Event>,
}

impl EventsLog {
    /// Stage an event for publication at the end of the current tick.
    pub fn log(&mut self, event: Event) {
        self.new_events.push(event);
    }

    /// Publish the staged events; nothing else writes `events_last_tick`.
    pub fn finalize(&mut self) {
        self.events_last_tick = std::mem::take(&mut self.new_events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_publishes_and_clears_staging() {
        let mut log = EventsLog::default();
        log.log(Event {
            name: "a".into(),
            data: EventData::Null,
        });
        log.finalize();
        assert_eq!(log.events_last_tick.len(), 1);
        assert!(log.new_events.is_empty());

        log.finalize();
        assert!(log.events_last_tick.is_empty());
    }

    #[test]
    fn event_data_serializes_by_tag() {
        let data = EventData::Map(BTreeMap::from([
            ("i".to_owned(), EventData::I32(-3)),
            ("f".to_owned(), EventData::F64(0.5)),
            ("s".to_owned(), EventData::str("x")),
            ("n".to_owned(), EventData::Null),
            (
                "v".to_owned(),
                EventData::List(vec![EventData::I32(1), EventData::I32(2)]),
            ),
        ]));
        let json = serde_json::to_string(&data).expect("serialize");
        assert_eq!(json, r#"{"f":0.5,"i":-3,"n":null,"s":"x","v":[1,2]}"#);
        let back: EventData = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, data);
    }

    #[test]
    fn integers_outside_i32_fall_back_to_float() {
        let back: EventData = serde_json::from_str("4294967296").expect("deserialize");
        assert_eq!(back, EventData::F64(4_294_967_296.0));
    }

    #[test]
    fn event_round_trips() {
        let event = Event {
            name: "evolution".into(),
            data: EventData::List(vec![EventData::str("1"), EventData::str("2")]),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let back: Event = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, event);
    }
}
