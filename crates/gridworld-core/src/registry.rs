//! Sparse-set entity-component registry with typed singletons.
//!
//! Each component type owns a dense array of values and a parallel dense
//! array of entity ids, with a sparse slot index for O(1) lookup. Entity ids
//! pack a 32-bit slot index and a 32-bit version; destroyed slots thread a
//! freelist through their stored index bits, so the raw entities array is
//! self-describing and snapshots restore allocator state exactly.

use std::any::{Any, TypeId};
use std::fmt;

use indexmap::IndexMap;
use thiserror::Error;

use crate::components::{SimConfig, TickCounter};
use crate::events::EventsLog;
use crate::rng::Pcg32;
use crate::world::World;

const NO_INDEX: u32 = u32::MAX;

/// Opaque entity identifier: low 32 bits slot index, high 32 bits version.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    /// Sentinel for "no entity".
    pub const NULL: EntityId = EntityId(u64::MAX);

    /// Reconstruct an id from its raw 64-bit form.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit form used on the wire.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is the null sentinel.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == u64::MAX
    }

    pub(crate) const fn from_parts(index: u32, version: u32) -> Self {
        Self(((version as u64) << 32) | index as u64)
    }

    pub(crate) const fn index(self) -> u32 {
        self.0 as u32
    }

    pub(crate) const fn version(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("EntityId(NULL)")
        } else {
            write!(f, "EntityId({}v{})", self.index(), self.version())
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),
    #[error("entity {entity} has no {component} component")]
    MissingComponent {
        entity: EntityId,
        component: &'static str,
    },
    #[error("corrupt entity list: {0}")]
    CorruptEntities(&'static str),
}

/// Marker bound for component values.
pub trait Component: Send + Sync + Clone + 'static {}

impl<T: Send + Sync + Clone + 'static> Component for T {}

/// Dense storage for one component type.
struct Storage<T> {
    entities: Vec<EntityId>,
    values: Vec<T>,
    // Slot index -> dense position + 1; 0 marks absence.
    sparse: Vec<u32>,
}

impl<T> Default for Storage<T> {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            values: Vec::new(),
            sparse: Vec::new(),
        }
    }
}

impl<T> Storage<T> {
    fn slot_entry(&self, e: EntityId) -> Option<usize> {
        let slot = self.sparse.get(e.index() as usize).copied().unwrap_or(0);
        if slot == 0 {
            None
        } else {
            Some((slot - 1) as usize)
        }
    }

    fn insert(&mut self, e: EntityId, value: T) {
        let index = e.index() as usize;
        if index >= self.sparse.len() {
            self.sparse.resize(index + 1, 0);
        }
        match self.slot_entry(e) {
            Some(dense) => {
                self.entities[dense] = e;
                self.values[dense] = value;
            }
            None => {
                self.entities.push(e);
                self.values.push(value);
                self.sparse[index] = self.values.len() as u32;
            }
        }
    }

    fn get(&self, e: EntityId) -> Option<&T> {
        self.slot_entry(e).map(|dense| &self.values[dense])
    }

    fn get_mut(&mut self, e: EntityId) -> Option<&mut T> {
        self.slot_entry(e).map(|dense| &mut self.values[dense])
    }

    fn remove(&mut self, e: EntityId) -> Option<T> {
        let dense = self.slot_entry(e)?;
        let last = self.values.len() - 1;
        self.entities.swap_remove(dense);
        let value = self.values.swap_remove(dense);
        if dense != last {
            let moved = self.entities[dense];
            self.sparse[moved.index() as usize] = dense as u32 + 1;
        }
        self.sparse[e.index() as usize] = 0;
        Some(value)
    }
}

trait ErasedStore: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn contains(&self, e: EntityId) -> bool;
    fn remove_entity(&mut self, e: EntityId) -> bool;
    fn stamp(&mut self, src: EntityId, dst: EntityId) -> bool;
    fn clear(&mut self);
}

impl<T: Component> ErasedStore for Storage<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn contains(&self, e: EntityId) -> bool {
        self.slot_entry(e).is_some()
    }

    fn remove_entity(&mut self, e: EntityId) -> bool {
        self.remove(e).is_some()
    }

    fn stamp(&mut self, src: EntityId, dst: EntityId) -> bool {
        match self.get(src).cloned() {
            Some(value) => {
                self.insert(dst, value);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.entities.clear();
        self.values.clear();
        self.sparse.clear();
    }
}

/// The registry's singleton slots, one value per type.
#[derive(Debug, Default)]
pub struct Singletons {
    tick: TickCounter,
    world: World,
    events: EventsLog,
    config: SimConfig,
    rng: Pcg32,
}

/// Typed access into [`Singletons`].
pub trait Singleton: 'static {
    fn get(slots: &Singletons) -> &Self;
    fn get_mut(slots: &mut Singletons) -> &mut Self;
}

macro_rules! singleton {
    ($ty:ty, $field:ident) => {
        impl Singleton for $ty {
            fn get(slots: &Singletons) -> &Self {
                &slots.$field
            }

            fn get_mut(slots: &mut Singletons) -> &mut Self {
                &mut slots.$field
            }
        }
    };
}

singleton!(TickCounter, tick);
singleton!(World, world);
singleton!(EventsLog, events);
singleton!(SimConfig, config);
singleton!(Pcg32, rng);

/// The entity-component store.
pub struct Registry {
    entities: Vec<EntityId>,
    free_head: u32,
    stores: IndexMap<TypeId, Box<dyn ErasedStore>>,
    singletons: Singletons,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entity_slots", &self.entities.len())
            .field("alive", &self.alive_entities().count())
            .field("store_count", &self.stores.len())
            .finish()
    }
}

impl Registry {
    /// An empty registry with default singleton values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entities: Vec::new(),
            free_head: NO_INDEX,
            stores: IndexMap::new(),
            singletons: Singletons::default(),
        }
    }

    /// Allocate a fresh entity, recycling destroyed slots with a bumped
    /// version so stale ids compare unequal.
    pub fn create(&mut self) -> EntityId {
        if self.free_head != NO_INDEX {
            let slot = self.free_head as usize;
            let stored = self.entities[slot];
            self.free_head = stored.index();
            let id = EntityId::from_parts(slot as u32, stored.version());
            self.entities[slot] = id;
            id
        } else {
            let id = EntityId::from_parts(self.entities.len() as u32, 0);
            self.entities.push(id);
            id
        }
    }

    /// Remove every component of `e` and return its slot to the freelist.
    pub fn destroy(&mut self, e: EntityId) -> Result<(), RegistryError> {
        if !self.valid(e) {
            return Err(RegistryError::UnknownEntity(e));
        }
        for store in self.stores.values_mut() {
            store.remove_entity(e);
        }
        let slot = e.index() as usize;
        self.entities[slot] = EntityId::from_parts(self.free_head, e.version().wrapping_add(1));
        self.free_head = e.index();
        Ok(())
    }

    /// Whether `e` names a live entity.
    #[must_use]
    pub fn valid(&self, e: EntityId) -> bool {
        !e.is_null()
            && self
                .entities
                .get(e.index() as usize)
                .is_some_and(|stored| *stored == e)
    }

    /// Every live entity, in slot order.
    pub fn alive_entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities
            .iter()
            .enumerate()
            .filter(|(pos, stored)| stored.index() as usize == *pos)
            .map(|(_, stored)| *stored)
    }

    /// The raw entity array, destroyed slots included. This is the snapshot
    /// wire form; pair with [`Registry::set_entities`].
    #[must_use]
    pub fn raw_entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Replace the entity array from a snapshot, clearing all component
    /// stores and recovering the freelist from the destroyed slots' stored
    /// index bits.
    pub fn set_entities(&mut self, entities: Vec<EntityId>) -> Result<(), RegistryError> {
        let mut pointed_to = vec![false; entities.len()];
        let mut destroyed = vec![false; entities.len()];
        for (pos, stored) in entities.iter().enumerate() {
            if stored.index() as usize == pos {
                continue;
            }
            destroyed[pos] = true;
            let next = stored.index();
            if next != NO_INDEX {
                let next = next as usize;
                if next >= entities.len() || entities[next].index() as usize == next {
                    return Err(RegistryError::CorruptEntities(
                        "destroyed slot points outside the freelist",
                    ));
                }
                pointed_to[next] = true;
            }
        }

        let mut head = NO_INDEX;
        for pos in 0..entities.len() {
            if destroyed[pos] && !pointed_to[pos] {
                if head != NO_INDEX {
                    return Err(RegistryError::CorruptEntities(
                        "freelist has more than one head",
                    ));
                }
                head = pos as u32;
            }
        }

        // Walk the chain to reject detached cycles.
        let mut reached = 0usize;
        let mut cursor = head;
        while cursor != NO_INDEX {
            reached += 1;
            if reached > entities.len() {
                return Err(RegistryError::CorruptEntities("freelist cycles"));
            }
            cursor = entities[cursor as usize].index();
        }
        if reached != destroyed.iter().filter(|d| **d).count() {
            return Err(RegistryError::CorruptEntities(
                "freelist does not cover every destroyed slot",
            ));
        }

        self.entities = entities;
        self.free_head = head;
        for store in self.stores.values_mut() {
            store.clear();
        }
        Ok(())
    }

    fn store<T: Component>(&self) -> Option<&Storage<T>> {
        self.stores
            .get(&TypeId::of::<T>())
            .and_then(|s| s.as_any().downcast_ref())
    }

    fn store_mut<T: Component>(&mut self) -> &mut Storage<T> {
        let erased = self
            .stores
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Storage::<T>::default()));
        match erased.as_any_mut().downcast_mut() {
            Some(store) => store,
            // Unreachable: the map is keyed by the concrete TypeId.
            None => unreachable!("store type mismatch"),
        }
    }

    /// Attach (or replace) a component on `e`.
    pub fn assign<T: Component>(&mut self, e: EntityId, value: T) -> Result<(), RegistryError> {
        if !self.valid(e) {
            return Err(RegistryError::UnknownEntity(e));
        }
        self.store_mut::<T>().insert(e, value);
        Ok(())
    }

    /// Shared access to a component of `e`.
    pub fn get<T: Component>(&self, e: EntityId) -> Result<&T, RegistryError> {
        if !self.valid(e) {
            return Err(RegistryError::UnknownEntity(e));
        }
        self.store::<T>()
            .and_then(|s| s.get(e))
            .ok_or(RegistryError::MissingComponent {
                entity: e,
                component: std::any::type_name::<T>(),
            })
    }

    /// Exclusive access to a component of `e`.
    pub fn get_mut<T: Component>(&mut self, e: EntityId) -> Result<&mut T, RegistryError> {
        if !self.valid(e) {
            return Err(RegistryError::UnknownEntity(e));
        }
        match self
            .stores
            .get_mut(&TypeId::of::<T>())
            .and_then(|s| s.as_any_mut().downcast_mut::<Storage<T>>())
            .and_then(|s| s.get_mut(e))
        {
            Some(value) => Ok(value),
            None => Err(RegistryError::MissingComponent {
                entity: e,
                component: std::any::type_name::<T>(),
            }),
        }
    }

    /// Whether `e` carries a `T`.
    #[must_use]
    pub fn has<T: Component>(&self, e: EntityId) -> bool {
        self.valid(e) && self.store::<T>().is_some_and(|s| s.contains(e))
    }

    /// Detach a component from `e`.
    pub fn remove<T: Component>(&mut self, e: EntityId) -> Result<(), RegistryError> {
        if !self.valid(e) {
            return Err(RegistryError::UnknownEntity(e));
        }
        let removed = self
            .stores
            .get_mut(&TypeId::of::<T>())
            .and_then(|s| s.as_any_mut().downcast_mut::<Storage<T>>())
            .and_then(|s| s.remove(e));
        match removed {
            Some(_) => Ok(()),
            None => Err(RegistryError::MissingComponent {
                entity: e,
                component: std::any::type_name::<T>(),
            }),
        }
    }

    /// Iterate every `(entity, component)` pair in dense order.
    pub fn view<T: Component>(&self) -> impl Iterator<Item = (EntityId, &T)> + '_ {
        self.store::<T>().into_iter().flat_map(|s| {
            s.entities
                .iter()
                .copied()
                .zip(s.values.iter())
        })
    }

    /// Iterate every `(entity, component)` pair mutably in dense order.
    pub fn view_mut<T: Component>(&mut self) -> impl Iterator<Item = (EntityId, &mut T)> + '_ {
        self.stores
            .get_mut(&TypeId::of::<T>())
            .and_then(|s| s.as_any_mut().downcast_mut::<Storage<T>>())
            .into_iter()
            .flat_map(|s| s.entities.iter().copied().zip(s.values.iter_mut()))
    }

    /// Snapshot of the dense entity list for `T`, for loops that interleave
    /// component access.
    #[must_use]
    pub fn entities_with<T: Component>(&self) -> Vec<EntityId> {
        self.store::<T>()
            .map(|s| s.entities.clone())
            .unwrap_or_default()
    }

    /// Parallel dense arrays for bulk IO.
    #[must_use]
    pub fn dense<T: Component>(&self) -> (&[EntityId], &[T]) {
        match self.store::<T>() {
            Some(s) => (&s.entities, &s.values),
            None => (&[], &[]),
        }
    }

    /// Number of entities carrying `T`.
    #[must_use]
    pub fn len_of<T: Component>(&self) -> usize {
        self.store::<T>().map_or(0, |s| s.values.len())
    }

    /// Deep-copy every component of `src` onto `dst`.
    pub fn stamp(&mut self, dst: EntityId, src: EntityId) -> Result<(), RegistryError> {
        if !self.valid(src) {
            return Err(RegistryError::UnknownEntity(src));
        }
        if !self.valid(dst) {
            return Err(RegistryError::UnknownEntity(dst));
        }
        for store in self.stores.values_mut() {
            store.stamp(src, dst);
        }
        Ok(())
    }

    /// Enumerate the component types attached to `e`, in store registration
    /// order.
    pub fn visit(
        &self,
        e: EntityId,
        mut callback: impl FnMut(TypeId),
    ) -> Result<(), RegistryError> {
        if !self.valid(e) {
            return Err(RegistryError::UnknownEntity(e));
        }
        for (type_id, store) in &self.stores {
            if store.contains(e) {
                callback(*type_id);
            }
        }
        Ok(())
    }

    /// Shared access to the singleton of type `S`.
    #[must_use]
    pub fn ctx<S: Singleton>(&self) -> &S {
        S::get(&self.singletons)
    }

    /// Exclusive access to the singleton of type `S`.
    pub fn ctx_mut<S: Singleton>(&mut self) -> &mut S {
        S::get_mut(&mut self.singletons)
    }

    /// Replace the singleton of type `S`.
    pub fn set_ctx<S: Singleton>(&mut self, value: S) {
        *self.ctx_mut() = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{Position, Scorable};

    #[test]
    fn create_returns_sequential_ids() {
        let mut reg = Registry::new();
        let a = reg.create();
        let b = reg.create();
        assert_ne!(a, b);
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert!(reg.valid(a));
        assert!(reg.valid(b));
    }

    #[test]
    fn destroy_recycles_with_bumped_version() {
        let mut reg = Registry::new();
        let a = reg.create();
        reg.destroy(a).expect("destroy");
        assert!(!reg.valid(a));

        let b = reg.create();
        assert_eq!(b.index(), a.index());
        assert_ne!(b.version(), a.version());
        assert!(!reg.valid(a), "stale id must stay invalid after recycle");
        assert!(reg.valid(b));
    }

    #[test]
    fn destroy_removes_components() {
        let mut reg = Registry::new();
        let e = reg.create();
        reg.assign(e, Position { x: 1, y: 2 }).expect("assign");
        reg.assign(e, Scorable { score: 3 }).expect("assign");
        reg.destroy(e).expect("destroy");
        assert_eq!(reg.len_of::<Position>(), 0);
        assert_eq!(reg.len_of::<Scorable>(), 0);
    }

    #[test]
    fn get_reports_missing_component() {
        let mut reg = Registry::new();
        let e = reg.create();
        assert!(matches!(
            reg.get::<Position>(e),
            Err(RegistryError::MissingComponent { .. })
        ));
        assert!(matches!(
            reg.get::<Position>(EntityId::NULL),
            Err(RegistryError::UnknownEntity(_))
        ));
    }

    #[test]
    fn assign_replaces_existing_value() {
        let mut reg = Registry::new();
        let e = reg.create();
        reg.assign(e, Scorable { score: 1 }).expect("assign");
        reg.assign(e, Scorable { score: 2 }).expect("assign");
        assert_eq!(reg.get::<Scorable>(e).expect("get").score, 2);
        assert_eq!(reg.len_of::<Scorable>(), 1);
    }

    #[test]
    fn view_preserves_insertion_order_until_removal() {
        let mut reg = Registry::new();
        let ids: Vec<_> = (0..4).map(|_| reg.create()).collect();
        for (i, id) in ids.iter().enumerate() {
            reg.assign(*id, Scorable { score: i as i32 }).expect("assign");
        }
        let order: Vec<_> = reg.view::<Scorable>().map(|(e, _)| e).collect();
        assert_eq!(order, ids);

        // swap_remove moves the last dense entry into the hole
        reg.remove::<Scorable>(ids[1]).expect("remove");
        let order: Vec<_> = reg.view::<Scorable>().map(|(e, _)| e).collect();
        assert_eq!(order, vec![ids[0], ids[3], ids[2]]);
    }

    #[test]
    fn stamp_copies_every_component() {
        let mut reg = Registry::new();
        let src = reg.create();
        let dst = reg.create();
        reg.assign(src, Position { x: 5, y: 6 }).expect("assign");
        reg.assign(src, Scorable { score: -1 }).expect("assign");
        reg.stamp(dst, src).expect("stamp");
        assert_eq!(reg.get::<Position>(dst).expect("get"), &Position { x: 5, y: 6 });
        assert_eq!(reg.get::<Scorable>(dst).expect("get").score, -1);
    }

    #[test]
    fn visit_lists_component_types() {
        let mut reg = Registry::new();
        let e = reg.create();
        reg.assign(e, Position::default()).expect("assign");
        reg.assign(e, Scorable::default()).expect("assign");
        let mut seen = Vec::new();
        reg.visit(e, |t| seen.push(t)).expect("visit");
        assert_eq!(
            seen,
            vec![TypeId::of::<Position>(), TypeId::of::<Scorable>()]
        );
    }

    #[test]
    fn raw_entities_round_trip_restores_freelist() {
        let mut reg = Registry::new();
        let ids: Vec<_> = (0..5).map(|_| reg.create()).collect();
        reg.destroy(ids[1]).expect("destroy");
        reg.destroy(ids[3]).expect("destroy");

        let snapshot = reg.raw_entities().to_vec();
        let mut restored = Registry::new();
        restored.set_entities(snapshot).expect("set_entities");

        // Allocation order after restore must match the original registry.
        let next_original = reg.create();
        let next_restored = restored.create();
        assert_eq!(next_original, next_restored);
        let next_original = reg.create();
        let next_restored = restored.create();
        assert_eq!(next_original, next_restored);
    }

    #[test]
    fn set_entities_rejects_multiple_heads() {
        // Two destroyed slots that both terminate the chain.
        let entities = vec![
            EntityId::from_parts(NO_INDEX, 1),
            EntityId::from_parts(NO_INDEX, 1),
        ];
        let mut reg = Registry::new();
        assert!(matches!(
            reg.set_entities(entities),
            Err(RegistryError::CorruptEntities(_))
        ));
    }

    #[test]
    fn singletons_are_typed_slots() {
        let mut reg = Registry::new();
        assert_eq!(reg.ctx::<TickCounter>().tick, 0);
        reg.ctx_mut::<TickCounter>().tick = 9;
        assert_eq!(reg.ctx::<TickCounter>().tick, 9);
        reg.set_ctx(TickCounter { tick: 1 });
        assert_eq!(reg.ctx::<TickCounter>().tick, 1);
    }
}
