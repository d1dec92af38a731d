//! Toroidal world map: one entity slot per cell, wrapping coordinates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::EntityId;

/// Errors raised by world-map maintenance.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorldError {
    #[error("world dimensions {width}x{height} must be positive")]
    InvalidDimensions { width: i32, height: i32 },
    #[error("multiple entities occupy cell ({x}, {y})")]
    PositionCollision { x: i32, y: i32 },
}

/// The spatial index singleton: a row-major `width * height` array of entity
/// ids with wrapping coordinate arithmetic.
///
/// Only the dimensions travel on the wire; the map is rebuilt from Position
/// components after a snapshot loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WorldDims")]
pub struct World {
    width: i32,
    height: i32,
    #[serde(skip)]
    map: Vec<EntityId>,
}

#[derive(Deserialize)]
struct WorldDims {
    width: i32,
    height: i32,
}

impl From<WorldDims> for World {
    fn from(dims: WorldDims) -> Self {
        Self::sized(dims.width, dims.height)
    }
}

impl Default for World {
    fn default() -> Self {
        Self::sized(20, 20)
    }
}

impl World {
    /// A world of the given dimensions with every cell empty.
    ///
    /// Non-positive dimensions are clamped to 1; use [`World::new`] to
    /// reject them instead.
    #[must_use]
    pub fn sized(width: i32, height: i32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        Self {
            width,
            height,
            map: vec![EntityId::NULL; (width * height) as usize],
        }
    }

    /// A world of the given dimensions, rejecting non-positive sizes.
    pub fn new(width: i32, height: i32) -> Result<Self, WorldError> {
        if width <= 0 || height <= 0 {
            return Err(WorldError::InvalidDimensions { width, height });
        }
        Ok(Self::sized(width, height))
    }

    /// Placeholder used when the singleton is temporarily moved out.
    pub(crate) fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            map: Vec::new(),
        }
    }

    #[must_use]
    pub const fn width(&self) -> i32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> i32 {
        self.height
    }

    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.map.len()
    }

    /// Clear every cell; called after loading a snapshot or resizing.
    pub fn reset_map(&mut self) {
        self.map.clear();
        self.map
            .resize((self.width * self.height) as usize, EntityId::NULL);
    }

    #[must_use]
    pub fn normalize_x(&self, x: i32) -> i32 {
        x.rem_euclid(self.width)
    }

    #[must_use]
    pub fn normalize_y(&self, y: i32) -> i32 {
        y.rem_euclid(self.height)
    }

    /// Row-major cell index for (possibly unnormalized) coordinates.
    #[must_use]
    pub fn index_of(&self, x: i32, y: i32) -> usize {
        (self.normalize_y(y) * self.width + self.normalize_x(x)) as usize
    }

    #[must_use]
    pub fn x_of(&self, index: usize) -> i32 {
        index as i32 % self.width
    }

    #[must_use]
    pub fn y_of(&self, index: usize) -> i32 {
        index as i32 / self.width
    }

    /// Occupant of the cell containing the wrapped coordinates.
    #[must_use]
    pub fn get(&self, x: i32, y: i32) -> EntityId {
        self.map[self.index_of(x, y)]
    }

    pub fn set(&mut self, x: i32, y: i32, e: EntityId) {
        let index = self.index_of(x, y);
        self.map[index] = e;
    }

    #[must_use]
    pub fn map(&self) -> &[EntityId] {
        &self.map
    }

    pub fn map_mut(&mut self) -> &mut [EntityId] {
        &mut self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinates_wrap_both_directions() {
        let world = World::sized(3, 4);
        assert_eq!(world.normalize_x(3), 0);
        assert_eq!(world.normalize_x(-1), 2);
        assert_eq!(world.normalize_y(-5), 3);
        assert_eq!(world.index_of(3, 4), 0);
        assert_eq!(world.index_of(-1, -1), 4 * 3 - 1);
    }

    #[test]
    fn index_round_trips_to_coordinates() {
        let world = World::sized(5, 3);
        for idx in 0..world.cell_count() {
            let x = world.x_of(idx);
            let y = world.y_of(idx);
            assert_eq!(world.index_of(x, y), idx);
        }
    }

    #[test]
    fn set_and_get_use_wrapped_cell() {
        let mut world = World::sized(3, 3);
        let e = EntityId::from_raw(7);
        world.set(4, -1, e);
        assert_eq!(world.get(1, 2), e);
    }

    #[test]
    fn new_rejects_bad_dimensions() {
        assert!(World::new(0, 5).is_err());
        assert!(World::new(5, -1).is_err());
    }

    #[test]
    fn wire_form_carries_dimensions_only() {
        let mut world = World::sized(4, 2);
        world.set(1, 1, EntityId::from_raw(3));
        let json = serde_json::to_string(&world).expect("serialize");
        assert_eq!(json, "{\"width\":4,\"height\":2}");
        let back: World = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.width(), 4);
        assert_eq!(back.height(), 2);
        assert_eq!(back.cell_count(), 8);
        assert!(back.map().iter().all(|e| e.is_null()));
    }

    #[test]
    fn reset_map_clears_every_cell() {
        let mut world = World::sized(2, 2);
        world.set(0, 0, EntityId::from_raw(1));
        world.reset_map();
        assert!(world.map().iter().all(|e| e.is_null()));
    }
}
