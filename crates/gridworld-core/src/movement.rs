//! Push-resolution movement: every mover pushes one cell along one axis and
//! the resolver produces an assignment in which at most one entity occupies
//! any cell, with cyclic pushes rotating atomically.
//!
//! Nodes live in an arena keyed by cell index; parent/child edges are arena
//! indices, so relinking never invalidates handles.

use std::collections::{HashMap, VecDeque};

use crate::components::{Moveable, Position};
use crate::registry::{EntityId, Registry};
use crate::world::World;

struct MoveNode {
    cell: usize,
    /// Mover for source nodes, current occupant (possibly null) for nodes
    /// first seen as a destination.
    eid: EntityId,
    parent: Option<usize>,
    children: Vec<usize>,
    is_entry: bool,
    net_force: i64,
    finalized: bool,
    accepted: Option<usize>,
}

/// Worker-local scratch reused across ticks and cleared after each.
#[derive(Default)]
pub(crate) struct MovementScratch {
    nodes: Vec<MoveNode>,
    by_cell: HashMap<usize, usize>,
}

fn sign(x: i64) -> i64 {
    i64::from(x > 0) - i64::from(x < 0)
}

impl MovementScratch {
    fn source_node(&mut self, cell: usize, eid: EntityId) -> usize {
        if let Some(index) = self.by_cell.get(&cell) {
            return *index;
        }
        let index = self.nodes.len();
        self.nodes.push(MoveNode {
            cell,
            eid,
            parent: None,
            children: Vec::new(),
            is_entry: false,
            net_force: 0,
            finalized: false,
            accepted: None,
        });
        self.by_cell.insert(cell, index);
        index
    }

    fn destination_node(&mut self, cell: usize, occupant: EntityId) -> usize {
        if let Some(index) = self.by_cell.get(&cell) {
            return *index;
        }
        let index = self.nodes.len();
        // A node first seen as a destination seeds a tree until a cycle
        // proves otherwise.
        self.nodes.push(MoveNode {
            cell,
            eid: occupant,
            parent: None,
            children: Vec::new(),
            is_entry: true,
            net_force: 0,
            finalized: false,
            accepted: None,
        });
        self.by_cell.insert(cell, index);
        index
    }

    /// Register one mover's push, maintaining the forest and the entry-node
    /// membership.
    fn add(&mut self, eid: EntityId, position: Position, force: Moveable, world: &World) {
        let abs_x = i64::from(force.x_force).abs();
        let abs_y = i64::from(force.y_force).abs();
        if abs_x == abs_y {
            // Full cancellation, no intent to move.
            return;
        }
        let cancellation = abs_x.min(abs_y);
        let true_x = (abs_x - cancellation) * sign(i64::from(force.x_force));
        let true_y = (abs_y - cancellation) * sign(i64::from(force.y_force));

        let mut new_x = position.x;
        let mut new_y = position.y;
        let net_force;
        if true_x > 0 {
            new_x += 1;
            net_force = true_x;
        } else if true_x < 0 {
            new_x -= 1;
            net_force = -true_x;
        } else if true_y > 0 {
            new_y += 1;
            net_force = true_y;
        } else {
            new_y -= 1;
            net_force = -true_y;
        }

        let cur_cell = world.index_of(position.x, position.y);
        let new_cell = world.index_of(new_x, new_y);

        let cur = self.source_node(cur_cell, eid);
        let dst = self.destination_node(new_cell, world.map()[new_cell]);

        self.nodes[cur].net_force = net_force;

        if self.nodes[cur].parent != Some(dst) {
            if let Some(old_parent) = self.nodes[cur].parent {
                let children = &mut self.nodes[old_parent].children;
                if let Some(slot) = children.iter().position(|c| *c == cur) {
                    children.remove(slot);
                }
            }
            self.nodes[cur].parent = Some(dst);
            self.nodes[dst].children.push(cur);
        }

        // Walk upward: finding an entry ancestor means this node is interior;
        // arriving back at ourselves means the loop has no entry and we seed
        // it.
        let mut search = dst;
        while !self.nodes[search].is_entry && search != cur {
            match self.nodes[search].parent {
                Some(parent) => search = parent,
                None => break,
            }
        }
        if search != cur && self.nodes[cur].is_entry {
            self.nodes[cur].is_entry = false;
        } else if search == cur && !self.nodes[cur].is_entry {
            self.nodes[cur].is_entry = true;
        }
    }

    fn entry_nodes(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|index| self.nodes[*index].is_entry)
            .collect()
    }

    fn accept_strongest_child(&mut self, node: usize, queue: &mut VecDeque<usize>) {
        let mut highest_force = -1;
        let mut highest: Option<usize> = None;
        for slot in 0..self.nodes[node].children.len() {
            let child = self.nodes[node].children[slot];
            let force = self.nodes[child].net_force;
            if force > highest_force {
                highest = Some(child);
                highest_force = force;
            } else if force == highest_force {
                // Ties accept no one.
                highest = None;
            }
            queue.push_back(child);
        }
        self.nodes[node].accepted = highest;
        self.nodes[node].finalized = true;
    }

    fn resolve_entry(&mut self, entry: usize) {
        let mut queue = VecDeque::new();

        if let Some(first_parent) = self.nodes[entry].parent {
            // The entry wants to move: the whole cycle rotates.
            let mut previous = entry;
            let mut current = first_parent;
            while !self.nodes[current].finalized {
                self.nodes[current].accepted = Some(previous);
                self.nodes[current].finalized = true;
                for slot in 0..self.nodes[current].children.len() {
                    let child = self.nodes[current].children[slot];
                    if child != previous {
                        queue.push_back(child);
                    }
                }
                previous = current;
                match self.nodes[current].parent {
                    Some(parent) => current = parent,
                    None => break,
                }
            }
        } else if !self.nodes[entry].eid.is_null() {
            // Occupied and not moving: every pusher is rejected.
            self.nodes[entry].accepted = None;
            self.nodes[entry].finalized = true;
            for slot in 0..self.nodes[entry].children.len() {
                let child = self.nodes[entry].children[slot];
                queue.push_back(child);
            }
        } else {
            self.accept_strongest_child(entry, &mut queue);
        }

        while let Some(current) = queue.pop_front() {
            let accepted_by_parent = self.nodes[current]
                .parent
                .is_some_and(|parent| self.nodes[parent].accepted == Some(current));
            if accepted_by_parent {
                self.accept_strongest_child(current, &mut queue);
            } else {
                self.nodes[current].accepted = None;
                self.nodes[current].finalized = true;
                for slot in 0..self.nodes[current].children.len() {
                    let child = self.nodes[current].children[slot];
                    queue.push_back(child);
                }
            }
        }
    }

    /// Walk the accepted chain from an entry, shifting each mover into the
    /// cell ahead of it. A cycle terminates naturally when the walk reaches a
    /// cell that already holds the accepted child; an open chain clears its
    /// tail cell.
    fn execute_entry(&mut self, entry: usize, world: &mut World, reg: &mut Registry) {
        let mut current = entry;
        loop {
            let Some(accepted) = self.nodes[current].accepted else {
                break;
            };
            let moved = self.nodes[accepted].eid;
            let cell = self.nodes[current].cell;
            if world.map()[cell] == moved {
                break;
            }
            world.map_mut()[cell] = moved;
            if let Ok(position) = reg.get_mut::<Position>(moved) {
                position.x = world.x_of(cell);
                position.y = world.y_of(cell);
            }
            current = accepted;
        }
        if self.nodes[current].accepted.is_none() && current != entry {
            let cell = self.nodes[current].cell;
            world.map_mut()[cell] = EntityId::NULL;
        }
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.by_cell.clear();
    }
}

/// The movement system: collect pushes, resolve the forest, execute the
/// accepted chains, and zero every force.
pub(crate) fn run(reg: &mut Registry, scratch: &mut MovementScratch) {
    let mut pending: Vec<(EntityId, Position, Moveable)> = Vec::new();
    for e in reg.entities_with::<Moveable>() {
        let position = reg.get::<Position>(e).ok().copied();
        let Ok(force) = reg.get_mut::<Moveable>(e) else {
            continue;
        };
        let push = *force;
        force.x_force = 0;
        force.y_force = 0;
        if let Some(position) = position {
            pending.push((e, position, push));
        }
    }

    {
        let world = reg.ctx::<World>();
        for (e, position, push) in &pending {
            scratch.add(*e, *position, *push, world);
        }
    }

    for entry in scratch.entry_nodes() {
        scratch.resolve_entry(entry);
    }

    let mut world = std::mem::replace(reg.ctx_mut::<World>(), World::empty());
    for entry in scratch.entry_nodes() {
        scratch.execute_entry(entry, &mut world, reg);
    }
    *reg.ctx_mut::<World>() = world;

    scratch.clear();
}
