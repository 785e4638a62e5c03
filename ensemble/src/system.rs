// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_derive::{Deserialize, Serialize};
use topology::Topology;

use crate::{Cell, CellId, Color, Walker, WalkerId};

///
/// The mutable container for one generation of the ensemble: the shared
/// topology, the fixed cell set, and the walker population that is replaced
/// every iteration.
///
/// Cells and walkers live in two id-keyed maps, and a walker's cell
/// membership is exactly its `assignment` field: `filter_by_cell` is computed
/// by scanning walkers, so there is a single source of truth.
///
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct System {
    topology: Topology,
    cells: BTreeMap<CellId, Cell>,
    walkers: BTreeMap<WalkerId, Walker>,
}

impl System {
    pub fn new(topology: Topology) -> System {
        System {
            topology,
            cells: BTreeMap::new(),
            walkers: BTreeMap::new(),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn add_cell(&mut self, cell: Cell) -> Result<(), String> {
        if self.cells.contains_key(&cell.id()) {
            return Err(format!("Duplicate cell id {}", cell.id()));
        }
        self.set_cell(cell);
        Ok(())
    }

    pub fn set_cell(&mut self, cell: Cell) {
        self.cells.insert(cell.id(), cell);
    }

    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(&id)
    }

    pub fn has_cell(&self, id: CellId) -> bool {
        self.cells.contains_key(&id)
    }

    pub fn add_walker(&mut self, walker: Walker) -> Result<(), String> {
        if self.walkers.contains_key(&walker.id()) {
            return Err(format!("Duplicate walker id {}", walker.id()));
        }
        if !self.has_cell(walker.assignment()) {
            return Err(format!(
                "Walker {} assigned to unknown cell {}",
                walker.id(),
                walker.assignment()
            ));
        }
        self.set_walker(walker);
        Ok(())
    }

    pub fn set_walker(&mut self, walker: Walker) {
        self.walkers.insert(walker.id(), walker);
    }

    pub fn walker(&self, id: WalkerId) -> Option<&Walker> {
        self.walkers.get(&id)
    }

    pub fn walker_mut(&mut self, id: WalkerId) -> Option<&mut Walker> {
        self.walkers.get_mut(&id)
    }

    pub fn walkers(&self) -> impl Iterator<Item = &Walker> {
        self.walkers.values()
    }

    pub fn walkers_mut(&mut self) -> impl Iterator<Item = &mut Walker> {
        self.walkers.values_mut()
    }

    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    pub fn ncells(&self) -> usize {
        self.cells.len()
    }

    pub fn nwalkers(&self) -> usize {
        self.walkers.len()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.walkers.values().map(Walker::weight).collect()
    }

    pub fn colors(&self) -> BTreeSet<Color> {
        self.walkers.values().map(Walker::color).collect()
    }

    ///
    /// A new System holding just the given cell and the walkers assigned to
    /// it. The receiver is not mutated.
    ///
    pub fn filter_by_cell(&self, cell: CellId) -> Result<System, String> {
        let kept = *self
            .cells
            .get(&cell)
            .ok_or_else(|| format!("No such cell {cell}"))?;
        let mut filtered = self.clone_empty();
        filtered.set_cell(kept);
        for walker in self.walkers.values() {
            if walker.assignment() == cell {
                filtered.set_walker(walker.clone());
            }
        }
        Ok(filtered)
    }

    ///
    /// A new System holding the walkers of the given color, plus the cells
    /// they are assigned to.
    ///
    pub fn filter_by_color(&self, color: Color) -> System {
        let mut filtered = self.clone_empty();
        for walker in self.walkers.values() {
            if walker.color() != color {
                continue;
            }
            if let Some(cell) = self.cells.get(&walker.assignment()) {
                filtered.set_cell(*cell);
            }
            filtered.set_walker(walker.clone());
        }
        filtered
    }

    ///
    /// A new System holding the cells whose core is the given color, plus
    /// the walkers assigned to those cells.
    ///
    pub fn filter_by_core(&self, core: Color) -> System {
        let mut filtered = self.clone_empty();
        for cell in self.cells.values() {
            if cell.core() == Some(core) {
                filtered.set_cell(*cell);
            }
        }
        for walker in self.walkers.values() {
            if filtered.has_cell(walker.assignment()) {
                filtered.set_walker(walker.clone());
            }
        }
        filtered
    }

    /// A walkerless copy sharing the topology and the full cell set.
    pub fn clone_with_cells(&self) -> System {
        System {
            topology: self.topology.clone(),
            cells: self.cells.clone(),
            walkers: BTreeMap::new(),
        }
    }

    /// A walkerless, cellless copy sharing only the topology.
    pub fn clone_empty(&self) -> System {
        System {
            topology: self.topology.clone(),
            cells: BTreeMap::new(),
            walkers: BTreeMap::new(),
        }
    }

    ///
    /// Union another System's cells and walkers into this one, replacing on
    /// id collision. Used to reassemble per-color resampled subsystems.
    ///
    pub fn absorb(&mut self, other: System) {
        self.cells.extend(other.cells);
        self.walkers.extend(other.walkers);
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<System: ncells={}, nwalkers={}>",
            self.cells.len(),
            self.walkers.len()
        )
    }
}
