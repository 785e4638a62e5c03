// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::{CellId, Color, DEFAULT_COLOR};

///
/// A Voronoi region in conformation space. Cells are static: the full set is
/// fixed when the system is constructed.
///
/// A cell with a core is a sink for that color: walkers ending in it adopt
/// the color.
///
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Cell {
    id: CellId,
    core: Option<Color>,
}

impl Cell {
    pub fn new(id: CellId) -> Cell {
        Cell { id, core: None }
    }

    pub fn with_core(id: CellId, core: Color) -> Cell {
        Cell {
            id,
            core: Some(core),
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn core(&self) -> Option<Color> {
        self.core
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.core {
            Some(core) => write!(f, "<Cell: {}, core={}>", self.id, core),
            None => write!(f, "<Cell: {}, core=none>", self.id),
        }
    }
}

///
/// The partition between colors and the sets of cells forming each color's
/// absorbing region.
///
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SinkStates {
    color_states: BTreeMap<Color, BTreeSet<CellId>>,
    state_colors: BTreeMap<CellId, Color>,
}

impl SinkStates {
    pub fn new() -> SinkStates {
        SinkStates::default()
    }

    pub fn add<I: IntoIterator<Item = CellId>>(&mut self, color: Color, states: I) {
        for state in states {
            self.color_states.entry(color).or_default().insert(state);
            self.state_colors.insert(state, color);
        }
    }

    /// The color owning the given cell, or `DEFAULT_COLOR` if the cell is in
    /// no sink.
    pub fn color(&self, cell: CellId) -> Color {
        self.state_colors.get(&cell).copied().unwrap_or(DEFAULT_COLOR)
    }

    pub fn states(&self, color: Color) -> BTreeSet<CellId> {
        self.color_states.get(&color).cloned().unwrap_or_default()
    }

    pub fn ncolors(&self) -> usize {
        self.color_states.len()
    }
}
