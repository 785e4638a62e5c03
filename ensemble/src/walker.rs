// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::{CellId, Color, Coords, WalkerId};

///
/// One stochastic trajectory: coordinates, a statistical weight, the Voronoi
/// cell it is assigned to, and its macro-state color.
///
/// A walker is created either at system load or by `restart` during
/// resampling, and is mutated only by the iteration engine (recording a task
/// result) and the resampler.
///
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Walker {
    id: WalkerId,
    initid: WalkerId,
    start: Option<Coords>,
    end: Option<Coords>,
    assignment: CellId,
    color: Color,
    weight: f64,
    cellid: Option<CellId>,
    valid: bool,
}

impl Walker {
    pub fn new(
        id: WalkerId,
        start: Coords,
        assignment: CellId,
        color: Color,
        weight: f64,
    ) -> Result<Walker, String> {
        if start.is_empty() {
            return Err(format!("Walker {id} created without coordinates"));
        }
        if weight < 0.0 {
            return Err(format!("Walker {id} created with negative weight {weight}"));
        }
        Ok(Walker {
            id,
            initid: id,
            start: Some(start),
            end: None,
            assignment,
            color,
            weight,
            cellid: None,
            valid: true,
        })
    }

    ///
    /// Produce a new walker continuing this one's trajectory: the child's
    /// start is this walker's end, the cell assignment and color carry over,
    /// and the initial id is preserved through any number of generations.
    ///
    /// This is the only factory the resampler uses.
    ///
    pub fn restart(&self, id: WalkerId, weight: f64) -> Result<Walker, String> {
        let end = self
            .end
            .as_ref()
            .ok_or_else(|| format!("Walker {} restarted before its task completed", self.id))?;
        if weight < 0.0 {
            return Err(format!(
                "Walker {} restarted with negative weight {weight}",
                self.id
            ));
        }
        Ok(Walker {
            id,
            initid: self.initid,
            start: Some(end.clone()),
            end: None,
            assignment: self.assignment,
            color: self.color,
            weight,
            cellid: self.cellid,
            valid: true,
        })
    }

    pub fn id(&self) -> WalkerId {
        self.id
    }

    pub fn initid(&self) -> WalkerId {
        self.initid
    }

    pub fn start(&self) -> Option<&Coords> {
        self.start.as_ref()
    }

    pub fn end(&self) -> Option<&Coords> {
        self.end.as_ref()
    }

    pub fn assignment(&self) -> CellId {
        self.assignment
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn cellid(&self) -> Option<CellId> {
        self.cellid
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn natoms(&self) -> usize {
        self.coords().len()
    }

    pub fn ndim(&self) -> usize {
        3
    }

    pub fn set_start(&mut self, coords: Coords) {
        self.start = Some(coords);
    }

    pub fn set_end(&mut self, coords: Coords) {
        self.end = Some(coords);
    }

    pub fn set_assignment(&mut self, assignment: CellId) {
        self.assignment = assignment;
    }

    pub fn set_color(&mut self, color: Color) {
        self.color = color;
    }

    pub fn set_cellid(&mut self, cellid: CellId) {
        self.cellid = Some(cellid);
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    // Whichever coordinate set is present; a walker always has at least one.
    fn coords(&self) -> &Coords {
        self.start
            .as_ref()
            .or(self.end.as_ref())
            .expect("Walker invariant violated: neither start nor end present")
    }
}

impl fmt::Display for Walker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Walker: id={}, size={}, assignment={}, color={}, weight={}>",
            self.id,
            self.natoms(),
            self.assignment,
            self.color,
            self.weight
        )
    }
}
