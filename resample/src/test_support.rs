// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use ensemble::{Cell, CellId, Color, System, Walker, WalkerId, WalkerIdSource};
use topology::Topology;

pub fn test_topology() -> Topology {
    let text = [
        "ATOM      1  N   ALA A   1       0.000   0.000   0.000  1.00  0.00           N",
        "ATOM      2  CA  ALA A   1       1.000   1.000   1.000  1.00  0.00           C",
        "",
    ]
    .join("\n");
    Topology::parse(&text).unwrap()
}

/// A system over the given `(cell id, core)` table, with no walkers yet.
pub fn system_with_cells(cells: &[(u32, Option<Color>)]) -> System {
    let mut system = System::new(test_topology());
    for &(id, core) in cells {
        let cell = match core {
            Some(core) => Cell::with_core(CellId(id), core),
            None => Cell::new(CellId(id)),
        };
        system.add_cell(cell).unwrap();
    }
    system
}

///
/// Add a walker in its post-barrier state: both coordinate sets present, so
/// the resampler can restart it.
///
pub fn add_completed_walker(
    system: &mut System,
    ids: &mut WalkerIdSource,
    cell: u32,
    color: Color,
    weight: f64,
) -> WalkerId {
    let mut walker = Walker::new(
        ids.next_id(),
        vec![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]],
        CellId(cell),
        color,
        weight,
    )
    .unwrap();
    walker.set_end(vec![[0.5, 0.5, 0.5], [1.5, 1.5, 1.5]]);
    let id = walker.id();
    system.add_walker(walker).unwrap();
    id
}

pub fn weights_in_cell(system: &System, cell: u32) -> Vec<f64> {
    system
        .filter_by_cell(CellId(cell))
        .unwrap()
        .weights()
}

pub fn total_weight(system: &System) -> f64 {
    system.weights().iter().sum()
}
