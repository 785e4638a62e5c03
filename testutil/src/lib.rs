// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::Path;

use ensemble::{Cell, CellId, Color, System, Walker, WalkerId, WalkerIdSource};
use topology::Topology;
use transport::{Task, RESULT_CELL, RESULT_POSITIONS, WORKER_POSITIONS_NAME};

mod scripted;

pub use crate::scripted::ScriptedTransport;

pub fn test_topology() -> Topology {
    Topology::parse(&test_topology_text()).unwrap()
}

pub fn test_topology_text() -> String {
    [
        "ATOM      1  N   ALA A   1       0.000   0.000   0.000  1.00  0.00           N",
        "ATOM      2  CA  ALA A   1       1.000   1.000   1.000  1.00  0.00           C",
        "",
    ]
    .join("\n")
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

pub fn add_walker(
    system: &mut System,
    ids: &mut WalkerIdSource,
    cell: u32,
    color: Color,
    weight: f64,
) -> WalkerId {
    let walker = Walker::new(
        ids.next_id(),
        vec![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]],
        CellId(cell),
        color,
        weight,
    )
    .unwrap();
    let id = walker.id();
    system.add_walker(walker).unwrap();
    id
}

///
/// Write a worker result archive: the ending structure plus the cell
/// assignment file.
///
pub fn write_result_archive(path: &Path, structure: &str, cell: u32) {
    let file = std::fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(file);
    append_member(&mut builder, RESULT_POSITIONS, structure.as_bytes());
    append_member(&mut builder, RESULT_CELL, format!("{cell}\n").as_bytes());
    builder.finish().unwrap();
}

fn append_member(builder: &mut tar::Builder<std::fs::File>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data).unwrap();
}

/// The structure payload the master staged for this task.
pub fn staged_structure(task: &Task) -> String {
    let (_, payload) = task
        .buffers
        .iter()
        .find(|(name, _)| name == WORKER_POSITIONS_NAME)
        .expect("task carries no structure payload");
    String::from_utf8(payload.to_vec()).unwrap()
}

///
/// Complete a task successfully: the ending structure echoes the staged one,
/// and the cell file reports `cell`.
///
pub fn complete_ok(task: &mut Task, cell: u32) {
    let structure = staged_structure(task);
    let outfile = &task.outputs[0].local_path;
    write_result_archive(outfile, &structure, cell);
    task.result = 0;
    task.return_status = 0;
    task.output = "segment complete\n".to_owned();
    task.host = Some("worker-1.pool".to_owned());
}

/// Fail a task with the given exit status and output.
pub fn complete_failed(task: &mut Task, return_status: i32, output: &str) {
    task.result = 0;
    task.return_status = return_status;
    task.output = output.to_owned();
    task.host = Some("worker-1.pool".to_owned());
}
