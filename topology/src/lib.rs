// Copyright 2021 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::fs;
use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One atom position. The third axis is always cartesian x/y/z.
pub type Coords = Vec<[f64; 3]>;

/// The coordinate columns of a PDB ATOM/HETATM record: three fixed-width
/// `%8.3f` fields starting at column 31 (1-based).
const COORD_START: usize = 30;
const COORD_WIDTH: usize = 8;
const COORD_END: usize = COORD_START + 3 * COORD_WIDTH;

///
/// An immutable molecular topology, held in its text-PDB form.
///
/// The master never interprets the chemistry: the only operations are reading
/// and rebinding the coordinate columns of the atom records, and regenerating
/// the text to ship to a worker. All other lines pass through untouched.
///
#[derive(Clone, Debug, PartialEq)]
pub struct Topology {
    lines: Vec<String>,
    // Indices into `lines` of the ATOM/HETATM records, in file order.
    atom_lines: Vec<usize>,
}

impl Topology {
    pub fn parse(text: &str) -> Result<Topology, String> {
        let lines: Vec<String> = text.lines().map(str::to_owned).collect();
        let mut atom_lines = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            if !is_atom_record(line) {
                continue;
            }
            if line.len() < COORD_END {
                return Err(format!(
                    "Truncated atom record on line {}: {:?}",
                    index + 1,
                    line
                ));
            }
            parse_coord_fields(line, index)?;
            atom_lines.push(index);
        }
        if atom_lines.is_empty() {
            return Err("Topology contained no atom records.".to_owned());
        }
        Ok(Topology { lines, atom_lines })
    }

    pub fn from_file(path: &Path) -> Result<Topology, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read topology {}: {}", path.display(), e))?;
        Topology::parse(&text)
    }

    pub fn natoms(&self) -> usize {
        self.atom_lines.len()
    }

    pub fn coords(&self) -> Coords {
        self.atom_lines
            .iter()
            .map(|&index| {
                // Validated at parse time.
                parse_coord_fields(&self.lines[index], index).unwrap()
            })
            .collect()
    }

    ///
    /// Rewrite the coordinate columns of every atom record. The number of
    /// positions must match the number of atoms.
    ///
    pub fn set_coords(&mut self, coords: &[[f64; 3]]) -> Result<(), String> {
        if coords.len() != self.atom_lines.len() {
            return Err(format!(
                "Coordinate count mismatch: topology has {} atoms, got {} positions",
                self.atom_lines.len(),
                coords.len()
            ));
        }
        for (&index, xyz) in self.atom_lines.iter().zip(coords) {
            let line = &mut self.lines[index];
            let mut rewritten = String::with_capacity(line.len());
            rewritten.push_str(&line[..COORD_START]);
            for axis in xyz {
                rewritten.push_str(&format!("{axis:8.3}"));
            }
            rewritten.push_str(&line[COORD_END..]);
            *line = rewritten;
        }
        Ok(())
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

// The checkpoint treats the topology as an opaque string: the text form is
// the wire form.
impl Serialize for Topology {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Topology {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Topology, D::Error> {
        let text = String::deserialize(deserializer)?;
        Topology::parse(&text).map_err(D::Error::custom)
    }
}

fn is_atom_record(line: &str) -> bool {
    line.starts_with("ATOM") || line.starts_with("HETATM")
}

fn parse_coord_fields(line: &str, index: usize) -> Result<[f64; 3], String> {
    let mut xyz = [0.0; 3];
    for (axis, slot) in xyz.iter_mut().enumerate() {
        let start = COORD_START + axis * COORD_WIDTH;
        let field = &line[start..start + COORD_WIDTH];
        *slot = field.trim().parse::<f64>().map_err(|e| {
            format!(
                "Bad coordinate field {:?} on line {}: {}",
                field,
                index + 1,
                e
            )
        })?;
    }
    Ok(xyz)
}
