// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use ensemble::{SinkStates, System, WalkerIdSource};
use itertools::Itertools;
use serde_derive::{Deserialize, Serialize};

use crate::one_color::{append_line, OneColor};
use crate::Resample;

///
/// The multi-macro-state rebalancer: walkers adopt the color of any sink
/// cell they end an iteration in, transitions between colors are accumulated
/// weight-wise into a matrix, and each color's sub-population is rebalanced
/// independently with the one-color algorithm.
///
/// A walker's color only changes when it enters a cell with a defined core:
/// leaving a sink keeps the last committed color.
///
#[derive(Debug, Deserialize, Serialize)]
pub struct MultiColor {
    one_color: OneColor,
    partition: SinkStates,
    ncolors: usize,
    // Row-major with `ncolors` columns; starts with one all-zero block and
    // grows a block per iteration.
    transitions: Vec<f64>,
    iteration: u64,
    cellweights_path: PathBuf,
    tmat_path: PathBuf,
}

impl MultiColor {
    pub fn new(
        target_walkers: u32,
        partition: SinkStates,
        output_dir: &Path,
    ) -> Result<MultiColor, String> {
        let ncolors = partition.ncolors();
        if ncolors == 0 {
            return Err("Multi-color resampling needs a nonempty partition".to_owned());
        }
        let one_color = OneColor::new(target_walkers, output_dir)?;

        let cellweights_path = output_dir.join("cell-weights.csv");
        append_line(&cellweights_path, "iteration,cellid,color,total_weight\n")?;

        Ok(MultiColor {
            one_color,
            partition,
            ncolors,
            transitions: vec![0.0; ncolors * ncolors],
            iteration: 1,
            cellweights_path,
            tmat_path: output_dir.join("color-transition-matrix.csv"),
        })
    }

    pub fn partition(&self) -> &SinkStates {
        &self.partition
    }

    /// The accumulated ((N+1)·K, K) transition matrix in row-major form.
    pub fn transitions(&self) -> &[f64] {
        &self.transitions
    }

    ///
    /// Rewrite the transition-matrix CSV with everything accumulated so far.
    /// Rewriting keeps the file loadable even if a run dies mid-iteration.
    ///
    pub fn save_transitions(&self, path: &Path) -> Result<(), String> {
        log::debug!("Saving transition matrix to {}", path.display());
        let mut out = String::new();
        out.push_str(&format!(
            "# An ((N+1)*{k}, {k}) row-major matrix, where N is the number of iterations\n\
             # and {k} the color count. Reshape to (N+1, {k}, {k}) to index by iteration.\n",
            k = self.ncolors
        ));
        for row in self.transitions.chunks(self.ncolors) {
            out.push_str(&row.iter().map(|w| format!("{w:.18e}")).join(","));
            out.push('\n');
        }
        fs::write(path, out).map_err(|e| format!("Failed to write {}: {}", path.display(), e))
    }

    fn record_cell_weights(&self, old: &System, new: &System) -> Result<(), String> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.cellweights_path)
            .map_err(|e| format!("Failed to open {}: {}", self.cellweights_path.display(), e))?;
        for cell in new.cells() {
            let in_cell = old.filter_by_cell(cell.id())?;
            for color in in_cell.colors() {
                let total: f64 = in_cell.filter_by_color(color).weights().iter().sum();
                writeln!(file, "{},{},{},{}", self.iteration, cell.id(), color, total).map_err(
                    |e| format!("Failed to append {}: {}", self.cellweights_path.display(), e),
                )?;
            }
        }
        Ok(())
    }
}

impl Resample for MultiColor {
    fn resample(&mut self, system: &System, ids: &mut WalkerIdSource) -> Result<System, String> {
        let ncolors = self.ncolors;

        // Commit colors for walkers that ended in a sink, accumulating the
        // weight-weighted transition counts for this iteration.
        let mut colored = system.clone();
        let mut block = vec![0.0; ncolors * ncolors];
        for walker in colored.walkers_mut() {
            let cell = system
                .cell(walker.assignment())
                .ok_or_else(|| format!("No such cell {}", walker.assignment()))?;

            let oldcolor = walker.color();
            if oldcolor < 0 || oldcolor as usize >= ncolors {
                return Err(format!(
                    "Walker {} carries color {} outside the partition; multi-color resampling \
                     needs a fully colored population",
                    walker.id(),
                    oldcolor
                ));
            }
            let newcolor = match cell.core() {
                Some(core) if core != oldcolor => {
                    log::debug!(
                        "Updating color of walker {}: {} -> {}",
                        walker.id(),
                        oldcolor,
                        core
                    );
                    walker.set_color(core);
                    core
                }
                _ => oldcolor,
            };
            if newcolor < 0 || newcolor as usize >= ncolors {
                return Err(format!("Color {newcolor} outside the partition"));
            }
            block[oldcolor as usize * ncolors + newcolor as usize] += walker.weight();
        }
        self.transitions.extend_from_slice(&block);

        // Rebalance each color independently, then reassemble over the full
        // cell set.
        let mut newsystem = system.clone_with_cells();
        for color in colored.colors() {
            let thiscolor = colored.filter_by_color(color);
            log::debug!(
                "Resampling color {} with {} walkers",
                color,
                thiscolor.nwalkers()
            );
            let resampled = self.one_color.resample(&thiscolor, ids)?;
            newsystem.absorb(resampled);
        }

        self.record_cell_weights(&colored, &newsystem)?;
        self.iteration += 1;
        self.save_transitions(&self.tmat_path)?;

        Ok(newsystem)
    }
}
