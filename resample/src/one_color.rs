// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use ensemble::{System, Walker, WalkerIdSource};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use crate::Resample;

///
/// The single-color merge/split rebalancer, after Darve and Ryu's discrete
/// macro-state reaction-rate construction: within every cell the next
/// generation is exactly `target_walkers` walkers, each carrying an equal
/// share of the cell's pre-resample weight.
///
/// Split lineage is appended to `walker-history.csv` as
/// `origID,parentID,currentID` rows.
///
#[derive(Debug, Deserialize, Serialize)]
pub struct OneColor {
    target_walkers: u32,
    history_path: PathBuf,
}

impl OneColor {
    pub fn new(target_walkers: u32, output_dir: &Path) -> Result<OneColor, String> {
        if target_walkers == 0 {
            return Err("Target walker count must be positive".to_owned());
        }
        let history_path = output_dir.join("walker-history.csv");
        append_line(&history_path, "origID,parentID,currentID\n")?;
        Ok(OneColor {
            target_walkers,
            history_path,
        })
    }

    pub fn target_walkers(&self) -> u32 {
        self.target_walkers
    }

    ///
    /// Rebalance every nonempty cell of `system` into `into`, which must
    /// already hold the full cell set.
    ///
    pub(crate) fn resample_into(
        &mut self,
        system: &System,
        into: &mut System,
        ids: &mut WalkerIdSource,
    ) -> Result<(), String> {
        let mut history = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .map_err(|e| format!("Failed to open {}: {}", self.history_path.display(), e))?;

        for cell in system.cells() {
            let local = system.filter_by_cell(cell.id())?;
            let walkers: Vec<&Walker> = local.walkers().collect();
            if walkers.is_empty() {
                continue;
            }
            log::debug!(
                "Resampling cell {} with {} walkers",
                cell.id(),
                walkers.len()
            );
            self.resample_cell(&walkers, into, ids, &mut history)?;
        }
        Ok(())
    }

    fn resample_cell(
        &self,
        walkers: &[&Walker],
        into: &mut System,
        ids: &mut WalkerIdSource,
        history: &mut fs::File,
    ) -> Result<(), String> {
        let target = self.target_walkers;
        let mut weights: Vec<f64> = walkers.iter().map(|w| w.weight()).collect();

        // Indices in descending weight order, so only walkers heavier than
        // the target weight are split.
        let mut order: Vec<usize> = (0..walkers.len()).collect();
        order.sort_by(|&a, &b| {
            weights[b]
                .partial_cmp(&weights[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Sanity check the sort before committing to it.
        let mut previous = f64::INFINITY;
        for &index in &order {
            if weights[index] > previous {
                return Err(format!(
                    "Weights non-monotonically decreasing in cell {}",
                    walkers[index].assignment()
                ));
            }
            previous = weights[index];
        }

        let total: f64 = weights.iter().sum();
        let tw = total / f64::from(target);

        let mut rng = rand::thread_rng();
        let mut active: u32 = 0;

        // Popping takes the smallest weight first; the loop merges underweight
        // walkers together until one reaches the target, then splits.
        let mut x = order.pop().expect("cell checked nonempty");
        loop {
            let wx = weights[x];
            if wx >= tw || order.is_empty() {
                // Split: as many target-weight copies as wx covers, at least
                // one, and never past the cell's quota.
                let r = (((wx / tw).floor() as u32).max(1)).min(target - active);
                for _ in 0..r {
                    let child = walkers[x].restart(ids.next_id(), tw)?;
                    writeln!(
                        history,
                        "{},{},{}",
                        child.initid(),
                        walkers[x].id(),
                        child.id()
                    )
                    .map_err(|e| {
                        format!("Failed to append {}: {}", self.history_path.display(), e)
                    })?;
                    into.add_walker(child)?;
                }
                active += r;

                // Any residual weight goes back into the pool.
                if active < target && wx - f64::from(r) * tw > 0.0 {
                    order.push(x);
                    weights[x] = wx - f64::from(r) * tw;
                }

                match order.pop() {
                    Some(next) => x = next,
                    None => break,
                }
            } else {
                // Merge: absorb the next-smallest walker; the survivor is
                // chosen in proportion to weight, and keeps iterating without
                // popping a replacement.
                let y = order.pop().expect("merge arm requires a nonempty pool");
                let wy = weights[y];
                let wxy = wx + wy;
                if rng.gen::<f64>() < wy / wxy {
                    x = y;
                }
                weights[x] = wxy;
            }
        }

        if active != target {
            return Err(format!(
                "Cell {} emitted {} walkers instead of {}",
                walkers[0].assignment(),
                active,
                target
            ));
        }
        Ok(())
    }
}

impl Resample for OneColor {
    fn resample(&mut self, system: &System, ids: &mut WalkerIdSource) -> Result<System, String> {
        let mut newsystem = system.clone_with_cells();
        self.resample_into(system, &mut newsystem, ids)?;
        Ok(newsystem)
    }
}

pub(crate) fn append_line(path: &Path, line: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
    file.write_all(line.as_bytes())
        .map_err(|e| format!("Failed to append {}: {}", path.display(), e))
}
