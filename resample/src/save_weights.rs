// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};

use ensemble::{System, WalkerIdSource};
use serde_derive::{Deserialize, Serialize};

use crate::one_color::append_line;
use crate::{Resample, Resampler};

///
/// Wraps any resampler and appends one `walkerid,iteration,cell,weight,color`
/// row per walker to `walker-weights.csv` after every generation, so the
/// weight history of a run can be reconstructed without the checkpoints.
///
/// Transparent to the engine: resampling semantics are entirely the inner
/// resampler's.
///
#[derive(Debug, Deserialize, Serialize)]
pub struct SaveWeights {
    inner: Box<Resampler>,
    datfile: PathBuf,
    iteration: u64,
}

impl SaveWeights {
    pub fn new(inner: Resampler, output_dir: &Path) -> SaveWeights {
        SaveWeights {
            inner: Box::new(inner),
            datfile: output_dir.join("walker-weights.csv"),
            iteration: 0,
        }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    ///
    /// Append the current population. The header is written exactly once,
    /// ahead of the generation-zero rows.
    ///
    pub fn save(&mut self, system: &System) -> Result<(), String> {
        log::debug!("Saving weights to {}", self.datfile.display());
        let mut out = String::new();
        if self.iteration == 0 {
            out.push_str("walkerid,iteration,cell,weight,color\n");
        }
        for walker in system.walkers() {
            out.push_str(&format!(
                "{},{},{},{},{}\n",
                walker.id(),
                self.iteration,
                walker.assignment(),
                walker.weight(),
                walker.color()
            ));
        }
        append_line(&self.datfile, &out)
    }
}

impl Resample for SaveWeights {
    fn resample(&mut self, system: &System, ids: &mut WalkerIdSource) -> Result<System, String> {
        let newsystem = self.inner.resample(system, ids)?;
        self.iteration += 1;
        self.save(&newsystem)?;
        Ok(newsystem)
    }
}
