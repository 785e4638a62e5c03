// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use ensemble::{System, WalkerIdSource};
use serde_derive::{Deserialize, Serialize};

mod multi_color;
mod one_color;
mod save_weights;

pub use crate::multi_color::MultiColor;
pub use crate::one_color::OneColor;
pub use crate::save_weights::SaveWeights;

#[cfg(test)]
mod one_color_tests;
#[cfg(test)]
pub(crate) mod test_support;

///
/// Produces the next generation from a System whose walkers have all
/// completed their tasks (every `end` set, assignments current).
///
/// Implementations never mutate the input; new walkers are minted through
/// the engine's id source so ids stay monotonic across the whole run.
///
pub trait Resample {
    fn resample(&mut self, system: &System, ids: &mut WalkerIdSource) -> Result<System, String>;
}

///
/// The closed set of resamplers, as a tagged enum so the engine checkpoint
/// captures resampler state (transition matrices, iteration counters)
/// alongside the System.
///
#[derive(Debug, Deserialize, Serialize)]
pub enum Resampler {
    /// Passes the population through untouched.
    Identity,
    OneColor(OneColor),
    MultiColor(MultiColor),
    /// Wraps another resampler and records per-iteration walker weights.
    SaveWeights(SaveWeights),
}

impl Resampler {
    ///
    /// Record the generation-zero population before any task has run. Only
    /// the save-weights wrapper has anything to do.
    ///
    pub fn save_initial(&mut self, system: &System) -> Result<(), String> {
        match self {
            Resampler::SaveWeights(saver) => saver.save(system),
            _ => Ok(()),
        }
    }
}

impl Resample for Resampler {
    fn resample(&mut self, system: &System, ids: &mut WalkerIdSource) -> Result<System, String> {
        match self {
            Resampler::Identity => Ok(system.clone()),
            Resampler::OneColor(resampler) => resampler.resample(system, ids),
            Resampler::MultiColor(resampler) => resampler.resample(system, ids),
            Resampler::SaveWeights(resampler) => resampler.resample(system, ids),
        }
    }
}
