// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;
use std::time::Duration;

mod engine;
#[cfg(test)]
mod engine_tests;

pub use crate::engine::IterationEngine;

///
/// Knobs for the iteration engine. Paths default to the layout the driver
/// has always used: everything operational under `debug/`.
///
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Iteration cap for the run.
    pub iterations: u32,
    /// Max per-task restarts; None is unbounded.
    pub restarts: Option<u32>,
    /// Max per-tag speculative replications; None is unbounded, 0 disables.
    pub maxreps: Option<u32>,
    /// Iterations between checkpoints.
    pub checkpoint_period: u32,
    /// How long each transport wait may block.
    pub wait_timeout: Duration,
    pub checkpoint_path: PathBuf,
    pub walker_log_path: PathBuf,
    pub stats_path: PathBuf,
    pub transitions_path: PathBuf,
    pub task_output_path: PathBuf,
}

impl EngineConfig {
    pub fn new(iterations: u32) -> EngineConfig {
        EngineConfig {
            iterations,
            restarts: Some(95),
            maxreps: Some(9),
            checkpoint_period: 1,
            wait_timeout: Duration::from_secs(10),
            checkpoint_path: PathBuf::from("debug/trax.cpt"),
            walker_log_path: PathBuf::from("debug/trax.log"),
            stats_path: PathBuf::from("debug/task_stats.log.gz"),
            transitions_path: PathBuf::from("debug/cell-transitions.log.gz"),
            task_output_path: PathBuf::from("debug/task_output.log.gz"),
        }
    }

    /// Re-root every output path under `dir`, for tests and scratch runs.
    pub fn rooted_at(mut self, dir: &std::path::Path) -> EngineConfig {
        self.checkpoint_path = dir.join(&self.checkpoint_path);
        self.walker_log_path = dir.join(&self.walker_log_path);
        self.stats_path = dir.join(&self.stats_path);
        self.transitions_path = dir.join(&self.transitions_path);
        self.task_output_path = dir.join(&self.task_output_path);
        self
    }
}
