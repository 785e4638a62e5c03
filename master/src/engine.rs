// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use ensemble::{CellId, Coords, System, Walker, WalkerId, WalkerIdSource};
use resample::{Resample, Resampler};
use serde_derive::{Deserialize, Serialize};
use statslog::{RunTimings, StatsLogger, TaskStats};
use tagset::TagSet;
use topology::Topology;
use transport::{
    Task, TaskTag, TaskTransport, RESULT_CELL, RESULT_POSITIONS, WORKER_POSITIONS_NAME,
    WORKER_RESULTS_NAME,
};
use txlog::TransactionalLog;

use crate::EngineConfig;

/// Worker output carrying this marker reports a numerically exploded model
/// rather than an execution failure.
const BAD_MODEL_INDICATOR: &str = "NaN";

/// How many speculative duplicates one result receipt may trigger.
const MAX_DUPLICATIONS_PER_RECEIPT: u32 = 20;

///
/// The serialized engine state. The transport is deliberately absent: it is
/// re-created from configuration on recovery.
///
#[derive(Serialize)]
struct CheckpointRef<'a> {
    system: &'a System,
    iteration: u32,
    iterations: u32,
    resampler: &'a Resampler,
    checkpoint_period: u32,
    ids: &'a WalkerIdSource,
    first_run: bool,
}

#[derive(Deserialize)]
struct Checkpoint {
    system: System,
    iteration: u32,
    iterations: u32,
    resampler: Resampler,
    checkpoint_period: u32,
    ids: WalkerIdSource,
    first_run: bool,
}

///
/// The master loop: drives every walker through one task per iteration on
/// the worker pool, with restarts for failures, speculative duplication for
/// stragglers, and donor-coordinate repair for numerically invalid results;
/// then hands the completed generation to the resampler and checkpoints
/// between iterations.
///
pub struct IterationEngine {
    system: System,
    ids: WalkerIdSource,
    resampler: Resampler,
    transport: Box<dyn TaskTransport>,
    txlog: TransactionalLog,
    stats: StatsLogger,
    transitions_log: StatsLogger,
    task_output_log: StatsLogger,
    timings: RunTimings,
    tagset: TagSet,
    restarts: HashMap<String, u32>,
    invalid: BTreeSet<WalkerId>,
    iteration: u32,
    iterations: u32,
    checkpoint_period: u32,
    wait_timeout: std::time::Duration,
    restart_cap: Option<u32>,
    first_run: bool,
    workdir: tempfile::TempDir,
    stop: Arc<AtomicBool>,
}

impl IterationEngine {
    pub fn new(
        system: System,
        resampler: Resampler,
        transport: Box<dyn TaskTransport>,
        ids: WalkerIdSource,
        config: EngineConfig,
    ) -> Result<IterationEngine, String> {
        if config.checkpoint_period == 0 {
            return Err("Checkpoint period must be positive".to_owned());
        }
        let workdir = tempfile::Builder::new()
            .prefix("awe-tmp.")
            .tempdir()
            .map_err(|e| format!("Failed to create scratch directory: {e}"))?;
        Ok(IterationEngine {
            system,
            ids,
            resampler,
            transport,
            txlog: TransactionalLog::new(&config.checkpoint_path, &config.walker_log_path),
            stats: StatsLogger::new(&config.stats_path)?,
            transitions_log: StatsLogger::new(&config.transitions_path)?,
            task_output_log: StatsLogger::new(&config.task_output_path)?,
            timings: RunTimings::new(),
            tagset: TagSet::new(config.maxreps),
            restarts: HashMap::new(),
            invalid: BTreeSet::new(),
            iteration: 0,
            iterations: config.iterations,
            checkpoint_period: config.checkpoint_period,
            wait_timeout: config.wait_timeout,
            restart_cap: config.restarts,
            first_run: true,
            workdir,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    ///
    /// A flag the driver's signal handler flips to request a clean stop: the
    /// engine finishes handling any task already received, flushes its logs
    /// and returns without error.
    ///
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn interrupted(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    ///
    /// Execute iterations until the configured cap, an interrupt, or a fatal
    /// failure. Statistics are flushed on every exit path.
    ///
    pub fn run(&mut self) -> Result<(), String> {
        if self.txlog.has_checkpoint() {
            self.recover()?;
        }
        if self.first_run {
            self.resampler.save_initial(&self.system)?;
            self.first_run = false;
        }
        if self.system.ncells() == 0 {
            return Err("Cannot run without cells".to_owned());
        }
        if self.system.nwalkers() == 0 {
            return Err("Cannot run without walkers".to_owned());
        }

        let t = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        self.stats.update("AWE", "start_unix_time", t)?;

        let outcome = self.run_loop();
        self.flush_logs();
        outcome
    }

    fn run_loop(&mut self) -> Result<(), String> {
        while self.iteration < self.iterations {
            if self.interrupted() {
                log::info!("Interrupted; stopping before iteration {}", self.iteration + 1);
                break;
            }
            if self.iteration % self.checkpoint_period == 0 {
                log::info!("Checkpointing to {}", self.txlog.checkpoint_path().display());
                self.checkpoint()?;
            }
            self.iteration += 1;
            log::info!(
                "Iteration {} with {} walkers",
                self.iteration,
                self.system.nwalkers()
            );
            self.stats.update("AWE", "iteration", self.iteration)?;
            self.stats.update("AWE", "walkers", self.system.nwalkers())?;

            self.timings.start_iteration();
            self.submit()?;
            let completed = self.receive()?;
            if !completed {
                // Interrupted mid-barrier; the run stops cleanly.
                break;
            }
            self.resample()?;
            self.timings.stop_iteration(&mut self.stats)?;
        }
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<(), String> {
        self.txlog.checkpoint(&CheckpointRef {
            system: &self.system,
            iteration: self.iteration,
            iterations: self.iterations,
            resampler: &self.resampler,
            checkpoint_period: self.checkpoint_period,
            ids: &self.ids,
            first_run: self.first_run,
        })
    }

    ///
    /// Load the last checkpoint, then replay the walker log to re-apply every
    /// result committed after it. The recovered System is the one that
    /// existed the moment before the interruption; the current iteration
    /// resumes, skipping walkers whose results were already committed.
    ///
    pub fn recover(&mut self) -> Result<(), String> {
        log::info!("Recovering from {}", self.txlog.checkpoint_path().display());
        let checkpoint: Checkpoint = self.txlog.recover(|chk: &mut Checkpoint, walker: Walker| {
            log::info!("Recovering walker {}", walker.id());
            chk.system.set_walker(walker);
        })?;
        self.system = checkpoint.system;
        self.iteration = checkpoint.iteration;
        self.iterations = checkpoint.iterations;
        self.resampler = checkpoint.resampler;
        self.checkpoint_period = checkpoint.checkpoint_period;
        self.ids = checkpoint.ids;
        self.first_run = checkpoint.first_run;
        Ok(())
    }

    /// One task per walker still missing its end coordinates.
    fn submit(&mut self) -> Result<(), String> {
        let pending: Vec<WalkerId> = self
            .system
            .walkers()
            .filter(|w| w.end().is_none())
            .map(Walker::id)
            .collect();
        for walker in pending {
            let task = self.new_task(walker)?;
            self.submit_task(task)?;
        }
        Ok(())
    }

    fn new_task(&self, walker_id: WalkerId) -> Result<Task, String> {
        let walker = self
            .system
            .walker(walker_id)
            .ok_or_else(|| format!("No such walker {walker_id}"))?;
        let start = walker
            .start()
            .ok_or_else(|| format!("Walker {walker_id} has no start coordinates"))?;

        let tag = TaskTag {
            outfile: self.workdir.path().join(format!("results.{walker_id}.tar")),
            cell: walker.assignment(),
            weight: walker.weight(),
            walker: walker_id,
        };

        let mut topology = self.system.topology().clone();
        topology.set_coords(start)?;

        let mut task = self.transport.new_task();
        task.specify_tag(&tag.encode());
        task.specify_buffer(WORKER_POSITIONS_NAME, Bytes::from(topology.to_string()));
        task.specify_output_file(WORKER_RESULTS_NAME, &tag.outfile);
        Ok(task)
    }

    fn submit_task(&mut self, task: Task) -> Result<(), String> {
        self.tagset.add(&task.tag, 0);
        self.transport.submit(task)
    }

    ///
    /// The barrier: wait until every walker of the iteration has a result.
    /// Returns false if an interrupt cut the barrier short.
    ///
    fn receive(&mut self) -> Result<bool, String> {
        log::info!("Receiving tasks");
        self.timings.start_barrier();
        loop {
            while !self.transport.is_empty() {
                if self.interrupted() {
                    log::info!("Interrupted; leaving the barrier");
                    return Ok(false);
                }
                let task = match self.transport.wait(self.wait_timeout)? {
                    Some(task) => task,
                    None => {
                        // Workers legitimately take a long time; just keep
                        // waiting.
                        log::debug!(
                            "No result within {:?}; {} tasks outstanding",
                            self.wait_timeout,
                            self.transport.tasks_in_queue()
                        );
                        continue;
                    }
                };
                self.record_task(&task)?;
                self.handle_task(task)?;
                self.try_duplicate_tasks()?;
            }

            if self.invalid.is_empty() {
                break;
            }
            self.repair_invalid_walkers()?;
        }
        self.timings.stop_barrier(&mut self.stats)?;
        self.transport.clear();
        self.tagset.clear();
        log::info!("{}", self.system);
        Ok(true)
    }

    fn record_task(&mut self, task: &Task) -> Result<(), String> {
        TaskStats::task(&mut self.stats, task)?;
        self.task_output_log
            .output(&format!("<====== START task {} output ======>\n", task.tag))?;
        self.task_output_log.output(&task.output)?;
        self.task_output_log
            .output(&format!("<====== END task {} output ======>\n", task.tag))
    }

    fn handle_task(&mut self, task: Task) -> Result<(), String> {
        if task.ok() {
            match self.accept(&task) {
                Ok(()) => {
                    // The accepted result supersedes any in-flight duplicates.
                    self.tagset.discard(&task.tag);
                    self.transport.cancel_by_tag(&task.tag);
                    Ok(())
                }
                Err(marshal) => {
                    // The task claimed success but its payload is unusable.
                    log::warn!("Could not load result for {}: {}", task.tag, marshal);
                    if self.restart_task(&task)? {
                        Ok(())
                    } else {
                        Err(format!(
                            "Master failed: could not load result for {}: {}",
                            task.tag, marshal
                        ))
                    }
                }
            }
        } else if task.output.contains(BAD_MODEL_INDICATOR) {
            self.mark_invalid(&task)
        } else {
            log::warn!(
                "Task {} failed with result {} status {}",
                task.tag,
                task.result,
                task.return_status
            );
            if self.restart_task(&task)? {
                Ok(())
            } else {
                Err(format!(
                    "Task {} exceeded the restart cap; last status {}:\n{}",
                    task.tag, task.return_status, task.output
                ))
            }
        }
    }

    ///
    /// Record a successful result: end coordinates, the new cell assignment,
    /// the transition, and the walker into the transactional log.
    ///
    fn accept(&mut self, task: &Task) -> Result<(), String> {
        let tag = TaskTag::parse(&task.tag)?;
        let (coords, cell) = read_result_archive(&tag.outfile)?;
        if !self.system.has_cell(cell) {
            return Err(format!("Result names unknown cell {cell}"));
        }

        let remaining = self.transport.tasks_in_queue();
        let walker = self
            .system
            .walker_mut(tag.walker)
            .ok_or_else(|| format!("Result for unknown walker {}", tag.walker))?;
        let previous = walker.assignment();
        walker.set_end(coords);
        walker.set_assignment(cell);
        walker.set_valid(true);
        let snapshot = walker.clone();

        let transition = previous != cell;
        log::info!(
            "Iteration {} / {} walker {} transition {} -> {}, {} tasks remaining",
            self.iteration,
            self.iterations,
            tag.walker,
            previous,
            cell,
            remaining
        );
        self.transitions_log.update(
            "AWE",
            "cell_transition",
            format!(
                "iteration {} from {} to {} {}",
                self.iteration, previous, cell, transition
            ),
        )?;

        self.invalid.remove(&tag.walker);
        self.txlog.log(&snapshot)?;
        let _ = std::fs::remove_file(&tag.outfile);
        Ok(())
    }

    ///
    /// Resubmit the failed task's walker if it is still under the restart
    /// cap. The rebuilt task carries the identical tag payload.
    ///
    fn restart_task(&mut self, task: &Task) -> Result<bool, String> {
        let attempts = self.restarts.get(&task.tag).copied().unwrap_or(0);
        if let Some(cap) = self.restart_cap {
            if attempts >= cap {
                return Ok(false);
            }
        }
        log::info!(
            "Task failed with status {}, result {}; restarting {} (#{})",
            task.return_status,
            task.result,
            task.tag,
            attempts + 1
        );
        let tag = TaskTag::parse(&task.tag)?;
        let replacement = self.new_task(tag.walker)?;
        self.submit_task(replacement)?;
        self.restarts.insert(task.tag.clone(), attempts + 1);
        Ok(true)
    }

    ///
    /// A numerically exploded trajectory: the walker cannot continue from
    /// its own coordinates. Mark it; once the rest of the barrier drains, it
    /// is restarted from a healthy donor in the same cell.
    ///
    fn mark_invalid(&mut self, task: &Task) -> Result<(), String> {
        let tag = TaskTag::parse(&task.tag)?;
        let walker = self
            .system
            .walker_mut(tag.walker)
            .ok_or_else(|| format!("Invalid-model report for unknown walker {}", tag.walker))?;
        walker.set_valid(false);
        self.invalid.insert(tag.walker);
        log::warn!(
            "Walker {} produced an invalid model in cell {}",
            tag.walker,
            tag.cell
        );
        Ok(())
    }

    ///
    /// Donate start coordinates from a valid walker in the same cell to each
    /// invalid walker and resubmit it. Fatal if some cell has no valid
    /// donor left.
    ///
    fn repair_invalid_walkers(&mut self) -> Result<(), String> {
        let invalid: Vec<WalkerId> = self.invalid.iter().copied().collect();
        for walker_id in invalid {
            let (cell, donated): (CellId, Coords) = {
                let walker = self
                    .system
                    .walker(walker_id)
                    .ok_or_else(|| format!("No such walker {walker_id}"))?;
                let cell = walker.assignment();
                let donor = self
                    .system
                    .walkers()
                    .find(|w| w.is_valid() && w.assignment() == cell && w.start().is_some())
                    .ok_or_else(|| {
                        format!("No valid donor for invalid walker {walker_id} in cell {cell}")
                    })?;
                (cell, donor.start().cloned().expect("donor has a start"))
            };
            log::info!(
                "Restarting invalid walker {} from donated coordinates in cell {}",
                walker_id,
                cell
            );
            self.system
                .walker_mut(walker_id)
                .expect("walker present above")
                .set_start(donated);
            let task = self.new_task(walker_id)?;
            self.submit_task(task)?;
        }
        Ok(())
    }

    ///
    /// While idle workers outnumber queued tasks, speculatively duplicate the
    /// least-replicated outstanding tags; whichever copy finishes first wins
    /// and the rest are cancelled. Bounded per receipt so a single drain
    /// cannot flood the queue.
    ///
    fn try_duplicate_tasks(&mut self) -> Result<(), String> {
        let mut budget = MAX_DUPLICATIONS_PER_RECEIPT;
        while self.tagset.can_duplicate()
            && self.transport.tasks_in_queue() < self.transport.active_workers()
        {
            if budget == 0 {
                break;
            }
            budget -= 1;
            self.tagset.clean();
            let tag = match self.tagset.select() {
                Some(tag) => tag,
                None => break,
            };
            let parsed = TaskTag::parse(&tag)?;
            log::debug!("Duplicating task {}", tag);
            let task = self.new_task(parsed.walker)?;
            self.submit_task(task)?;
        }
        Ok(())
    }

    fn resample(&mut self) -> Result<(), String> {
        log::info!("Resampling");
        self.timings.start_resample();
        let next = self.resampler.resample(&self.system, &mut self.ids)?;
        self.system = next;
        self.timings.stop_resample(&mut self.stats)
    }

    fn flush_logs(&mut self) {
        for logger in [
            &mut self.stats,
            &mut self.transitions_log,
            &mut self.task_output_log,
        ] {
            if let Err(e) = logger.flush() {
                log::warn!("{e}");
            }
        }
        self.txlog.close();
    }
}

///
/// Extract the ending structure and the cell assignment from a worker result
/// archive. Any missing member or unparsable content is a marshalling
/// failure, which the caller absorbs through the restart path.
///
fn read_result_archive(path: &std::path::Path) -> Result<(Coords, CellId), String> {
    let file = File::open(path)
        .map_err(|e| format!("Failed to open result archive {}: {}", path.display(), e))?;
    let mut archive = tar::Archive::new(file);

    let mut structure: Option<String> = None;
    let mut cell: Option<String> = None;
    for entry in archive
        .entries()
        .map_err(|e| format!("Unreadable result archive {}: {}", path.display(), e))?
    {
        let mut entry =
            entry.map_err(|e| format!("Corrupt result archive {}: {}", path.display(), e))?;
        let name = entry
            .path()
            .map_err(|e| format!("Corrupt member name in {}: {}", path.display(), e))?
            .to_string_lossy()
            .into_owned();
        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .map_err(|e| format!("Failed to read member {} of {}: {}", name, path.display(), e))?;
        match name.as_str() {
            RESULT_POSITIONS => structure = Some(content),
            RESULT_CELL => cell = Some(content),
            _ => {}
        }
    }

    let structure = structure
        .ok_or_else(|| format!("Archive {} is missing {}", path.display(), RESULT_POSITIONS))?;
    let cell = cell.ok_or_else(|| format!("Archive {} is missing {}", path.display(), RESULT_CELL))?;

    let coords = Topology::parse(&structure)?.coords();
    let cell = cell
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("Bad cell id {:?} in {}: {}", cell.trim(), path.display(), e))?;
    Ok((coords, CellId(cell)))
}
