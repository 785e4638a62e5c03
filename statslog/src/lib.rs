// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use transport::Task;

#[cfg(test)]
mod tests;

///
/// An append-only, time-stamped, gzip-compressed event log.
///
/// Every line is `"<unix-secs> <component> <name> <value>"`. The file is
/// opened in append mode, so each process run contributes one gzip member;
/// standard tooling reads the concatenation transparently.
///
pub struct StatsLogger {
    path: PathBuf,
    encoder: Option<GzEncoder<std::fs::File>>,
}

impl StatsLogger {
    pub fn new(path: &Path) -> Result<StatsLogger, String> {
        let mut logger = StatsLogger {
            path: path.to_owned(),
            encoder: None,
        };
        logger.open()?;
        Ok(logger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&mut self) -> Result<(), String> {
        if self.encoder.is_some() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| format!("Failed to open stats log {}: {}", self.path.display(), e))?;
        self.encoder = Some(GzEncoder::new(file, Compression::default()));
        Ok(())
    }

    /// Finish the current gzip member and close the file.
    pub fn close(&mut self) -> Result<(), String> {
        if let Some(encoder) = self.encoder.take() {
            encoder
                .finish()
                .map_err(|e| format!("Failed to finish stats log {}: {}", self.path.display(), e))?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), String> {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder
                .flush()
                .map_err(|e| format!("Failed to flush stats log {}: {}", self.path.display(), e))?;
        }
        Ok(())
    }

    /// Append one time-stamped event line.
    pub fn update<V: Display>(
        &mut self,
        component: &str,
        name: &str,
        value: V,
    ) -> Result<(), String> {
        let t = unix_seconds();
        self.output(&format!("{t:.6} {component} {name} {value}\n"))
    }

    /// Append raw text (task output capture).
    pub fn output(&mut self, text: &str) -> Result<(), String> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| format!("Stats log {} is closed", self.path.display()))?;
        encoder
            .write_all(text.as_bytes())
            .map_err(|e| format!("Failed to write stats log {}: {}", self.path.display(), e))
    }
}

impl Drop for StatsLogger {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

///
/// A stopwatch over monotonic time.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct Timer {
    started: Option<Instant>,
    stopped: Option<Duration>,
}

impl Timer {
    pub fn new() -> Timer {
        Timer::default()
    }

    pub fn reset(&mut self) {
        *self = Timer::default();
    }

    pub fn start(&mut self) {
        self.started = Some(Instant::now());
        self.stopped = None;
    }

    pub fn stop(&mut self) {
        if let Some(started) = self.started {
            self.stopped = Some(started.elapsed());
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some() && self.stopped.is_none()
    }

    /// Elapsed time: up to `stop` if stopped, else up to now. Zero if never
    /// started.
    pub fn elapsed(&self) -> Duration {
        match (self.started, self.stopped) {
            (Some(_), Some(stopped)) => stopped,
            (Some(started), None) => started.elapsed(),
            (None, _) => Duration::ZERO,
        }
    }
}

///
/// The master's per-phase timings: one timer each for the whole iteration,
/// the receive barrier, and the resample step, reported through the stats
/// logger when stopped.
///
pub struct RunTimings {
    iteration: Timer,
    barrier: Timer,
    resample: Timer,
}

impl RunTimings {
    pub fn new() -> RunTimings {
        RunTimings {
            iteration: Timer::new(),
            barrier: Timer::new(),
            resample: Timer::new(),
        }
    }

    pub fn start_iteration(&mut self) {
        self.iteration.start();
    }

    pub fn stop_iteration(&mut self, logger: &mut StatsLogger) -> Result<(), String> {
        Self::stop_and_report(&mut self.iteration, "iteration time", logger)
    }

    pub fn start_barrier(&mut self) {
        self.barrier.start();
    }

    pub fn stop_barrier(&mut self, logger: &mut StatsLogger) -> Result<(), String> {
        Self::stop_and_report(&mut self.barrier, "barrier time", logger)
    }

    pub fn start_resample(&mut self) {
        self.resample.start();
    }

    pub fn stop_resample(&mut self, logger: &mut StatsLogger) -> Result<(), String> {
        Self::stop_and_report(&mut self.resample, "resample time", logger)
    }

    fn stop_and_report(
        timer: &mut Timer,
        name: &str,
        logger: &mut StatsLogger,
    ) -> Result<(), String> {
        timer.stop();
        let elapsed = timer.elapsed().as_secs_f64();
        timer.reset();
        logger.update("AWE", name, elapsed)
    }
}

///
/// Reports the per-task fields the transport fills in on completion.
///
pub struct TaskStats;

impl TaskStats {
    pub fn task(logger: &mut StatsLogger, task: &Task) -> Result<(), String> {
        let component = "TASK";
        logger.update(component, "host", task.host.as_deref().unwrap_or("unknown"))?;
        logger.update(component, "tag", &task.tag)?;
        logger.update(component, "result", task.result)?;
        logger.update(component, "return_status", task.return_status)?;
        logger.update(
            component,
            "total_bytes_transferred",
            task.total_bytes_transferred,
        )?;
        if let Some(sending) = task.time_sending {
            logger.update(component, "time_send_files", sending.as_secs_f64())?;
        }
        if let Some(receiving) = task.time_receiving {
            logger.update(component, "time_receive_files", receiving.as_secs_f64())?;
        }
        if let Some(executing) = task.time_executing {
            logger.update(component, "cmd_execution_time", executing.as_secs_f64())?;
        }
        if let (Some(submitted), Some(finished)) = (task.time_submitted, task.time_finished) {
            if let Ok(turnaround) = finished.duration_since(submitted) {
                logger.update(component, "turnaround_time", turnaround.as_secs_f64())?;
            }
        }
        Ok(())
    }
}
