// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use ensemble::{CellId, WalkerId};
use serde_derive::{Deserialize, Serialize};

mod config;
#[cfg(test)]
mod tests;

pub use crate::config::TransportConfig;

/// Remote names of the files exchanged with a worker. The master stages the
/// structure payload under `WORKER_POSITIONS_NAME`; the worker hands back a
/// single `WORKER_RESULTS_NAME` archive containing at least
/// `RESULT_POSITIONS` and `RESULT_CELL`.
pub const WORKER_POSITIONS_NAME: &str = "structure.pdb";
pub const WORKER_RESULTS_NAME: &str = "results.tar";
pub const RESULT_POSITIONS: &str = "structure2.pdb";
pub const RESULT_CELL: &str = "cell2.dat";

///
/// An input file staged alongside a task, optionally cached on the worker
/// between tasks (binaries and static data survive; per-task payloads do
/// not).
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CachedFile {
    pub path: PathBuf,
    pub remote_name: String,
    pub cached: bool,
}

impl CachedFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> CachedFile {
        let path = path.into();
        let remote_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        CachedFile {
            path,
            remote_name,
            cached: true,
        }
    }

    pub fn with_remote_name<P: Into<PathBuf>>(path: P, remote_name: &str) -> CachedFile {
        CachedFile {
            path: path.into(),
            remote_name: remote_name.to_owned(),
            cached: true,
        }
    }
}

/// A local destination for a file the worker produces.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskOutput {
    pub remote_name: String,
    pub local_path: PathBuf,
}

///
/// One unit of work dispatched to the pool: a command, its staged inputs, and
/// the outputs to fetch back. The result fields are unset until the transport
/// reports the task complete.
///
#[derive(Clone, Debug)]
pub struct Task {
    pub tag: String,
    pub command: String,
    pub cores: u32,
    pub buffers: Vec<(String, Bytes)>,
    pub input_files: Vec<CachedFile>,
    pub outputs: Vec<TaskOutput>,

    // Completion report.
    pub result: i32,
    pub return_status: i32,
    pub output: String,
    pub host: Option<String>,
    pub total_bytes_transferred: u64,
    pub time_submitted: Option<SystemTime>,
    pub time_finished: Option<SystemTime>,
    pub time_sending: Option<Duration>,
    pub time_receiving: Option<Duration>,
    pub time_executing: Option<Duration>,
}

impl Task {
    pub fn new(command: &str) -> Task {
        Task {
            tag: String::new(),
            command: command.to_owned(),
            cores: 1,
            buffers: Vec::new(),
            input_files: Vec::new(),
            outputs: Vec::new(),
            result: 0,
            return_status: 0,
            output: String::new(),
            host: None,
            total_bytes_transferred: 0,
            time_submitted: None,
            time_finished: None,
            time_sending: None,
            time_receiving: None,
            time_executing: None,
        }
    }

    pub fn specify_tag(&mut self, tag: &str) {
        self.tag = tag.to_owned();
    }

    /// Stage an in-memory payload under the given remote name.
    pub fn specify_buffer(&mut self, remote_name: &str, payload: Bytes) {
        self.buffers.push((remote_name.to_owned(), payload));
    }

    pub fn specify_input_file(&mut self, file: CachedFile) {
        self.input_files.push(file);
    }

    pub fn specify_output_file(&mut self, remote_name: &str, local_path: &Path) {
        self.outputs.push(TaskOutput {
            remote_name: remote_name.to_owned(),
            local_path: local_path.to_owned(),
        });
    }

    /// A task succeeded iff the transport delivered it and the command exited
    /// zero.
    pub fn ok(&self) -> bool {
        self.result == 0 && self.return_status == 0
    }
}

///
/// The seam between the iteration engine and the work-dispatch layer.
///
/// Implementations own connection handling, file staging, scheduling, and
/// straggler abort; the engine only submits tasks, blocks on `wait`, and
/// cancels superseded duplicates by tag. At most one transport exists per
/// process, and it is never checkpointed: recovery re-creates it from
/// `TransportConfig`.
///
pub trait TaskTransport {
    /// A task template carrying the configured executable and cached files.
    fn new_task(&self) -> Task;

    fn submit(&mut self, task: Task) -> Result<(), String>;

    ///
    /// Block up to `timeout` for one completed task. `Ok(None)` means the
    /// timeout elapsed; the engine simply calls again.
    ///
    fn wait(&mut self, timeout: Duration) -> Result<Option<Task>, String>;

    /// Cancel every in-flight task carrying the tag; returns how many were
    /// cancelled.
    fn cancel_by_tag(&mut self, tag: &str) -> usize;

    /// True when no submitted task remains outstanding.
    fn is_empty(&self) -> bool;

    fn tasks_in_queue(&self) -> usize;

    fn active_workers(&self) -> usize;

    /// Drop all internal task bookkeeping between iterations.
    fn clear(&mut self);
}

///
/// The structured task tag: `<outfile>+<cell-id>+<weight>+<walker-id>`.
///
/// The tag is the only identity a task carries through the transport, so it
/// encodes everything needed to route a result back to its walker, plus the
/// local path where the result archive lands.
///
#[derive(Clone, Debug, PartialEq)]
pub struct TaskTag {
    pub outfile: PathBuf,
    pub cell: CellId,
    pub weight: f64,
    pub walker: WalkerId,
}

impl TaskTag {
    pub fn encode(&self) -> String {
        format!(
            "{}+{}+{}+{}",
            self.outfile.display(),
            self.cell,
            self.weight,
            self.walker
        )
    }

    pub fn parse(tag: &str) -> Result<TaskTag, String> {
        // Split from the right: the outfile path may itself contain '+'.
        let mut fields = tag.rsplitn(4, '+');
        let walker = fields.next();
        let weight = fields.next();
        let cell = fields.next();
        let outfile = fields.next();
        match (outfile, cell, weight, walker) {
            (Some(outfile), Some(cell), Some(weight), Some(walker)) => Ok(TaskTag {
                outfile: PathBuf::from(outfile),
                cell: CellId(
                    cell.parse()
                        .map_err(|e| format!("Bad cell id in tag {tag:?}: {e}"))?,
                ),
                weight: weight
                    .parse()
                    .map_err(|e| format!("Bad weight in tag {tag:?}: {e}"))?,
                walker: WalkerId(
                    walker
                        .parse()
                        .map_err(|e| format!("Bad walker id in tag {tag:?}: {e}"))?,
                ),
            }),
            _ => Err(format!("Malformed task tag {tag:?}")),
        }
    }
}
