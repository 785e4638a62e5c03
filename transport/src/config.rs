// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use serde_derive::{Deserialize, Serialize};

use crate::{CachedFile, Task};

///
/// Configuration for a transport implementation. The engine treats all of
/// this as an opaque passthrough; only `executable`, `cached_files` and
/// `task_cores` shape the tasks it builds.
///
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Project name to advertise to a catalog, empty for standalone mode.
    pub name: String,
    pub port: u16,
    pub exclusive: bool,
    pub catalog: bool,
    /// Debug subsystems to enable in the transport, empty for none.
    pub debug: String,
    pub monitor: bool,
    pub summary_file: Option<String>,
    pub transport_logfile: Option<String>,
    pub transport_stats_logfile: Option<String>,
    /// Straggler-detection sensitivity; None leaves fast abort disabled.
    pub fastabort_multiplier: Option<f64>,
    pub task_cores: u32,
    pub executable: Option<CachedFile>,
    pub cached_files: Vec<CachedFile>,
}

impl TransportConfig {
    pub fn new(port: u16) -> TransportConfig {
        TransportConfig {
            name: String::new(),
            port,
            exclusive: true,
            catalog: false,
            debug: String::new(),
            monitor: false,
            summary_file: None,
            transport_logfile: None,
            transport_stats_logfile: None,
            fastabort_multiplier: None,
            task_cores: 1,
            executable: None,
            cached_files: Vec::new(),
        }
    }

    /// Mark a file as the task entry point and cache it on workers.
    pub fn execute<P: Into<std::path::PathBuf>>(&mut self, path: P) {
        let file = CachedFile::new(path);
        self.cached_files.push(file.clone());
        self.executable = Some(file);
    }

    /// Cache a static input file on workers between tasks.
    pub fn cache_file<P: Into<std::path::PathBuf>>(&mut self, path: P) {
        self.cached_files.push(CachedFile::new(path));
    }

    ///
    /// A task template running the configured executable with the cached
    /// file set attached. Transport implementations use this to satisfy
    /// `TaskTransport::new_task`.
    ///
    pub fn materialize_task(&self) -> Result<Task, String> {
        let executable = self
            .executable
            .as_ref()
            .ok_or("No task executable configured")?;
        let mut task = Task::new(&format!("./{}", executable.remote_name));
        task.cores = self.task_cores;
        for file in &self.cached_files {
            task.specify_input_file(file.clone());
        }
        Ok(task)
    }
}
