// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use transport::{Task, TaskTransport, TransportConfig};

///
/// A single-worker transport that executes each task in a scratch sandbox on
/// the master host. Useful for smoke runs and development; a production pool
/// plugs in behind the same trait.
///
/// Execution failures are reported through the task's result fields rather
/// than as transport errors, so the engine's restart policy applies to them
/// uniformly.
///
pub struct LocalTransport {
    template: Task,
    queue: VecDeque<Task>,
    workdir: tempfile::TempDir,
    sandboxes: u64,
}

impl LocalTransport {
    pub fn new(config: &TransportConfig) -> Result<LocalTransport, String> {
        let template = config.materialize_task()?;
        let workdir = tempfile::Builder::new()
            .prefix("awe-local.")
            .tempdir()
            .map_err(|e| format!("Failed to create local sandbox root: {e}"))?;
        Ok(LocalTransport {
            template,
            queue: VecDeque::new(),
            workdir,
            sandboxes: 0,
        })
    }

    fn execute(&mut self, task: &mut Task) {
        self.sandboxes += 1;
        let sandbox = self.workdir.path().join(format!("task-{}", self.sandboxes));
        if let Err(e) = self.stage(task, &sandbox) {
            task.result = 1;
            task.output = e;
            return;
        }

        let started = Instant::now();
        let run = std::process::Command::new(&task.command)
            .current_dir(&sandbox)
            .output();
        task.time_executing = Some(started.elapsed());
        task.host = Some("localhost".to_owned());

        match run {
            Ok(output) => {
                task.return_status = output.status.code().unwrap_or(-1);
                task.result = 0;
                task.output = String::from_utf8_lossy(&output.stdout).into_owned()
                    + &String::from_utf8_lossy(&output.stderr);
                for wanted in &task.outputs {
                    let produced = sandbox.join(&wanted.remote_name);
                    if produced.exists() {
                        if let Err(e) = fs::copy(&produced, &wanted.local_path) {
                            task.result = 1;
                            task.output
                                .push_str(&format!("\nFailed to collect {}: {}", wanted.remote_name, e));
                        }
                    }
                }
            }
            Err(e) => {
                task.result = 1;
                task.output = format!("Failed to spawn {}: {}", task.command, e);
            }
        }
        let _ = fs::remove_dir_all(&sandbox);
    }

    fn stage(&self, task: &Task, sandbox: &Path) -> Result<(), String> {
        fs::create_dir_all(sandbox)
            .map_err(|e| format!("Failed to create sandbox {}: {}", sandbox.display(), e))?;
        for (name, payload) in &task.buffers {
            write_member(sandbox, name, payload)?;
        }
        for file in &task.input_files {
            let dest = sandbox.join(&file.remote_name);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
            }
            fs::copy(&file.path, &dest).map_err(|e| {
                format!(
                    "Failed to stage {} as {}: {}",
                    file.path.display(),
                    file.remote_name,
                    e
                )
            })?;
        }
        Ok(())
    }
}

fn write_member(sandbox: &Path, name: &str, payload: &[u8]) -> Result<(), String> {
    let dest = sandbox.join(name);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    fs::write(&dest, payload).map_err(|e| format!("Failed to write {}: {}", dest.display(), e))
}

impl TaskTransport for LocalTransport {
    fn new_task(&self) -> Task {
        self.template.clone()
    }

    fn submit(&mut self, mut task: Task) -> Result<(), String> {
        task.time_submitted = Some(SystemTime::now());
        self.queue.push_back(task);
        Ok(())
    }

    // Local execution is synchronous: the wait that dequeues a task also
    // runs it, so the timeout never comes into play.
    fn wait(&mut self, _timeout: Duration) -> Result<Option<Task>, String> {
        let mut task = match self.queue.pop_front() {
            Some(task) => task,
            None => return Ok(None),
        };
        self.execute(&mut task);
        task.time_finished = Some(SystemTime::now());
        Ok(Some(task))
    }

    fn cancel_by_tag(&mut self, tag: &str) -> usize {
        let before = self.queue.len();
        self.queue.retain(|task| task.tag != tag);
        before - self.queue.len()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn tasks_in_queue(&self) -> usize {
        self.queue.len()
    }

    fn active_workers(&self) -> usize {
        1
    }

    fn clear(&mut self) {
        self.queue.clear();
    }
}
