// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use transport::{Task, TaskTransport};

type TaskHandler = Box<dyn FnMut(&mut Task)>;

struct State {
    queue: VecDeque<Task>,
    submitted: Vec<String>,
    cancelled: Vec<String>,
    workers: usize,
    handler: TaskHandler,
}

///
/// An in-memory transport for engine tests: submitted tasks queue up, and
/// each `wait` completes the oldest one through the scripted handler. The
/// handle is cloneable so a test can keep inspecting submissions and
/// cancellations after the engine takes ownership.
///
#[derive(Clone)]
pub struct ScriptedTransport {
    state: Arc<Mutex<State>>,
}

impl ScriptedTransport {
    pub fn new<F: FnMut(&mut Task) + 'static>(workers: usize, handler: F) -> ScriptedTransport {
        ScriptedTransport {
            state: Arc::new(Mutex::new(State {
                queue: VecDeque::new(),
                submitted: Vec::new(),
                cancelled: Vec::new(),
                workers,
                handler: Box::new(handler),
            })),
        }
    }

    /// Every tag ever submitted, duplicates and restarts included.
    pub fn submitted_tags(&self) -> Vec<String> {
        self.state.lock().submitted.clone()
    }

    /// One entry per task removed by `cancel_by_tag`.
    pub fn cancelled_tags(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }
}

impl TaskTransport for ScriptedTransport {
    fn new_task(&self) -> Task {
        Task::new("./run-task")
    }

    fn submit(&mut self, mut task: Task) -> Result<(), String> {
        task.time_submitted = Some(SystemTime::now());
        let mut state = self.state.lock();
        state.submitted.push(task.tag.clone());
        state.queue.push_back(task);
        Ok(())
    }

    fn wait(&mut self, _timeout: Duration) -> Result<Option<Task>, String> {
        let mut state = self.state.lock();
        match state.queue.pop_front() {
            Some(mut task) => {
                (state.handler)(&mut task);
                task.time_finished = Some(SystemTime::now());
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    fn cancel_by_tag(&mut self, tag: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.queue.len();
        state.queue.retain(|task| task.tag != tag);
        let cancelled = before - state.queue.len();
        for _ in 0..cancelled {
            state.cancelled.push(tag.to_owned());
        }
        cancelled
    }

    fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    fn tasks_in_queue(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn active_workers(&self) -> usize {
        self.state.lock().workers
    }

    fn clear(&mut self) {
        self.state.lock().queue.clear();
    }
}
