// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;


///
/// An append-only value log paired with a replaceable checkpoint, giving the
/// iteration engine crash-consistent state.
///
/// Values appended with `log` record progress within the current epoch;
/// `checkpoint` atomically replaces the snapshot and starts a new epoch by
/// truncating the value log. `recover` loads the snapshot and replays
/// whatever the log accumulated after it, tolerating a torn final entry from
/// a crash mid-append.
///
pub struct TransactionalLog {
    checkpoint_path: PathBuf,
    log_path: PathBuf,
    log_file: Option<File>,
}

impl TransactionalLog {
    pub fn new(checkpoint_path: &Path, log_path: &Path) -> TransactionalLog {
        TransactionalLog {
            checkpoint_path: checkpoint_path.to_owned(),
            log_path: log_path.to_owned(),
            log_file: None,
        }
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// The rotated previous checkpoint, for operator fallback if the current
    /// one proves unreadable.
    pub fn last_path(&self) -> PathBuf {
        let mut name = self.checkpoint_path.as_os_str().to_owned();
        name.push(".last");
        PathBuf::from(name)
    }

    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint_path.exists()
    }

    /// Append one value to the log and flush it to the OS.
    pub fn log<V: Serialize>(&mut self, value: &V) -> Result<(), String> {
        if self.log_file.is_none() {
            ensure_parent(&self.log_path)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .map_err(|e| format!("Failed to open log {}: {}", self.log_path.display(), e))?;
            self.log_file = Some(file);
        }
        let file = self.log_file.as_mut().unwrap();
        bincode::serialize_into(&mut *file, value)
            .map_err(|e| format!("Failed to append to log {}: {}", self.log_path.display(), e))?;
        file.flush()
            .map_err(|e| format!("Failed to flush log {}: {}", self.log_path.display(), e))
    }

    ///
    /// Atomically replace the checkpoint and reset the value log.
    ///
    /// The previous checkpoint is rotated to a `.last` sibling first; the new
    /// snapshot is written to a temp file in the same directory and renamed
    /// over the checkpoint path, so a crash at any point leaves a readable
    /// snapshot behind.
    ///
    pub fn checkpoint<V: Serialize>(&mut self, value: &V) -> Result<(), String> {
        self.close();
        ensure_parent(&self.checkpoint_path)?;

        if self.checkpoint_path.exists() {
            let last = self.last_path();
            fs::rename(&self.checkpoint_path, &last).map_err(|e| {
                format!(
                    "Failed to rotate checkpoint {} to {}: {}",
                    self.checkpoint_path.display(),
                    last.display(),
                    e
                )
            })?;
        }

        let dir = self
            .checkpoint_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut staged = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| format!("Failed to stage checkpoint in {}: {}", dir.display(), e))?;
        bincode::serialize_into(staged.as_file_mut(), value)
            .map_err(|e| format!("Failed to serialize checkpoint: {e}"))?;
        staged.as_file_mut().flush().map_err(|e| {
            format!(
                "Failed to flush staged checkpoint {}: {}",
                staged.path().display(),
                e
            )
        })?;
        staged.persist(&self.checkpoint_path).map_err(|e| {
            format!(
                "Failed to persist checkpoint {}: {}",
                self.checkpoint_path.display(),
                e
            )
        })?;

        // The snapshot supersedes everything logged this epoch.
        if self.log_path.exists() {
            fs::remove_file(&self.log_path).map_err(|e| {
                format!("Failed to reset log {}: {}", self.log_path.display(), e)
            })?;
        }
        Ok(())
    }

    ///
    /// Load the checkpoint, then fold every replayable log entry into it via
    /// `apply`. A torn final entry (crash mid-append) ends the replay.
    ///
    pub fn recover<T, V, F>(&mut self, mut apply: F) -> Result<T, String>
    where
        T: DeserializeOwned,
        V: DeserializeOwned,
        F: FnMut(&mut T, V),
    {
        self.close();
        let blob = fs::read(&self.checkpoint_path).map_err(|e| {
            format!(
                "Failed to read checkpoint {}: {}",
                self.checkpoint_path.display(),
                e
            )
        })?;
        let mut state: T = bincode::deserialize(&blob).map_err(|e| {
            format!(
                "Corrupt checkpoint {}: {} (a previous snapshot may exist at {})",
                self.checkpoint_path.display(),
                e,
                self.last_path().display()
            )
        })?;

        if self.log_path.exists() {
            let file = File::open(&self.log_path)
                .map_err(|e| format!("Failed to open log {}: {}", self.log_path.display(), e))?;
            let mut reader = BufReader::new(file);
            let mut replayed = 0_usize;
            loop {
                match bincode::deserialize_from::<_, V>(&mut reader) {
                    Ok(value) => {
                        apply(&mut state, value);
                        replayed += 1;
                    }
                    Err(e) => {
                        if !is_clean_eof(&e) {
                            log::warn!(
                                "Stopping replay of {} after {} entries on a torn tail: {}",
                                self.log_path.display(),
                                replayed,
                                e
                            );
                        }
                        break;
                    }
                }
            }
            log::info!(
                "Replayed {} log entries from {}",
                replayed,
                self.log_path.display()
            );
        }
        Ok(state)
    }

    pub fn close(&mut self) {
        self.log_file = None;
    }
}

fn ensure_parent(path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }
    }
    Ok(())
}

fn is_clean_eof(error: &bincode::Error) -> bool {
    match &**error {
        bincode::ErrorKind::Io(io) => io.kind() == ErrorKind::UnexpectedEof,
        _ => false,
    }
}
