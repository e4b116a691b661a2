// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Persistence for the supervised host engine pid.
//!
//! The record is the only state shared between invocations of the tool: a
//! `start` writes it, and a later `stop` or `status` reads it back to find the
//! process again.

use crate::error::PidStoreError;
use log::debug;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub trait PidStore: Send + Sync {
    /// Returns the recorded pid, or `None` when no record exists.
    fn load(&self) -> Result<Option<u32>, PidStoreError>;

    fn save(&self, pid: u32) -> Result<(), PidStoreError>;

    /// Removes the record. Returns whether one existed.
    fn clear(&self) -> Result<bool, PidStoreError>;

    /// Human readable location, used in log messages.
    fn location(&self) -> String;
}

/// Pid record kept in a plain text file.
#[derive(Debug, Clone)]
pub struct FilePidStore {
    path: PathBuf,
}

impl FilePidStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> PidStoreError {
        PidStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl PidStore for FilePidStore {
    fn load(&self) -> Result<Option<u32>, PidStoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        parse_pid(&contents).map(Some)
    }

    /// Writes to a temporary file next to the record and renames it into
    /// place, so readers never observe a partially written pid.
    fn save(&self, pid: u32) -> Result<(), PidStoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| self.io_error(e))?;
        tmp.write_all(pid.to_string().as_bytes())
            .map_err(|e| self.io_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_error(e.error))?;

        debug!("wrote pid {pid} to {}", self.path.display());
        Ok(())
    }

    fn clear(&self) -> Result<bool, PidStoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("removed pid record {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory pid record. Clones share the same slot, which lets a test keep a
/// handle on the record a supervisor is using.
#[derive(Debug, Clone, Default)]
pub struct MemoryPidStore {
    slot: Arc<Mutex<Option<u32>>>,
}

impl MemoryPidStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pid(pid: u32) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(pid))),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<u32>> {
        // A poisoned slot still holds a valid Option<u32>.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PidStore for MemoryPidStore {
    fn load(&self) -> Result<Option<u32>, PidStoreError> {
        Ok(*self.slot())
    }

    fn save(&self, pid: u32) -> Result<(), PidStoreError> {
        *self.slot() = Some(pid);
        Ok(())
    }

    fn clear(&self) -> Result<bool, PidStoreError> {
        Ok(self.slot().take().is_some())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

fn parse_pid(contents: &str) -> Result<u32, PidStoreError> {
    let trimmed = contents.trim();
    match trimmed.parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(PidStoreError::Parse(trimmed.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePidStore::new(dir.path().join("engine.pid"));

        assert_eq!(store.load().unwrap(), None);
        store.save(4242).unwrap();
        assert_eq!(store.load().unwrap(), Some(4242));
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap(),
            "4242",
            "record should hold the bare pid"
        );
    }

    #[test]
    fn test_file_store_overwrites_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePidStore::new(dir.path().join("engine.pid"));

        store.save(1).unwrap();
        store.save(2).unwrap();
        assert_eq!(store.load().unwrap(), Some(2));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(leftovers.len(), 1, "temporary files should be renamed away");
    }

    #[test]
    fn test_file_store_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePidStore::new(dir.path().join("run").join("dcgm").join("engine.pid"));

        store.save(77).unwrap();
        assert_eq!(store.load().unwrap(), Some(77));
    }

    #[test]
    fn test_file_store_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePidStore::new(dir.path().join("engine.pid"));

        assert!(!store.clear().unwrap(), "clearing a missing record is a no-op");
        store.save(9).unwrap();
        assert!(store.clear().unwrap());
        assert!(!store.path().exists());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.pid");
        std::fs::write(&path, "not-a-pid\n").unwrap();

        let store = FilePidStore::new(&path);
        assert!(matches!(store.load(), Err(PidStoreError::Parse(s)) if s == "not-a-pid"));
    }

    #[test]
    fn test_parse_pid_tolerates_whitespace() {
        assert_eq!(parse_pid(" 123\n").unwrap(), 123);
        assert!(parse_pid("0").is_err());
        assert!(parse_pid("").is_err());
        assert!(parse_pid("-5").is_err());
    }

    #[test]
    fn test_memory_store_shares_slot_between_clones() {
        let store = MemoryPidStore::new();
        let observer = store.clone();

        store.save(10).unwrap();
        assert_eq!(observer.load().unwrap(), Some(10));
        assert!(observer.clear().unwrap());
        assert_eq!(store.load().unwrap(), None);
        assert!(!store.clear().unwrap());
    }
}
