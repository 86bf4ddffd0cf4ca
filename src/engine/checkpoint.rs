use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::domain::StepResult;
use crate::error::CheckpointError;

/// File holding a step's stored result inside its directory.
pub const RESULT_FILE: &str = "result.json";
/// Present inside a step directory while that step executes.
pub const RUNNING_MARKER: &str = ".relax_is_running";

/// Path-addressed storage of step results.
///
/// Resumability is purely a function of what exists at a location; there is
/// no locking beyond what a single store call needs.
pub trait CheckpointStore: Send + Sync {
    fn exists(&self, location: &Path) -> bool;

    fn load(&self, location: &Path) -> Result<StepResult, CheckpointError>;

    /// Stores `result` at `result.location`, replacing any earlier record.
    fn store(&self, result: &StepResult) -> Result<(), CheckpointError>;

    /// Removes everything stored under `location`. Missing trees are not an error.
    fn remove_tree(&self, location: &Path) -> Result<(), CheckpointError>;

    fn mark_running(&self, location: &Path) -> Result<(), CheckpointError>;

    fn clear_running(&self, location: &Path) -> Result<(), CheckpointError>;

    fn is_running(&self, location: &Path) -> bool;

    /// Locations stored directly below `location`, sorted.
    fn children(&self, location: &Path) -> Vec<PathBuf>;
}

// --- Filesystem ---

#[derive(Serialize, Deserialize)]
struct Envelope {
    written_at: String,
    result: StepResult,
}

/// Stores each result as `<location>/result.json`.
#[derive(Debug, Clone, Default)]
pub struct FsCheckpointStore;

impl FsCheckpointStore {
    pub fn new() -> Self {
        Self
    }

    /// Time at which the record at `location` was written, if any.
    pub fn written_at(&self, location: &Path) -> Option<String> {
        let text = fs::read_to_string(location.join(RESULT_FILE)).ok()?;
        let envelope: Envelope = serde_json::from_str(&text).ok()?;
        Some(envelope.written_at)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn exists(&self, location: &Path) -> bool {
        location.join(RESULT_FILE).is_file()
    }

    fn load(&self, location: &Path) -> Result<StepResult, CheckpointError> {
        let path = location.join(RESULT_FILE);
        if !path.is_file() {
            return Err(CheckpointError::NotFound(location.to_path_buf()));
        }
        let text = fs::read_to_string(&path).map_err(io_err(&path))?;
        let envelope: Envelope =
            serde_json::from_str(&text).map_err(|source| CheckpointError::Format { path, source })?;
        Ok(envelope.result)
    }

    fn store(&self, result: &StepResult) -> Result<(), CheckpointError> {
        let dir = result.location.as_path();
        fs::create_dir_all(dir).map_err(io_err(dir))?;

        let envelope = Envelope {
            written_at: Utc::now().to_rfc3339(),
            result: result.clone(),
        };
        let path = dir.join(RESULT_FILE);
        let text = serde_json::to_string_pretty(&envelope).map_err(|source| {
            CheckpointError::Format {
                path: path.clone(),
                source,
            }
        })?;

        // Write-then-rename so an interrupted write never leaves a half record.
        let tmp = dir.join(format!("{}.tmp", RESULT_FILE));
        fs::write(&tmp, text).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))?;
        Ok(())
    }

    fn remove_tree(&self, location: &Path) -> Result<(), CheckpointError> {
        match fs::remove_dir_all(location) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(location)(e)),
        }
    }

    fn mark_running(&self, location: &Path) -> Result<(), CheckpointError> {
        fs::create_dir_all(location).map_err(io_err(location))?;
        let marker = location.join(RUNNING_MARKER);
        fs::write(&marker, Utc::now().to_rfc3339()).map_err(io_err(&marker))
    }

    fn clear_running(&self, location: &Path) -> Result<(), CheckpointError> {
        let marker = location.join(RUNNING_MARKER);
        match fs::remove_file(&marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&marker)(e)),
        }
    }

    fn is_running(&self, location: &Path) -> bool {
        location.join(RUNNING_MARKER).exists()
    }

    fn children(&self, location: &Path) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = match fs::read_dir(location) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect(),
            Err(_) => Vec::new(),
        };
        out.sort();
        out
    }
}

// --- In-memory ---

#[derive(Default)]
struct MemoryInner {
    results: HashMap<PathBuf, StepResult>,
    running: HashSet<PathBuf>,
}

/// Keeps results in memory. Useful for dry runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored locations, sorted.
    pub fn locations(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self.inner.lock().results.keys().cloned().collect();
        out.sort();
        out
    }
}

impl CheckpointStore for MemoryStore {
    fn exists(&self, location: &Path) -> bool {
        self.inner.lock().results.contains_key(location)
    }

    fn load(&self, location: &Path) -> Result<StepResult, CheckpointError> {
        self.inner
            .lock()
            .results
            .get(location)
            .cloned()
            .ok_or_else(|| CheckpointError::NotFound(location.to_path_buf()))
    }

    fn store(&self, result: &StepResult) -> Result<(), CheckpointError> {
        self.inner
            .lock()
            .results
            .insert(result.location.clone(), result.clone());
        Ok(())
    }

    fn remove_tree(&self, location: &Path) -> Result<(), CheckpointError> {
        let mut inner = self.inner.lock();
        inner.results.retain(|k, _| !k.starts_with(location));
        inner.running.retain(|k| !k.starts_with(location));
        Ok(())
    }

    fn mark_running(&self, location: &Path) -> Result<(), CheckpointError> {
        self.inner.lock().running.insert(location.to_path_buf());
        Ok(())
    }

    fn clear_running(&self, location: &Path) -> Result<(), CheckpointError> {
        self.inner.lock().running.remove(location);
        Ok(())
    }

    fn is_running(&self, location: &Path) -> bool {
        self.inner.lock().running.contains(location)
    }

    fn children(&self, location: &Path) -> Vec<PathBuf> {
        let inner = self.inner.lock();
        let mut out: Vec<PathBuf> = inner
            .results
            .keys()
            .chain(inner.running.iter())
            .filter(|k| k.parent() == Some(location))
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        out
    }
}
