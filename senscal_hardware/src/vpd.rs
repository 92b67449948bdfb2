//! File-backed non-volatile calibration store.
//!
//! Bias values are staged in memory by `write_bias` and merged into the JSON
//! file (`entry -> integer`) on `flush`, which replaces the file atomically.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use senscal_traits::{BiasMap, BoxError, CalibrationStore};

use crate::error::Result;
use crate::util::write_atomic;

#[derive(Debug)]
pub struct FileCalibrationStore {
    path: PathBuf,
    staged: Mutex<BiasMap>,
}

impl FileCalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            staged: Mutex::new(BiasMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Values committed so far; empty when nothing was ever flushed.
    pub fn load(&self) -> Result<BiasMap> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BiasMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn pending(&self) -> usize {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl CalibrationStore for FileCalibrationStore {
    fn write_bias(&self, bias: &BiasMap) -> std::result::Result<(), BoxError> {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(bias.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(())
    }

    fn flush(&self) -> std::result::Result<(), BoxError> {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        if staged.is_empty() {
            return Ok(());
        }
        let mut committed = self.load()?;
        committed.extend(staged.iter().map(|(k, v)| (k.clone(), *v)));
        let bytes = serde_json::to_vec_pretty(&committed)?;
        write_atomic(&self.path, &bytes)?;
        tracing::info!(path = %self.path.display(), entries = staged.len(), "calibration bias committed");
        staged.clear();
        Ok(())
    }
}
