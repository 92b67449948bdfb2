//! File-backed workflow store.
//!
//! One JSON object on disk; every `set_raw` rewrites it atomically.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use senscal_traits::{BoxError, WorkflowStore};
use serde_json::{Map, Value};

use crate::error::{HwError, Result};
use crate::util::write_atomic;

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => Map::new(),
            Ok(text) => match serde_json::from_str::<Value>(&text)? {
                Value::Object(map) => map,
                other => {
                    return Err(HwError::Parse {
                        path,
                        value: other.to_string(),
                    });
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), keys = values.len(), "workflow store opened");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WorkflowStore for JsonFileStore {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(Value::to_string)
    }

    fn set_raw(&self, key: &str, value: String) -> std::result::Result<(), BoxError> {
        let value: Value = serde_json::from_str(&value).map_err(HwError::from)?;
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = values.insert(key.to_owned(), value);
        let bytes = serde_json::to_vec_pretty(&*values).map_err(HwError::from)?;
        if let Err(e) = write_atomic(&self.path, &bytes) {
            // Keep memory and disk in agreement.
            match previous {
                Some(v) => values.insert(key.to_owned(), v),
                None => values.remove(key),
            };
            return Err(e.into());
        }
        tracing::trace!(key, path = %self.path.display(), "workflow value stored");
        Ok(())
    }
}
