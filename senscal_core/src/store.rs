//! Typed access to the persistent workflow store.
//!
//! The store itself (`senscal_traits::WorkflowStore`) only moves JSON text;
//! `WorkflowStoreExt` adds `get::<T>` / `set::<T>` on top of it.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use senscal_traits::{BoxError, WorkflowStore};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Keys used in the workflow store.
pub mod keys {
    /// The persisted `CalibrationMap`.
    pub const CALIBRATION_MAP: &str = "calibration_map";
    /// The group Setup last presented to the operator.
    pub const CALIBRATION_INSTRUCTION: &str = "calibration_instruction";
    /// Whether a full storage wipe was requested earlier in the workflow.
    pub const WIPE_DEVICE: &str = "wipe_device";
}

pub trait WorkflowStoreExt: WorkflowStore {
    /// `Ok(None)` when the key was never written; an error when it holds
    /// something that does not decode as `T`.
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get_raw(key) {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }

    fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.set_raw(key, raw)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

impl<S: WorkflowStore + ?Sized> WorkflowStoreExt for S {}

/// Volatile store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }
}

impl WorkflowStore for MemoryStore {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set_raw(&self, key: &str, value: String) -> Result<(), BoxError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value);
        Ok(())
    }
}
