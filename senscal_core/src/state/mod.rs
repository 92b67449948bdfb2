//! Workflow states of the calibration loop: Check → Setup → Run.
//!
//! Each state is driven by an outer controller through `StateHandler`. All
//! methods run on one owning sequence; only Run hands work to background
//! threads, and it marshals the results back before touching the map.

mod check;
mod run;
mod setup;

pub use check::{CheckCalibrationState, ComponentEntry};
pub use run::{RunCalibrationState, RunCalibrationStateBuilder, RunEvent};
pub use setup::SetupCalibrationState;

use std::collections::BTreeSet;
use std::fmt;

use senscal_traits::{SensorProbe, WorkflowStore};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, Result};
use crate::model::{CalibrationMap, Component, is_valid_component};

/// Workflow states reachable from the calibration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextState {
    CheckCalibration,
    SetupCalibration,
    RunCalibration,
    /// Next repair phase when calibration is not (or no longer) needed.
    ProvisionDevice,
    /// Exit after Run when no storage wipe was requested.
    WpEnablePhysical,
    /// Exit after Run when a storage wipe was requested.
    Finalize,
}

impl NextState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckCalibration => "check_calibration",
            Self::SetupCalibration => "setup_calibration",
            Self::RunCalibration => "run_calibration",
            Self::ProvisionDevice => "provision_device",
            Self::WpEnablePhysical => "wp_enable_physical",
            Self::Finalize => "finalize",
        }
    }

    /// True for states outside the calibration loop.
    pub fn leaves_calibration(self) -> bool {
        matches!(
            self,
            Self::ProvisionDevice | Self::WpEnablePhysical | Self::Finalize
        )
    }
}

impl fmt::Display for NextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateCase {
    pub error: ErrorCode,
    pub next: NextState,
}

impl StateCase {
    pub fn ok(next: NextState) -> Self {
        Self {
            error: ErrorCode::Ok,
            next,
        }
    }

    pub fn error(error: ErrorCode, next: NextState) -> Self {
        Self { error, next }
    }
}

pub trait StateHandler {
    /// Operator input accepted by `get_next_state_case`.
    type Input;

    fn state(&self) -> NextState;
    fn initialize_state(&mut self) -> Result<()>;
    fn get_next_state_case(&mut self, input: Self::Input) -> StateCase;
    /// Entry point after an unexpected restart while this state was active.
    fn try_resume_at_boot(&mut self) -> StateCase;
}

/// Calibratable components currently present on the device.
pub(crate) fn probed_components(probe: &dyn SensorProbe) -> BTreeSet<Component> {
    probe
        .probe()
        .into_iter()
        .map(Component::from_sensor)
        .filter(|c| is_valid_component(*c))
        .collect()
}

/// Persist `map`, logging instead of failing. Returns whether it was stored.
pub(crate) fn persist(map: &CalibrationMap, store: &dyn WorkflowStore) -> bool {
    match map.store(store) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "failed to persist calibration map");
            false
        }
    }
}
