use std::collections::BTreeSet;
use std::sync::Arc;

use senscal_traits::{SensorProbe, WorkflowStore};
use serde::{Deserialize, Serialize};

use super::{NextState, StateCase, StateHandler, persist, probed_components};
use crate::error::{ErrorCode, Result};
use crate::model::{CalibrationMap, CalibrationStatus, Component, group_of, should_calibrate};

/// One row of the component list shown to, and returned by, the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentEntry {
    pub component: Component,
    pub status: CalibrationStatus,
}

/// Reconciles probed sensors with the persisted map and lets the operator
/// confirm which components still need calibration.
pub struct CheckCalibrationState {
    store: Arc<dyn WorkflowStore>,
    probe: Arc<dyn SensorProbe>,
    presented: Vec<ComponentEntry>,
}

impl CheckCalibrationState {
    pub fn new(store: Arc<dyn WorkflowStore>, probe: Arc<dyn SensorProbe>) -> Self {
        Self {
            store,
            probe,
            presented: Vec::new(),
        }
    }

    /// Components as presented after the last `initialize_state`.
    pub fn components(&self) -> &[ComponentEntry] {
        &self.presented
    }

    fn reject(reason: &str, entry: Option<&ComponentEntry>) -> StateCase {
        tracing::warn!(
            reason,
            component = entry.map(|e| e.component.as_str()),
            status = entry.map(|e| e.status.as_str()),
            "rejected calibration selection"
        );
        StateCase::error(ErrorCode::RequestInvalid, NextState::CheckCalibration)
    }
}

impl StateHandler for CheckCalibrationState {
    type Input = Vec<ComponentEntry>;

    fn state(&self) -> NextState {
        NextState::CheckCalibration
    }

    fn initialize_state(&mut self) -> Result<()> {
        let probed = probed_components(self.probe.as_ref());
        let mut map = CalibrationMap::load_or_empty(self.store.as_ref())?;

        let added = map.insert_probed(probed);
        if !added.is_empty() {
            tracing::info!(?added, "new sensors tracked for calibration");
            persist(&map, self.store.as_ref());
        }

        self.presented = map
            .iter()
            .map(|(_, component, status)| ComponentEntry { component, status })
            .collect();
        Ok(())
    }

    fn get_next_state_case(&mut self, selection: Vec<ComponentEntry>) -> StateCase {
        if selection.len() != self.presented.len() {
            tracing::warn!(
                got = selection.len(),
                expected = self.presented.len(),
                "selection size does not match presented components"
            );
            return StateCase::error(ErrorCode::RequestInvalid, NextState::CheckCalibration);
        }

        let mut map = match CalibrationMap::load_or_empty(self.store.as_ref()) {
            Ok(map) => map,
            Err(e) => {
                tracing::error!(error = %e, "cannot read calibration map");
                return StateCase::error(ErrorCode::TransitionFailed, NextState::CheckCalibration);
            }
        };

        // Validate everything first; a rejected selection must not change the map.
        let mut seen = BTreeSet::new();
        for entry in &selection {
            if entry.component == Component::Unknown {
                tracing::warn!("selection names an unknown component");
                return StateCase::error(
                    ErrorCode::CalibrationComponentMissing,
                    NextState::CheckCalibration,
                );
            }
            if entry.status == CalibrationStatus::Unknown {
                tracing::warn!(component = %entry.component, "selection has unknown status");
                return StateCase::error(
                    ErrorCode::CalibrationStatusMissing,
                    NextState::CheckCalibration,
                );
            }
            if !seen.insert(entry.component) {
                return Self::reject("duplicate component", Some(entry));
            }
            let Some(previous) = map.status(entry.component) else {
                return Self::reject("component not tracked", Some(entry));
            };
            if entry.status != previous && entry.status != CalibrationStatus::Skip {
                return Self::reject("illegal status change", Some(entry));
            }
        }

        let mut need_calibration = false;
        for entry in &selection {
            if let Err(e) = map.set_status(entry.component, entry.status) {
                // Unreachable after validation; kept as a typed failure.
                tracing::error!(error = %e, "cannot record selection");
                return StateCase::error(e.code(), NextState::CheckCalibration);
            }
            tracing::debug!(
                component = %entry.component,
                group = %group_of(entry.component),
                status = %entry.status,
                "selection accepted"
            );
            need_calibration |= should_calibrate(entry.status);
        }

        if !persist(&map, self.store.as_ref()) {
            return StateCase::error(ErrorCode::TransitionFailed, NextState::CheckCalibration);
        }

        if need_calibration {
            StateCase::ok(NextState::SetupCalibration)
        } else {
            tracing::info!("no component needs calibration");
            StateCase::ok(NextState::ProvisionDevice)
        }
    }

    fn try_resume_at_boot(&mut self) -> StateCase {
        StateCase::ok(NextState::CheckCalibration)
    }
}
