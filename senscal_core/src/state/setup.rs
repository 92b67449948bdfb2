use std::sync::Arc;

use senscal_traits::{SensorProbe, WorkflowStore};

use super::{NextState, StateCase, StateHandler, persist, probed_components};
use crate::error::{CalibError, ErrorCode, Result};
use crate::model::{CalibrationGroup, CalibrationMap};
use crate::store::{WorkflowStoreExt, keys};

/// Picks the next calibration group and asks the operator to prepare it.
pub struct SetupCalibrationState {
    store: Arc<dyn WorkflowStore>,
    probe: Arc<dyn SensorProbe>,
    instruction: CalibrationGroup,
}

impl SetupCalibrationState {
    pub fn new(store: Arc<dyn WorkflowStore>, probe: Arc<dyn SensorProbe>) -> Self {
        Self {
            store,
            probe,
            instruction: CalibrationGroup::Unknown,
        }
    }

    /// Group presented to the operator by the last `initialize_state`.
    pub fn instruction(&self) -> CalibrationGroup {
        self.instruction
    }

    fn record_instruction(&mut self, group: CalibrationGroup) {
        self.instruction = group;
        if let Err(e) = self.store.set(keys::CALIBRATION_INSTRUCTION, &group) {
            tracing::error!(error = %e, %group, "failed to record calibration instruction");
        }
    }

    /// Instruction as persisted; falls back to `Unknown` when absent or unreadable.
    fn recorded_instruction(&self) -> CalibrationGroup {
        match self.store.get::<CalibrationGroup>(keys::CALIBRATION_INSTRUCTION) {
            Ok(Some(group)) => group,
            Ok(None) => CalibrationGroup::Unknown,
            Err(e) => {
                tracing::warn!(error = %e, "calibration instruction unreadable");
                CalibrationGroup::Unknown
            }
        }
    }
}

impl StateHandler for SetupCalibrationState {
    type Input = CalibrationGroup;

    fn state(&self) -> NextState {
        NextState::SetupCalibration
    }

    fn initialize_state(&mut self) -> Result<()> {
        let probed = probed_components(self.probe.as_ref());
        let mut map = match CalibrationMap::load_or_empty(self.store.as_ref()) {
            Ok(map) => map,
            Err(e) => {
                tracing::error!(error = %e, "calibration map unusable; check required");
                self.record_instruction(CalibrationGroup::NeedToCheck);
                return Err(CalibError::Initialization(e.to_string()));
            }
        };

        let added = map.insert_probed(probed);
        if !added.is_empty() {
            tracing::info!(?added, "new sensors tracked for calibration");
        }
        let interrupted = map.fail_interrupted();
        if !interrupted.is_empty() {
            tracing::info!(?interrupted, "previous calibration was interrupted");
        }
        if !persist(&map, self.store.as_ref()) {
            tracing::warn!("continuing with unsaved calibration map");
        }

        let group = map.current_group();
        tracing::info!(%group, instruction = group.instruction(), "calibration step selected");
        self.record_instruction(group);
        Ok(())
    }

    fn get_next_state_case(&mut self, confirmed: CalibrationGroup) -> StateCase {
        let recorded = self.recorded_instruction();
        if confirmed != recorded {
            tracing::warn!(%confirmed, %recorded, "operator confirmed a stale instruction");
            return StateCase::error(ErrorCode::RequestInvalid, NextState::SetupCalibration);
        }

        match recorded {
            CalibrationGroup::Unknown => StateCase::error(
                ErrorCode::CalibrationStatusMissing,
                NextState::CheckCalibration,
            ),
            CalibrationGroup::NoNeedCalibration => StateCase::ok(NextState::ProvisionDevice),
            CalibrationGroup::NeedToCheck => StateCase::ok(NextState::CheckCalibration),
            group => {
                let mut map = match CalibrationMap::load(self.store.as_ref()) {
                    Ok(map) => map,
                    Err(e) => {
                        tracing::error!(error = %e, %group, "cannot read calibration map");
                        return StateCase::error(
                            ErrorCode::TransitionFailed,
                            NextState::SetupCalibration,
                        );
                    }
                };
                let rearmed = map.rearm_failed(group);
                if !rearmed.is_empty() {
                    tracing::info!(?rearmed, %group, "retrying failed components");
                    if !persist(&map, self.store.as_ref()) {
                        return StateCase::error(
                            ErrorCode::TransitionFailed,
                            NextState::SetupCalibration,
                        );
                    }
                }
                StateCase::ok(NextState::RunCalibration)
            }
        }
    }

    fn try_resume_at_boot(&mut self) -> StateCase {
        match self.recorded_instruction() {
            CalibrationGroup::NeedToCheck => StateCase::ok(NextState::CheckCalibration),
            group => {
                tracing::error!(%group, "cannot resume calibration setup after restart");
                StateCase::error(ErrorCode::TransitionFailed, NextState::SetupCalibration)
            }
        }
    }
}
