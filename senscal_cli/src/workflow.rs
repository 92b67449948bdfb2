//! Drives Check → Setup → Run until the device leaves calibration.
//!
//! The state handlers only decide transitions; this loop supplies operator
//! input (skips, placement confirmation), waits on calibration rounds and
//! records the active state so `resume` can recover after a restart.

use std::io::BufRead;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use senscal_config::Config;
use senscal_core::{
    CalibrationGroup, CalibrationMap, CalibrationStatus, CheckCalibrationState, Component,
    ErrorCode, NextState, RunCalibrationState, SetupCalibrationState, StateCase, StateHandler,
    WorkflowStoreExt, keys,
};
use senscal_hardware::FileCalibrationStore;
use senscal_traits::WorkflowStore;
use thiserror::Error;

use crate::backend::Backend;
use crate::cli::DriveOpts;
use crate::console::{Console, ConsoleSink};

/// Store key holding the workflow state that was active last.
pub const WORKFLOW_STATE: &str = "workflow_state";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("calibration of {group} did not finish within {timeout_ms} ms")]
    RoundTimeout {
        group: CalibrationGroup,
        timeout_ms: u128,
    },
    #[error("gave up after {rounds} calibration rounds")]
    RoundLimit { rounds: u32 },
    #[error("{state} refused to advance: {code}")]
    Rejected { state: NextState, code: ErrorCode },
}

/// How a drive ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub next: NextState,
    pub rounds: u32,
}

pub struct Workflow {
    store: Arc<dyn WorkflowStore>,
    check: CheckCalibrationState,
    setup: SetupCalibrationState,
    run: RunCalibrationState,
    console: Console,
    opts: DriveOpts,
    skip: Vec<Component>,
}

/// Parse `--skip` values into calibratable components.
pub fn parse_skips(raw: &[String]) -> Result<Vec<Component>> {
    raw.iter()
        .map(|s| {
            let component: Component = s
                .parse()
                .wrap_err_with(|| format!("invalid --skip value `{s}`"))?;
            if !senscal_core::is_valid_component(component) {
                eyre::bail!("invalid --skip value `{s}`: not a calibratable component");
            }
            Ok(component)
        })
        .collect()
}

/// Seed the storage-wipe flag from config unless an earlier step recorded it.
pub fn seed_wipe_flag(store: &dyn WorkflowStore, configured: Option<bool>) -> Result<()> {
    let recorded: Option<bool> = store
        .get(keys::WIPE_DEVICE)
        .wrap_err("read recorded storage-wipe flag")?;
    match (recorded, configured) {
        (None, Some(wipe)) => {
            store
                .set(keys::WIPE_DEVICE, &wipe)
                .wrap_err("record storage-wipe flag")?;
            tracing::info!(wipe, "storage-wipe flag seeded from config");
        }
        (Some(recorded), Some(wipe)) if recorded != wipe => {
            tracing::warn!(recorded, configured = wipe, "keeping previously recorded storage-wipe flag");
        }
        _ => {}
    }
    Ok(())
}

impl Workflow {
    pub fn new(
        cfg: &Config,
        backend: &Backend,
        store: Arc<dyn WorkflowStore>,
        console: Console,
        opts: DriveOpts,
        skip: Vec<Component>,
    ) -> Result<Self> {
        let run = RunCalibrationState::builder()
            .with_store(store.clone())
            .with_calibration_store(Arc::new(FileCalibrationStore::new(
                &cfg.store.calibration_path,
            )))
            .with_signals(Arc::new(ConsoleSink::new(console)))
            .with_utilities(backend.utilities())
            .with_runner((&cfg.runner).into())
            .build()
            .wrap_err("assemble run calibration state")?;
        Ok(Self {
            check: CheckCalibrationState::new(store.clone(), backend.probe.clone()),
            setup: SetupCalibrationState::new(store.clone(), backend.probe.clone()),
            run,
            store,
            console,
            opts,
            skip,
        })
    }

    /// Recover after a restart: ask the recorded state where to continue.
    pub fn resume(&mut self) -> Result<NextState> {
        let recorded: Option<NextState> = self
            .store
            .get(WORKFLOW_STATE)
            .wrap_err("read recorded workflow state")?;
        let Some(state) = recorded else {
            tracing::info!("no recorded workflow state, starting from the check step");
            return Ok(NextState::CheckCalibration);
        };
        let case = match state {
            NextState::CheckCalibration => self.check.try_resume_at_boot(),
            NextState::SetupCalibration => self.setup.try_resume_at_boot(),
            NextState::RunCalibration => self.run.try_resume_at_boot(),
            other => {
                tracing::info!(state = %other, "workflow already left calibration");
                return Ok(other);
            }
        };
        tracing::info!(state = %state, next = %case.next, code = %case.error, "resumed at boot");
        self.follow(state, case)
    }

    /// Run the loop from `start` until a state outside calibration is reached.
    pub fn drive(&mut self, start: NextState) -> Result<Summary> {
        let mut state = start;
        let mut rounds = 0u32;
        let mut steps = 0u32;
        // Check/Setup/Run per round plus slack for rejected selections.
        let step_limit = self.opts.max_rounds.saturating_mul(3).saturating_add(6);
        let mut apply_skips = !self.skip.is_empty();

        loop {
            self.store
                .set(WORKFLOW_STATE, &state)
                .wrap_err("record workflow state")?;
            steps += 1;
            let case = match state {
                NextState::CheckCalibration => self.check_step(&mut apply_skips)?,
                NextState::SetupCalibration => self.setup_step()?,
                NextState::RunCalibration => {
                    rounds += 1;
                    if rounds > self.opts.max_rounds {
                        return Err(DriveError::RoundLimit {
                            rounds: self.opts.max_rounds,
                        }
                        .into());
                    }
                    self.run_step()?
                }
                exit => {
                    let summary = Summary { next: exit, rounds };
                    self.console.finished(exit, rounds);
                    return Ok(summary);
                }
            };
            if steps > step_limit {
                return Err(DriveError::RoundLimit { rounds }.into());
            }
            state = self.follow(state, case)?;
        }
    }

    /// Apply a transition decision; an error that keeps us in place is fatal.
    fn follow(&self, state: NextState, case: StateCase) -> Result<NextState> {
        if case.error.is_ok() {
            if case.next != state {
                self.console.transition(state, case.next, case.error.as_str());
            }
            return Ok(case.next);
        }
        if case.next != state {
            tracing::warn!(from = %state, to = %case.next, code = %case.error, "transition forced by error");
            self.console.transition(state, case.next, case.error.as_str());
            return Ok(case.next);
        }
        Err(DriveError::Rejected {
            state,
            code: case.error,
        }
        .into())
    }

    fn check_step(&mut self, apply_skips: &mut bool) -> Result<StateCase> {
        self.check
            .initialize_state()
            .wrap_err("check which components need calibration")?;
        let mut selection = self.check.components().to_vec();
        if std::mem::take(apply_skips) {
            for component in &self.skip {
                match selection.iter_mut().find(|e| e.component == *component) {
                    Some(entry) => entry.status = CalibrationStatus::Skip,
                    None => tracing::warn!(%component, "cannot skip a component that is not tracked"),
                }
            }
        }
        self.console.components(&selection);
        Ok(self.check.get_next_state_case(selection))
    }

    fn setup_step(&mut self) -> Result<StateCase> {
        if let Err(e) = self.setup.initialize_state() {
            tracing::warn!(error = %e, "setup could not compute the next placement");
        }
        let group = self.setup.instruction();
        if !group.is_sentinel() {
            self.console.instruction(group);
            if !self.opts.yes {
                self.console.prompt_enter();
                let mut line = String::new();
                std::io::stdin()
                    .lock()
                    .read_line(&mut line)
                    .wrap_err("read placement confirmation")?;
            }
        }
        Ok(self.setup.get_next_state_case(group))
    }

    fn run_step(&mut self) -> Result<StateCase> {
        if let Err(e) = self.run.initialize_state() {
            tracing::warn!(error = %e, code = %e.code(), "calibration round could not start");
        }
        let timeout = self.run.round_timeout();
        let outcome = self.run.wait_for_round(timeout);
        tracing::debug!(?outcome, group = %self.run.running_group(), "round wait returned");
        let case = self.run.get_next_state_case(());
        if case.error == ErrorCode::Wait {
            return Err(DriveError::RoundTimeout {
                group: self.run.running_group(),
                timeout_ms: timeout.as_millis(),
            }
            .into());
        }
        Ok(case)
    }
}

/// Print the persisted calibration map and recorded workflow position.
pub fn print_status(store: &dyn WorkflowStore, console: &Console) -> Result<()> {
    let map = CalibrationMap::load_or_empty(store).wrap_err("load calibration map")?;
    let state: Option<NextState> = store
        .get(WORKFLOW_STATE)
        .wrap_err("read recorded workflow state")?;
    let instruction: Option<CalibrationGroup> = store
        .get(keys::CALIBRATION_INSTRUCTION)
        .wrap_err("read calibration instruction")?;
    let wipe: Option<bool> = store
        .get(keys::WIPE_DEVICE)
        .wrap_err("read storage-wipe flag")?;
    console.status(&map, state, instruction, wipe);
    Ok(())
}
