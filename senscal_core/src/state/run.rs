//! Run state: calibrates every pending component of the active group.
//!
//! Calibration routines run on the `TaskRunner`. Their progress and results
//! come back as `RunEvent`s and are applied by whoever owns the
//! `RunCalibrationState`, one event at a time, so map read-modify-writes never
//! interleave.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel as xch;
use senscal_traits::{BiasMap, CalibrationStore, WorkflowStore};

use super::{NextState, StateCase, StateHandler, persist};
use crate::algorithm::{CalibrationUtility, PROGRESS_FAILED, SensorCalibration};
use crate::config::RunnerCfg;
use crate::error::{BuildError, CalibError, ErrorCode, Result};
use crate::model::{CalibrationGroup, CalibrationMap, CalibrationStatus, Component, current_group_in};
use crate::runner::TaskRunner;
use crate::signal::{ComponentStatusSignal, OverallOutcome, SignalSink};
use crate::store::{WorkflowStoreExt, keys};

/// Message from a background task to the owning sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Progress { component: Component, progress: f64 },
    Result { component: Component, bias: BiasMap },
    /// The end-of-round flush of the calibration store finished.
    Flushed { ok: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    /// Nothing launched yet.
    Idle,
    Calibrating,
    /// Every component settled; waiting for the calibration store flush.
    Flushing,
    Finished(OverallOutcome),
}

pub struct RunCalibrationState {
    store: Arc<dyn WorkflowStore>,
    calibration_store: Arc<dyn CalibrationStore>,
    signals: Arc<dyn SignalSink>,
    utilities: BTreeMap<Component, Arc<CalibrationUtility>>,
    runner: TaskRunner,
    round_timeout: Duration,
    tx: xch::Sender<RunEvent>,
    rx: xch::Receiver<RunEvent>,
    setup_group: CalibrationGroup,
    running_group: CalibrationGroup,
    round: Round,
    bias_write_failed: bool,
}

impl std::fmt::Debug for RunCalibrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCalibrationState")
            .field("setup_group", &self.setup_group)
            .field("running_group", &self.running_group)
            .field("round", &self.round)
            .field("utilities", &self.utilities.keys().collect::<Vec<_>>())
            .field("workers", &self.runner.worker_count())
            .finish()
    }
}

impl RunCalibrationState {
    pub fn builder() -> RunCalibrationStateBuilder {
        RunCalibrationStateBuilder::default()
    }

    /// Group Setup presented to the operator, as read by `initialize_state`.
    pub fn setup_group(&self) -> CalibrationGroup {
        self.setup_group
    }

    pub fn running_group(&self) -> CalibrationGroup {
        self.running_group
    }

    /// Overall outcome of the current round, once known.
    pub fn outcome(&self) -> Option<OverallOutcome> {
        match self.round {
            Round::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }

    /// Default bound for `wait_for_round`.
    pub fn round_timeout(&self) -> Duration {
        self.round_timeout
    }

    /// Apply every event already queued. Never blocks.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Apply events until the round's overall outcome is known or `timeout`
    /// elapses. Returns `None` on timeout, or when no round was started.
    pub fn wait_for_round(&mut self, timeout: Duration) -> Option<OverallOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.round {
                Round::Finished(outcome) => return Some(outcome),
                Round::Idle => return None,
                Round::Calibrating | Round::Flushing => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(event) => self.handle_event(event),
                Err(xch::RecvTimeoutError::Timeout) => {
                    tracing::warn!(group = %self.running_group, ?timeout, "calibration round timed out");
                    return None;
                }
                // Unreachable while `self.tx` is alive.
                Err(xch::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Apply one background event on the owning sequence.
    pub fn handle_event(&mut self, event: RunEvent) {
        match event {
            RunEvent::Progress {
                component,
                progress,
            } => self.on_progress(component, progress),
            RunEvent::Result { component, bias } => self.on_result(component, bias),
            RunEvent::Flushed { ok } => self.on_flushed(ok),
        }
    }

    fn finish_round(&mut self, outcome: OverallOutcome) {
        self.round = Round::Finished(outcome);
        self.signals.emit_overall_status(outcome);
    }

    fn launch(&mut self, map: &mut CalibrationMap) {
        let waiting: Vec<Component> = map
            .group(self.running_group)
            .filter(|(_, status)| *status == CalibrationStatus::Waiting)
            .map(|(component, _)| component)
            .collect();

        self.round = Round::Calibrating;
        for component in waiting {
            let Some(utility) = self.utilities.get(&component).cloned() else {
                // Skipped for this round only; Failed lets the round settle and Setup re-arm it.
                tracing::error!(%component, "no calibration utility for component");
                self.fail_component(map, component);
                continue;
            };

            // Marked before the hand-off so a crash in between cannot strand it as Waiting.
            if let Err(e) = map.set_status(component, CalibrationStatus::InProgress) {
                tracing::error!(%component, error = %e, "cannot mark component in progress");
                continue;
            }
            persist(map, self.store.as_ref());

            let tx = self.tx.clone();
            let posted = self.runner.post(Box::new(move || {
                let progress_tx = tx.clone();
                let panic_tx = tx.clone();
                let mut progress = move |progress: f64| {
                    if progress_tx
                        .send(RunEvent::Progress {
                            component,
                            progress,
                        })
                        .is_err()
                    {
                        tracing::trace!(%component, "run state gone; dropping progress");
                    }
                };
                let ran = catch_unwind(AssertUnwindSafe(|| {
                    utility.calibrate(
                        &mut progress,
                        Box::new(move |bias| {
                            if tx.send(RunEvent::Result { component, bias }).is_err() {
                                tracing::trace!(%component, "run state gone; dropping result");
                            }
                        }),
                    );
                }));
                if ran.is_err() {
                    tracing::error!(%component, "calibration routine panicked");
                    let _ = panic_tx.send(RunEvent::Progress {
                        component,
                        progress: PROGRESS_FAILED,
                    });
                }
            }));
            if posted {
                tracing::debug!(%component, group = %self.running_group, "calibration launched");
            } else {
                tracing::error!(%component, "task runner rejected calibration task");
                self.fail_component(map, component);
            }
        }
        self.check_round_settled(map);
    }

    /// Record a component that could not be calibrated this round.
    fn fail_component(&mut self, map: &mut CalibrationMap, component: Component) {
        self.signals.emit_component_status(ComponentStatusSignal {
            component,
            status: CalibrationStatus::Failed,
            progress: PROGRESS_FAILED,
        });
        match map.set_status(component, CalibrationStatus::Failed) {
            Ok(_) => {
                persist(map, self.store.as_ref());
            }
            Err(e) => tracing::error!(%component, error = %e, "cannot mark component failed"),
        }
    }

    fn on_progress(&mut self, component: Component, progress: f64) {
        let status = CalibrationStatus::from_progress(progress);
        self.signals.emit_component_status(ComponentStatusSignal {
            component,
            status,
            progress,
        });

        let mut map = match CalibrationMap::load(self.store.as_ref()) {
            Ok(map) => map,
            Err(e) => {
                tracing::error!(%component, error = %e, "cannot read calibration map");
                return;
            }
        };
        if map.status(component) == Some(status) {
            return;
        }
        if let Err(e) = map.set_status(component, status) {
            tracing::error!(%component, error = %e, "cannot record calibration status");
            return;
        }
        tracing::debug!(%component, %status, progress, "calibration status changed");
        persist(&map, self.store.as_ref());
        self.check_round_settled(&map);
    }

    fn on_result(&mut self, component: Component, bias: BiasMap) {
        if let Err(e) = self.calibration_store.write_bias(&bias) {
            tracing::warn!(%component, error = %e, "failed to stage calibration bias");
            self.bias_write_failed = true;
        } else {
            tracing::debug!(%component, entries = bias.len(), "calibration bias staged");
        }
    }

    /// Starts the flush once no component of the group is Waiting or InProgress.
    fn check_round_settled(&mut self, map: &CalibrationMap) {
        if self.round != Round::Calibrating {
            return;
        }
        let busy = map.group(self.running_group).any(|(_, status)| {
            matches!(
                status,
                CalibrationStatus::Waiting | CalibrationStatus::InProgress
            )
        });
        if busy {
            return;
        }

        self.round = Round::Flushing;
        let store = Arc::clone(&self.calibration_store);
        let tx = self.tx.clone();
        let posted = self.runner.post(Box::new(move || {
            let ok = match store.flush() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to flush calibration store");
                    false
                }
            };
            if tx.send(RunEvent::Flushed { ok }).is_err() {
                tracing::trace!("run state gone; dropping flush result");
            }
        }));
        if !posted {
            tracing::error!("task runner rejected flush task");
            self.on_flushed(false);
        }
    }

    fn on_flushed(&mut self, ok: bool) {
        if self.round != Round::Flushing {
            tracing::warn!(round = ?self.round, "unexpected flush result");
            return;
        }
        let map = match CalibrationMap::load(self.store.as_ref()) {
            Ok(map) => map,
            Err(e) => {
                tracing::error!(error = %e, "cannot read calibration map");
                self.finish_round(OverallOutcome::RoundFailed);
                return;
            }
        };
        let any_failed = map
            .group(self.running_group)
            .any(|(_, status)| status == CalibrationStatus::Failed);
        let failed = any_failed || !ok || self.bias_write_failed;
        self.bias_write_failed = false;

        let outcome = if failed {
            OverallOutcome::RoundFailed
        } else if map.current_group() == CalibrationGroup::NoNeedCalibration {
            OverallOutcome::Complete
        } else {
            OverallOutcome::RoundComplete
        };
        tracing::info!(group = %self.running_group, ?outcome, "calibration round finished");
        self.finish_round(outcome);
    }
}

impl StateHandler for RunCalibrationState {
    type Input = ();

    fn state(&self) -> NextState {
        NextState::RunCalibration
    }

    fn initialize_state(&mut self) -> Result<()> {
        self.round = Round::Idle;
        self.bias_write_failed = false;
        self.setup_group = match self.store.get::<CalibrationGroup>(keys::CALIBRATION_INSTRUCTION) {
            Ok(Some(group)) => group,
            Ok(None) => CalibrationGroup::Unknown,
            Err(e) => {
                tracing::warn!(error = %e, "calibration instruction unreadable");
                CalibrationGroup::Unknown
            }
        };

        let mut map = match CalibrationMap::load(self.store.as_ref()) {
            Ok(map) => map,
            Err(e) => {
                tracing::error!(error = %e, "calibration map unusable; check required");
                self.running_group = CalibrationGroup::NeedToCheck;
                self.finish_round(OverallOutcome::InitializationFailed);
                return Err(CalibError::Initialization(e.to_string()));
            }
        };
        self.running_group = map.current_group();
        tracing::info!(
            setup_group = %self.setup_group,
            running_group = %self.running_group,
            "run state initialized"
        );

        match self.running_group {
            CalibrationGroup::NoNeedCalibration => self.finish_round(OverallOutcome::Complete),
            group if group == self.setup_group => self.launch(&mut map),
            group => {
                tracing::warn!(%group, setup_group = %self.setup_group, "operator was shown a different step");
                self.finish_round(OverallOutcome::InitializationFailed);
            }
        }
        Ok(())
    }

    fn get_next_state_case(&mut self, _: ()) -> StateCase {
        self.process_pending();
        self.running_group = current_group_in(self.store.as_ref());

        match self.running_group {
            CalibrationGroup::NeedToCheck | CalibrationGroup::Unknown => StateCase::error(
                ErrorCode::CalibrationStatusMissing,
                NextState::CheckCalibration,
            ),
            CalibrationGroup::NoNeedCalibration => {
                match self.store.get::<bool>(keys::WIPE_DEVICE) {
                    Ok(Some(true)) => StateCase::ok(NextState::Finalize),
                    Ok(Some(false)) => StateCase::ok(NextState::WpEnablePhysical),
                    Ok(None) => {
                        tracing::error!("storage wipe flag missing");
                        StateCase::error(ErrorCode::TransitionFailed, NextState::RunCalibration)
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "storage wipe flag unreadable");
                        StateCase::error(ErrorCode::TransitionFailed, NextState::RunCalibration)
                    }
                }
            }
            group if group == self.setup_group => match self.round {
                // A finished round that left the group pending failed; retry via Setup.
                Round::Finished(_) => StateCase::ok(NextState::SetupCalibration),
                _ => StateCase::error(ErrorCode::Wait, NextState::RunCalibration),
            },
            _ => StateCase::ok(NextState::SetupCalibration),
        }
    }

    fn try_resume_at_boot(&mut self) -> StateCase {
        match CalibrationMap::load(self.store.as_ref()) {
            Ok(mut map) => {
                let interrupted = map.fail_interrupted();
                if !interrupted.is_empty() {
                    tracing::info!(?interrupted, "calibration interrupted by restart");
                    persist(&map, self.store.as_ref());
                }
            }
            Err(e) => tracing::warn!(error = %e, "no calibration map to reconcile"),
        }
        StateCase::ok(NextState::CheckCalibration)
    }
}

/// Builder for `RunCalibrationState`. Stores and sink are required.
#[derive(Default)]
pub struct RunCalibrationStateBuilder {
    store: Option<Arc<dyn WorkflowStore>>,
    calibration_store: Option<Arc<dyn CalibrationStore>>,
    signals: Option<Arc<dyn SignalSink>>,
    utilities: BTreeMap<Component, Arc<CalibrationUtility>>,
    runner: Option<RunnerCfg>,
}

impl RunCalibrationStateBuilder {
    pub fn with_store(mut self, store: Arc<dyn WorkflowStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_calibration_store(mut self, store: Arc<dyn CalibrationStore>) -> Self {
        self.calibration_store = Some(store);
        self
    }

    pub fn with_signals(mut self, signals: Arc<dyn SignalSink>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Register the routine for `utility.component()`; a later one replaces it.
    pub fn with_utility(mut self, utility: CalibrationUtility) -> Self {
        self.utilities
            .insert(utility.component(), Arc::new(utility));
        self
    }

    pub fn with_utilities(self, utilities: impl IntoIterator<Item = CalibrationUtility>) -> Self {
        utilities.into_iter().fold(self, Self::with_utility)
    }

    pub fn with_runner(mut self, cfg: RunnerCfg) -> Self {
        self.runner = Some(cfg);
        self
    }

    pub fn build(self) -> std::result::Result<RunCalibrationState, BuildError> {
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let calibration_store = self
            .calibration_store
            .ok_or(BuildError::MissingCalibrationStore)?;
        let signals = self.signals.ok_or(BuildError::MissingSignalSink)?;
        let cfg = self.runner.unwrap_or_default();
        if cfg.workers == 0 {
            return Err(BuildError::InvalidConfig("runner workers must be >= 1"));
        }
        if cfg.round_timeout_ms == 0 {
            return Err(BuildError::InvalidConfig("round_timeout_ms must be >= 1"));
        }

        let runner = TaskRunner::spawn(cfg.workers)?;
        let (tx, rx) = xch::unbounded();
        Ok(RunCalibrationState {
            store,
            calibration_store,
            signals,
            utilities: self.utilities,
            runner,
            round_timeout: Duration::from_millis(cfg.round_timeout_ms),
            tx,
            rx,
            setup_group: CalibrationGroup::Unknown,
            running_group: CalibrationGroup::Unknown,
            round: Round::Idle,
            bias_write_failed: false,
        })
    }
}
