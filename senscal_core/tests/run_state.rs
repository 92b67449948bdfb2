//! Run state: launching a round, applying background events, and deciding
//! where the workflow goes next.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use senscal_core::CalibrationGroup::{PlaceBaseOnFlatSurface, PlaceLidOnFlatSurface};
use senscal_core::CalibrationStatus::{Complete, Failed, InProgress, Skip, Waiting};
use senscal_core::Component::{BaseAccelerometer, BaseGyroscope, LidAccelerometer, LidGyroscope};
use senscal_core::mocks::{MemoryCalibrationStore, RecordingSink, ScriptedChannel};
use senscal_core::{
    BuildError, CalibrationGroup, CalibrationMap, CalibrationStatus, CalibrationUtility,
    Component, ErrorCode, MemoryStore, NextState, OverallOutcome, RunCalibrationState, RunnerCfg,
    Signal, StateCase, StateHandler, WorkflowStoreExt, keys,
};
use senscal_traits::{BoxError, SensorChannel, WorkflowStore};

const ROUND: Duration = Duration::from_secs(5);

struct Bench {
    store: Arc<MemoryStore>,
    calibration: Arc<MemoryCalibrationStore>,
    sink: Arc<RecordingSink>,
}

impl Bench {
    fn new(entries: &[(Component, CalibrationStatus)], instruction: CalibrationGroup) -> Self {
        let store = Arc::new(MemoryStore::new());
        let mut map = CalibrationMap::new();
        for (component, status) in entries {
            map.set_status(*component, *status).unwrap();
        }
        map.store(store.as_ref()).unwrap();
        store.set(keys::CALIBRATION_INSTRUCTION, &instruction).unwrap();
        Self {
            store,
            calibration: Arc::new(MemoryCalibrationStore::new()),
            sink: Arc::new(RecordingSink::new()),
        }
    }

    fn run_state(&self, utilities: Vec<CalibrationUtility>) -> RunCalibrationState {
        RunCalibrationState::builder()
            .with_store(self.store.clone())
            .with_calibration_store(self.calibration.clone())
            .with_signals(self.sink.clone())
            .with_utilities(utilities)
            .with_runner(RunnerCfg {
                workers: 2,
                round_timeout_ms: 5_000,
            })
            .build()
            .expect("build run state")
    }

    fn status(&self, component: Component) -> Option<CalibrationStatus> {
        CalibrationMap::load(self.store.as_ref())
            .unwrap()
            .status(component)
    }
}

fn utility(component: Component, channel: impl SensorChannel + 'static) -> CalibrationUtility {
    CalibrationUtility::for_component(component, Arc::new(channel)).expect("motion sensor")
}

/// A channel that reads perfectly for its sensor type.
fn calm(component: Component) -> CalibrationUtility {
    match component {
        BaseAccelerometer | LidAccelerometer => {
            utility(component, ScriptedChannel::flat_accelerometer())
        }
        _ => utility(component, ScriptedChannel::still_gyroscope()),
    }
}

/// Fails the first `failures` sampling attempts, then reads like a still gyroscope.
struct FlakyGyro {
    failures: usize,
    calls: AtomicUsize,
}

impl SensorChannel for FlakyGyro {
    fn read_bias(&self, _entries: &[String]) -> Result<Vec<f64>, BoxError> {
        Ok(vec![0.0; 3])
    }

    fn sample_averaged(
        &self,
        _channels: &[String],
        _count: usize,
    ) -> Result<(Vec<f64>, Vec<f64>), BoxError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err("i2c nack".into());
        }
        Ok((vec![0.0; 3], vec![0.0; 3]))
    }
}

#[test]
fn successful_round_with_groups_left_is_round_complete() {
    let bench = Bench::new(
        &[
            (BaseAccelerometer, Waiting),
            (BaseGyroscope, Waiting),
            (LidAccelerometer, Waiting),
        ],
        PlaceBaseOnFlatSurface,
    );
    let mut run = bench.run_state(vec![
        calm(BaseAccelerometer),
        calm(BaseGyroscope),
        calm(LidAccelerometer),
    ]);
    run.initialize_state().unwrap();
    assert_eq!(run.setup_group(), PlaceBaseOnFlatSurface);
    assert_eq!(run.running_group(), PlaceBaseOnFlatSurface);

    assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::RoundComplete));
    assert_eq!(bench.status(BaseAccelerometer), Some(Complete));
    assert_eq!(bench.status(BaseGyroscope), Some(Complete));
    // Only the active group runs.
    assert_eq!(bench.status(LidAccelerometer), Some(Waiting));

    let flushed = bench.calibration.flushed();
    assert_eq!(flushed.len(), 6);
    assert_eq!(flushed["in_accel_z_base_calibbias"], 0);
    assert!(flushed.contains_key("in_anglvel_x_base_calibbias"));
    assert_eq!(bench.calibration.flush_count(), 1);

    assert_eq!(bench.sink.overall(), vec![OverallOutcome::RoundComplete]);
    assert_eq!(
        run.get_next_state_case(()),
        StateCase::ok(NextState::SetupCalibration)
    );
    assert_eq!(run.running_group(), PlaceLidOnFlatSurface);
}

#[test]
fn component_signals_follow_progress_and_overall_comes_last() {
    let bench = Bench::new(&[(LidGyroscope, Waiting)], PlaceLidOnFlatSurface);
    let mut run = bench.run_state(vec![calm(LidGyroscope)]);
    run.initialize_state().unwrap();
    assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::Complete));

    let components = bench.sink.component_signals();
    let progress: Vec<f64> = components.iter().map(|s| s.progress).collect();
    assert_eq!(progress, [0.0, 0.2, 0.7, 0.8, 1.0]);
    assert!(components.iter().all(|s| s.component == LidGyroscope));
    assert_eq!(components.last().unwrap().status, Complete);
    assert!(components[..4].iter().all(|s| s.status == InProgress));

    let signals = bench.sink.signals();
    assert_eq!(
        signals.last(),
        Some(&Signal::Overall {
            outcome: OverallOutcome::Complete
        })
    );
}

#[test]
fn last_group_done_exits_by_wipe_flag() {
    for (wipe, next) in [
        (true, NextState::Finalize),
        (false, NextState::WpEnablePhysical),
    ] {
        let bench = Bench::new(
            &[(LidAccelerometer, Waiting), (BaseGyroscope, Skip)],
            PlaceLidOnFlatSurface,
        );
        bench.store.set(keys::WIPE_DEVICE, &wipe).unwrap();
        let mut run = bench.run_state(vec![calm(LidAccelerometer)]);
        run.initialize_state().unwrap();

        assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::Complete));
        assert_eq!(run.get_next_state_case(()), StateCase::ok(next));
    }
}

#[test]
fn missing_wipe_flag_blocks_the_exit() {
    let bench = Bench::new(&[(BaseGyroscope, Complete)], CalibrationGroup::NoNeedCalibration);
    let mut run = bench.run_state(vec![]);
    run.initialize_state().unwrap();
    assert_eq!(run.outcome(), Some(OverallOutcome::Complete));
    assert_eq!(
        run.get_next_state_case(()),
        StateCase::error(ErrorCode::TransitionFailed, NextState::RunCalibration)
    );

    bench.store.set_raw(keys::WIPE_DEVICE, "\"maybe\"".into()).unwrap();
    assert_eq!(
        run.get_next_state_case(()),
        StateCase::error(ErrorCode::TransitionFailed, NextState::RunCalibration)
    );
}

#[test]
fn rejected_sample_fails_the_round_but_keeps_good_bias() {
    let bench = Bench::new(
        &[(BaseAccelerometer, Waiting), (BaseGyroscope, Waiting)],
        PlaceBaseOnFlatSurface,
    );
    let noisy = ScriptedChannel::new([0.0; 3], [0.0, 0.0, 9.8], [6.0, 6.0, 6.0]);
    let mut run = bench.run_state(vec![
        utility(BaseAccelerometer, noisy),
        calm(BaseGyroscope),
    ]);
    run.initialize_state().unwrap();

    assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::RoundFailed));
    assert_eq!(bench.status(BaseAccelerometer), Some(Failed));
    assert_eq!(bench.status(BaseGyroscope), Some(Complete));

    let flushed = bench.calibration.flushed();
    assert_eq!(flushed.len(), 3);
    assert!(flushed.keys().all(|k| k.starts_with("in_anglvel_")));

    // The group still has work, so the operator is sent back to Setup.
    assert_eq!(
        run.get_next_state_case(()),
        StateCase::ok(NextState::SetupCalibration)
    );
}

#[test]
fn unstored_bias_fails_the_round() {
    let bench = Bench::new(&[(BaseGyroscope, Waiting)], PlaceBaseOnFlatSurface);
    bench.calibration.fail_write.store(true, Ordering::SeqCst);
    let mut run = bench.run_state(vec![calm(BaseGyroscope)]);
    run.initialize_state().unwrap();

    assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::RoundFailed));
    assert_eq!(bench.status(BaseGyroscope), Some(Complete));
    assert!(bench.calibration.flushed().is_empty());
}

#[test]
fn failed_flush_fails_the_round() {
    let bench = Bench::new(&[(BaseAccelerometer, Waiting)], PlaceBaseOnFlatSurface);
    bench.calibration.fail_flush.store(true, Ordering::SeqCst);
    let mut run = bench.run_state(vec![calm(BaseAccelerometer)]);
    run.initialize_state().unwrap();

    assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::RoundFailed));
    assert_eq!(bench.calibration.flush_count(), 1);
    assert!(bench.calibration.flushed().is_empty());
}

#[test]
fn round_in_flight_asks_the_driver_to_wait() {
    let bench = Bench::new(&[(LidGyroscope, Waiting)], PlaceLidOnFlatSurface);
    let slow = ScriptedChannel::still_gyroscope().with_delay(Duration::from_millis(300));
    let mut run = bench.run_state(vec![utility(LidGyroscope, slow)]);
    run.initialize_state().unwrap();

    assert_eq!(run.outcome(), None);
    assert_eq!(
        run.get_next_state_case(()),
        StateCase::error(ErrorCode::Wait, NextState::RunCalibration)
    );
    assert_eq!(bench.status(LidGyroscope), Some(InProgress));

    assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::Complete));
}

#[test]
fn component_without_utility_fails_alone() {
    let bench = Bench::new(
        &[(BaseAccelerometer, Waiting), (BaseGyroscope, Waiting)],
        PlaceBaseOnFlatSurface,
    );
    let mut run = bench.run_state(vec![calm(BaseGyroscope)]);
    run.initialize_state().unwrap();

    assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::RoundFailed));
    assert_eq!(bench.status(BaseAccelerometer), Some(Failed));
    assert_eq!(bench.status(BaseGyroscope), Some(Complete));

    // The routine that did run still gets its bias flushed.
    let flushed = bench.calibration.flushed();
    assert_eq!(flushed.len(), 3);
    assert!(flushed.keys().all(|k| k.starts_with("in_anglvel_")));
    assert_eq!(bench.calibration.flush_count(), 1);

    assert_eq!(bench.sink.overall(), vec![OverallOutcome::RoundFailed]);
    assert!(bench.sink.component_signals().iter().any(|s| {
        s.component == BaseAccelerometer && s.status == Failed && s.progress == -1.0
    }));
    assert_eq!(
        run.get_next_state_case(()),
        StateCase::ok(NextState::SetupCalibration)
    );
}

#[test]
fn different_step_on_screen_launches_nothing() {
    let bench = Bench::new(&[(BaseAccelerometer, Waiting)], PlaceLidOnFlatSurface);
    let mut run = bench.run_state(vec![calm(BaseAccelerometer)]);
    run.initialize_state().unwrap();

    assert_eq!(
        run.wait_for_round(ROUND),
        Some(OverallOutcome::InitializationFailed)
    );
    assert_eq!(bench.status(BaseAccelerometer), Some(Waiting));
    assert!(bench.sink.component_signals().is_empty());
    assert_eq!(
        bench.sink.overall(),
        vec![OverallOutcome::InitializationFailed]
    );
    assert_eq!(bench.calibration.flush_count(), 0);
    assert_eq!(
        run.get_next_state_case(()),
        StateCase::ok(NextState::SetupCalibration)
    );
}

#[test]
fn reused_handler_reports_only_the_current_round() {
    let bench = Bench::new(
        &[(BaseGyroscope, Waiting), (LidGyroscope, Waiting)],
        PlaceBaseOnFlatSurface,
    );
    let slow = ScriptedChannel::still_gyroscope().with_delay(Duration::from_millis(300));
    let mut run = bench.run_state(vec![calm(BaseGyroscope), utility(LidGyroscope, slow)]);

    run.initialize_state().unwrap();
    assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::RoundComplete));

    // Same instruction, but the map has moved on to the lid.
    run.initialize_state().unwrap();
    assert_eq!(run.running_group(), PlaceLidOnFlatSurface);
    assert_eq!(run.outcome(), Some(OverallOutcome::InitializationFailed));

    bench
        .store
        .set(keys::CALIBRATION_INSTRUCTION, &PlaceLidOnFlatSurface)
        .unwrap();
    run.initialize_state().unwrap();
    assert_eq!(run.outcome(), None);
    assert_eq!(
        run.get_next_state_case(()),
        StateCase::error(ErrorCode::Wait, NextState::RunCalibration)
    );

    assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::Complete));
    assert_eq!(
        bench.sink.overall(),
        vec![
            OverallOutcome::RoundComplete,
            OverallOutcome::InitializationFailed,
            OverallOutcome::Complete,
        ]
    );
}

#[test]
fn bias_write_failure_does_not_leak_into_the_next_round() {
    let bench = Bench::new(
        &[(BaseAccelerometer, Waiting), (BaseGyroscope, Waiting)],
        PlaceBaseOnFlatSurface,
    );
    let slow = ScriptedChannel::flat_accelerometer().with_delay(Duration::from_millis(1_000));
    let mut run = bench.run_state(vec![utility(BaseAccelerometer, slow), calm(BaseGyroscope)]);
    bench.calibration.fail_write.store(true, Ordering::SeqCst);

    // The gyroscope's write fails, then the round is abandoned before it settles.
    run.initialize_state().unwrap();
    assert_eq!(run.wait_for_round(Duration::from_millis(300)), None);
    assert_eq!(bench.status(BaseGyroscope), Some(Complete));
    assert_eq!(bench.status(BaseAccelerometer), Some(InProgress));
    bench.calibration.fail_write.store(false, Ordering::SeqCst);

    // A fresh round over the same group picks up the accelerometer and writes cleanly.
    run.initialize_state().unwrap();
    assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::RoundComplete));
    assert_eq!(bench.status(BaseAccelerometer), Some(Complete));
    assert_eq!(bench.sink.overall(), vec![OverallOutcome::RoundComplete]);
}

/// Panics mid-sampling, like a driver bug in a vendor back-end.
struct PanickingChannel;

impl SensorChannel for PanickingChannel {
    fn read_bias(&self, _entries: &[String]) -> Result<Vec<f64>, BoxError> {
        Ok(vec![0.0; 3])
    }

    fn sample_averaged(
        &self,
        _channels: &[String],
        _count: usize,
    ) -> Result<(Vec<f64>, Vec<f64>), BoxError> {
        panic!("sampling blew up")
    }
}

#[test]
fn panicking_routine_fails_its_component() {
    let bench = Bench::new(
        &[(BaseAccelerometer, Waiting), (BaseGyroscope, Waiting)],
        PlaceBaseOnFlatSurface,
    );
    let mut run = bench.run_state(vec![
        utility(BaseAccelerometer, PanickingChannel),
        calm(BaseGyroscope),
    ]);
    run.initialize_state().unwrap();

    assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::RoundFailed));
    assert_eq!(bench.status(BaseAccelerometer), Some(Failed));
    assert_eq!(bench.status(BaseGyroscope), Some(Complete));
    assert_eq!(bench.calibration.flush_count(), 1);
}

#[test]
fn unreadable_map_fails_initialization() {
    let bench = Bench::new(&[], PlaceBaseOnFlatSurface);
    bench
        .store
        .set_raw(keys::CALIBRATION_MAP, "\"garbage\"".into())
        .unwrap();
    let mut run = bench.run_state(vec![]);

    assert!(run.initialize_state().is_err());
    assert_eq!(run.outcome(), Some(OverallOutcome::InitializationFailed));
    assert_eq!(
        bench.sink.overall(),
        vec![OverallOutcome::InitializationFailed]
    );
    assert_eq!(
        run.get_next_state_case(()),
        StateCase::error(
            ErrorCode::CalibrationStatusMissing,
            NextState::CheckCalibration
        )
    );
}

#[test]
fn failed_component_succeeds_on_retry() {
    let bench = Bench::new(&[(BaseGyroscope, Waiting)], PlaceBaseOnFlatSurface);
    let gyro = FlakyGyro {
        failures: 1,
        calls: AtomicUsize::new(0),
    };
    let mut run = bench.run_state(vec![utility(BaseGyroscope, gyro)]);

    run.initialize_state().unwrap();
    assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::RoundFailed));
    assert_eq!(
        run.get_next_state_case(()),
        StateCase::ok(NextState::SetupCalibration)
    );

    // What Setup does when the operator confirms the same step again.
    let mut map = CalibrationMap::load(bench.store.as_ref()).unwrap();
    map.rearm_failed(PlaceBaseOnFlatSurface);
    map.store(bench.store.as_ref()).unwrap();

    run.initialize_state().unwrap();
    assert_eq!(run.wait_for_round(ROUND), Some(OverallOutcome::Complete));
    assert_eq!(bench.status(BaseGyroscope), Some(Complete));
    assert_eq!(
        bench.sink.overall(),
        vec![OverallOutcome::RoundFailed, OverallOutcome::Complete]
    );
}

#[test]
fn restart_mid_run_fails_interrupted_components() {
    let bench = Bench::new(
        &[(BaseAccelerometer, InProgress), (BaseGyroscope, Complete)],
        PlaceBaseOnFlatSurface,
    );
    let mut run = bench.run_state(vec![]);
    assert_eq!(run.state(), NextState::RunCalibration);
    assert_eq!(
        run.try_resume_at_boot(),
        StateCase::ok(NextState::CheckCalibration)
    );
    assert_eq!(bench.status(BaseAccelerometer), Some(Failed));
    assert_eq!(bench.status(BaseGyroscope), Some(Complete));
}

#[test]
fn restart_without_map_still_goes_to_check() {
    let store = Arc::new(MemoryStore::new());
    let mut run = RunCalibrationState::builder()
        .with_store(store.clone())
        .with_calibration_store(Arc::new(MemoryCalibrationStore::new()))
        .with_signals(Arc::new(RecordingSink::new()))
        .build()
        .unwrap();
    assert_eq!(
        run.try_resume_at_boot(),
        StateCase::ok(NextState::CheckCalibration)
    );
    assert_eq!(store.get_raw(keys::CALIBRATION_MAP), None);
}

#[test]
fn builder_reports_what_is_missing() {
    let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());

    let err = RunCalibrationState::builder().build().unwrap_err();
    assert!(matches!(err, BuildError::MissingStore));

    let err = RunCalibrationState::builder()
        .with_store(store.clone())
        .build()
        .unwrap_err();
    assert!(matches!(err, BuildError::MissingCalibrationStore));

    let err = RunCalibrationState::builder()
        .with_store(store.clone())
        .with_calibration_store(Arc::new(MemoryCalibrationStore::new()))
        .build()
        .unwrap_err();
    assert!(matches!(err, BuildError::MissingSignalSink));
}

#[test]
fn builder_rejects_degenerate_runner_settings() {
    for cfg in [
        RunnerCfg {
            workers: 0,
            round_timeout_ms: 1_000,
        },
        RunnerCfg {
            workers: 1,
            round_timeout_ms: 0,
        },
    ] {
        let err = RunCalibrationState::builder()
            .with_store(Arc::new(MemoryStore::new()))
            .with_calibration_store(Arc::new(MemoryCalibrationStore::new()))
            .with_signals(Arc::new(RecordingSink::new()))
            .with_runner(cfg)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidConfig(_)), "{cfg:?}");
    }

    let run = RunCalibrationState::builder()
        .with_store(Arc::new(MemoryStore::new()))
        .with_calibration_store(Arc::new(MemoryCalibrationStore::new()))
        .with_signals(Arc::new(RecordingSink::new()))
        .build()
        .unwrap();
    assert_eq!(run.round_timeout(), Duration::from_secs(30));
}
