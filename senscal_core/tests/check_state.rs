use std::sync::Arc;

use rstest::rstest;
use senscal_core::mocks::{FixedProbe, FlakyStore};
use senscal_core::{
    CalibrationMap, CalibrationStatus, CheckCalibrationState, Component, ComponentEntry,
    ErrorCode, MemoryStore, NextState, StateCase, StateHandler, WorkflowStoreExt, keys,
};
use senscal_traits::WorkflowStore;

use senscal_core::CalibrationStatus::{Complete, Skip, Waiting};
use senscal_core::Component::{BaseAccelerometer, BaseGyroscope, LidAccelerometer, LidGyroscope};

fn probe(components: &[Component]) -> Arc<FixedProbe> {
    Arc::new(FixedProbe(
        components
            .iter()
            .map(|c| c.sensor().expect("motion sensor"))
            .collect(),
    ))
}

fn entry(component: Component, status: CalibrationStatus) -> ComponentEntry {
    ComponentEntry { component, status }
}

fn initialized(store: Arc<dyn WorkflowStore>, components: &[Component]) -> CheckCalibrationState {
    let mut check = CheckCalibrationState::new(store, probe(components));
    check.initialize_state().expect("init");
    check
}

fn stored(store: &dyn WorkflowStore) -> CalibrationMap {
    CalibrationMap::load(store).expect("map persisted")
}

#[test]
fn first_check_tracks_every_probed_sensor_as_waiting() {
    let store = Arc::new(MemoryStore::new());
    let check = initialized(
        store.clone(),
        &[LidAccelerometer, BaseGyroscope, BaseAccelerometer],
    );

    // Base group first, then lid.
    assert_eq!(
        check.components(),
        [
            entry(BaseAccelerometer, Waiting),
            entry(BaseGyroscope, Waiting),
            entry(LidAccelerometer, Waiting),
        ]
    );
    let map = stored(store.as_ref());
    assert_eq!(map.len(), 3);
    assert!(!map.contains(LidGyroscope));
}

#[test]
fn recheck_keeps_earlier_results_and_adds_new_sensors() {
    let store = Arc::new(MemoryStore::new());
    let mut map = CalibrationMap::new();
    map.set_status(BaseAccelerometer, Complete).unwrap();
    map.set_status(BaseGyroscope, Skip).unwrap();
    map.store(store.as_ref()).unwrap();

    let check = initialized(
        store.clone(),
        &[BaseAccelerometer, BaseGyroscope, LidGyroscope],
    );
    assert_eq!(
        check.components(),
        [
            entry(BaseAccelerometer, Complete),
            entry(BaseGyroscope, Skip),
            entry(LidGyroscope, Waiting),
        ]
    );
}

#[test]
fn sensors_no_longer_probed_stay_tracked() {
    let store = Arc::new(MemoryStore::new());
    initialized(store.clone(), &[BaseAccelerometer, LidAccelerometer]);
    let check = initialized(store.clone(), &[BaseAccelerometer]);
    assert_eq!(check.components().len(), 2);
}

#[test]
fn corrupt_map_fails_initialization() {
    let store = Arc::new(MemoryStore::new());
    store
        .set_raw(keys::CALIBRATION_MAP, r#"{"place_base_on_flat_surface":{"camera":"waiting"}}"#.into())
        .unwrap();
    let mut check = CheckCalibrationState::new(store, probe(&[BaseAccelerometer]));
    assert!(check.initialize_state().is_err());
}

#[test]
fn unchanged_selection_with_pending_work_goes_to_setup() {
    let store = Arc::new(MemoryStore::new());
    let mut check = initialized(store.clone(), &[BaseAccelerometer, LidAccelerometer]);
    let selection = check.components().to_vec();
    assert_eq!(
        check.get_next_state_case(selection),
        StateCase::ok(NextState::SetupCalibration)
    );
}

#[test]
fn skipping_everything_leaves_calibration() {
    let store = Arc::new(MemoryStore::new());
    let mut check = initialized(store.clone(), &[BaseAccelerometer, LidAccelerometer]);
    let case = check.get_next_state_case(vec![
        entry(BaseAccelerometer, Skip),
        entry(LidAccelerometer, Skip),
    ]);
    assert_eq!(case, StateCase::ok(NextState::ProvisionDevice));

    let map = stored(store.as_ref());
    assert_eq!(map.status(BaseAccelerometer), Some(Skip));
    assert_eq!(map.status(LidAccelerometer), Some(Skip));
}

#[test]
fn complete_components_may_be_kept_or_skipped() {
    let store = Arc::new(MemoryStore::new());
    let mut map = CalibrationMap::new();
    map.set_status(BaseAccelerometer, Complete).unwrap();
    map.set_status(LidGyroscope, Complete).unwrap();
    map.store(store.as_ref()).unwrap();

    let mut check = initialized(store.clone(), &[]);
    let case = check.get_next_state_case(vec![
        entry(BaseAccelerometer, Complete),
        entry(LidGyroscope, Skip),
    ]);
    assert_eq!(case, StateCase::ok(NextState::ProvisionDevice));
}

#[test]
fn partial_skip_still_requires_setup() {
    let store = Arc::new(MemoryStore::new());
    let mut check = initialized(store.clone(), &[BaseAccelerometer, BaseGyroscope]);
    let case = check.get_next_state_case(vec![
        entry(BaseAccelerometer, Skip),
        entry(BaseGyroscope, Waiting),
    ]);
    assert_eq!(case, StateCase::ok(NextState::SetupCalibration));
    assert_eq!(stored(store.as_ref()).status(BaseAccelerometer), Some(Skip));
}

#[rstest]
#[case::too_short(vec![entry(BaseAccelerometer, Waiting)], ErrorCode::RequestInvalid)]
#[case::unknown_component(
    vec![entry(BaseAccelerometer, Waiting), entry(Component::Unknown, Waiting)],
    ErrorCode::CalibrationComponentMissing
)]
#[case::unknown_status(
    vec![entry(BaseAccelerometer, Waiting), entry(LidAccelerometer, CalibrationStatus::Unknown)],
    ErrorCode::CalibrationStatusMissing
)]
#[case::waiting_to_complete(
    vec![entry(BaseAccelerometer, Complete), entry(LidAccelerometer, Waiting)],
    ErrorCode::RequestInvalid
)]
#[case::waiting_to_in_progress(
    vec![entry(BaseAccelerometer, Skip), entry(LidAccelerometer, CalibrationStatus::InProgress)],
    ErrorCode::RequestInvalid
)]
#[case::duplicate(
    vec![entry(BaseAccelerometer, Skip), entry(BaseAccelerometer, Skip)],
    ErrorCode::RequestInvalid
)]
#[case::untracked(
    vec![entry(BaseAccelerometer, Skip), entry(LidGyroscope, Skip)],
    ErrorCode::RequestInvalid
)]
fn rejected_selection_leaves_map_untouched(
    #[case] selection: Vec<ComponentEntry>,
    #[case] expected: ErrorCode,
) {
    let store = Arc::new(MemoryStore::new());
    let mut check = initialized(store.clone(), &[BaseAccelerometer, LidAccelerometer]);
    let before = stored(store.as_ref());

    let case = check.get_next_state_case(selection);
    assert_eq!(case, StateCase::error(expected, NextState::CheckCalibration));
    assert_eq!(stored(store.as_ref()), before);
}

#[test]
fn selection_against_corrupted_map_is_a_transition_failure() {
    let store = Arc::new(MemoryStore::new());
    let mut check = initialized(store.clone(), &[BaseAccelerometer]);
    store.set_raw(keys::CALIBRATION_MAP, "[1, 2, 3]".into()).unwrap();

    let case = check.get_next_state_case(vec![entry(BaseAccelerometer, Skip)]);
    assert_eq!(
        case,
        StateCase::error(ErrorCode::TransitionFailed, NextState::CheckCalibration)
    );
}

#[test]
fn unsaved_selection_is_a_transition_failure() {
    let store = Arc::new(FlakyStore::new());
    let mut check = initialized(store.clone(), &[BaseGyroscope]);
    store.set_failing(true);

    let case = check.get_next_state_case(vec![entry(BaseGyroscope, Skip)]);
    assert_eq!(
        case,
        StateCase::error(ErrorCode::TransitionFailed, NextState::CheckCalibration)
    );
    assert_eq!(
        stored(&store.inner).status(BaseGyroscope),
        Some(Waiting)
    );
}

#[test]
fn restart_during_check_starts_over() {
    let store = Arc::new(MemoryStore::new());
    let mut check = CheckCalibrationState::new(store.clone(), probe(&[]));
    assert_eq!(
        check.try_resume_at_boot(),
        StateCase::ok(NextState::CheckCalibration)
    );
    assert_eq!(check.state(), NextState::CheckCalibration);
    assert_eq!(store.get::<bool>(keys::WIPE_DEVICE).unwrap(), None);
}
