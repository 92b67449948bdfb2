#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Sensor calibration workflow (hardware-agnostic).
//!
//! All device access goes through the `senscal_traits` interfaces, so the
//! same workflow runs against sysfs, a simulated bench, or test mocks.
//!
//! ## Architecture
//!
//! - **Model**: components, groups, statuses and the persisted `CalibrationMap` (`model`)
//! - **Algorithm**: per-sensor bias computation with progress reporting (`algorithm`)
//! - **States**: Check → Setup → Run handlers driven by an outer controller (`state`)
//! - **Runner**: worker threads executing calibration routines (`runner`)
//! - **Signals**: fire-and-forget operator notifications (`signal`)
//! - **Store**: typed access to the workflow store (`store`)
//!
//! ## Ownership
//!
//! The calibration map is only read-modify-written by the thread that owns the
//! state handler. Background workers report through `RunEvent` messages.

pub mod algorithm;
pub mod config;
pub mod conversions;
pub mod error;
pub mod hw_error;
pub mod mocks;
pub mod model;
pub mod runner;
pub mod signal;
pub mod state;
pub mod store;

pub use algorithm::{
    AccelerometerCalibration, CalibrationUtility, GyroscopeCalibration, SensorCalibration,
};
pub use config::RunnerCfg;
pub use error::{BuildError, CalibError, ErrorCode, StoreError};
pub use model::{
    CalibrationGroup, CalibrationMap, CalibrationStatus, Component, current_group_in, group_of,
    is_valid_component, should_calibrate, should_calibrate_component,
};
pub use signal::{ChannelSignalSink, ComponentStatusSignal, OverallOutcome, Signal, SignalSink};
pub use state::{
    CheckCalibrationState, ComponentEntry, NextState, RunCalibrationState,
    RunCalibrationStateBuilder, RunEvent, SetupCalibrationState, StateCase, StateHandler,
};
pub use store::{MemoryStore, WorkflowStoreExt, keys};
