//! Per-sensor bias calibration.
//!
//! Accelerometers and gyroscopes run the same procedure with different
//! constants:
//!
//! 1. read the current hardware bias registers,
//! 2. average `N` samples per axis (with per-axis variance),
//! 3. `offset = ideal - avg + old_bias * unit`,
//! 4. `new_bias = round(offset / unit)`.
//!
//! Progress goes out as `0.0, 0.2, 0.7, 0.8, 1.0` on success. Any rejection ends
//! the stream with `-1.0` and the result callback is never called.
//!
//! The accelerometer additionally rejects noisy data (variance gate) and
//! implausible offsets. The gyroscope applies neither gate.

use std::sync::Arc;

use senscal_traits::{BiasMap, SensorChannel, SensorId, SensorKind, SensorLocation};

use crate::hw_error::map_hw_error;
use crate::model::Component;

/// Standard gravity, m/s².
pub const GRAVITY: f64 = 9.80665;

pub const ACCEL_SAMPLES: usize = 100;
/// Device units are 1/1024 g per LSB.
pub const ACCEL_BIAS_TO_READING: f64 = GRAVITY / 1024.0;
/// Largest acceptable per-axis offset, m/s².
pub const ACCEL_OFFSET_THRESHOLD: f64 = 2.0;
/// Largest acceptable per-axis sample variance, (m/s²)².
pub const ACCEL_VARIANCE_THRESHOLD: f64 = 5.0;
/// Resting flat: gravity on Z.
pub const ACCEL_IDEAL: [f64; 3] = [0.0, 0.0, GRAVITY];

pub const GYRO_SAMPLES: usize = 100;
/// Device units are 1/1024 degrees/s per LSB.
pub const GYRO_BIAS_TO_READING: f64 = (std::f64::consts::PI / 180.0) / 1024.0;
/// Stationary.
pub const GYRO_IDEAL: [f64; 3] = [0.0, 0.0, 0.0];

pub const PROGRESS_INIT: f64 = 0.0;
pub const PROGRESS_BIAS_READ: f64 = 0.2;
pub const PROGRESS_SAMPLED: f64 = 0.7;
pub const PROGRESS_BIAS_COMPUTED: f64 = 0.8;
pub const PROGRESS_COMPLETE: f64 = 1.0;
pub const PROGRESS_FAILED: f64 = -1.0;

const AXES: [&str; 3] = ["x", "y", "z"];

/// Callback receiving the bias values of a successful run.
pub type ResultCallback = Box<dyn FnOnce(BiasMap) + Send>;

/// One sensor's calibration routine.
pub trait SensorCalibration: Send + Sync {
    /// Run to completion. `progress` always ends with `1.0` or `-1.0`;
    /// `result` is called at most once, before the final `1.0`.
    fn calibrate(&self, progress: &mut dyn FnMut(f64), result: ResultCallback);
}

/// Constants that distinguish the sensor types.
#[derive(Debug, Clone, Copy)]
struct Profile {
    samples: usize,
    bias_to_reading: f64,
    ideal: [f64; 3],
    offset_threshold: Option<f64>,
    variance_threshold: Option<f64>,
}

const ACCELEROMETER: Profile = Profile {
    samples: ACCEL_SAMPLES,
    bias_to_reading: ACCEL_BIAS_TO_READING,
    ideal: ACCEL_IDEAL,
    offset_threshold: Some(ACCEL_OFFSET_THRESHOLD),
    variance_threshold: Some(ACCEL_VARIANCE_THRESHOLD),
};

const GYROSCOPE: Profile = Profile {
    samples: GYRO_SAMPLES,
    bias_to_reading: GYRO_BIAS_TO_READING,
    ideal: GYRO_IDEAL,
    offset_threshold: None,
    variance_threshold: None,
};

/// Sampling channel names, e.g. `accel_x`.
pub fn channel_names(kind: SensorKind) -> Vec<String> {
    AXES.iter()
        .map(|axis| format!("{}_{axis}", kind.channel_prefix()))
        .collect()
}

/// Calibbias entry names, e.g. `in_accel_x_base_calibbias`.
pub fn calibbias_entries(kind: SensorKind, location: SensorLocation) -> Vec<String> {
    channel_names(kind)
        .iter()
        .map(|channel| format!("in_{channel}_{location}_calibbias"))
        .collect()
}

fn run_calibration(
    profile: &Profile,
    kind: SensorKind,
    location: SensorLocation,
    channel: &dyn SensorChannel,
    progress: &mut dyn FnMut(f64),
    result: ResultCallback,
) {
    let component = Component::from_sensor(SensorId::new(kind, location));
    progress(PROGRESS_INIT);

    let entries = calibbias_entries(kind, location);
    let old_bias = match channel.read_bias(&entries) {
        Ok(bias) if bias.len() == AXES.len() => bias,
        Ok(bias) => {
            tracing::warn!(%component, got = bias.len(), "unexpected bias entry count");
            progress(PROGRESS_FAILED);
            return;
        }
        Err(e) => {
            tracing::warn!(%component, error = %map_hw_error(e.as_ref()), "failed to read calibration bias");
            progress(PROGRESS_FAILED);
            return;
        }
    };
    progress(PROGRESS_BIAS_READ);

    let (avg, variance) = match channel.sample_averaged(&channel_names(kind), profile.samples) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(%component, error = %map_hw_error(e.as_ref()), "failed to sample sensor");
            progress(PROGRESS_FAILED);
            return;
        }
    };
    if avg.len() != AXES.len() {
        tracing::warn!(%component, got = avg.len(), "unexpected average axis count");
        progress(PROGRESS_FAILED);
        return;
    }
    if profile.variance_threshold.is_some() && variance.len() != AXES.len() {
        tracing::warn!(%component, got = variance.len(), "unexpected variance axis count");
        progress(PROGRESS_FAILED);
        return;
    }
    progress(PROGRESS_SAMPLED);

    if let Some(threshold) = profile.variance_threshold
        && let Some(v) = variance.iter().find(|v| **v > threshold)
    {
        tracing::info!(%component, variance = v, threshold, "sensor not held still");
        progress(PROGRESS_FAILED);
        return;
    }

    let mut bias = BiasMap::new();
    for (axis, entry) in entries.into_iter().enumerate() {
        let offset =
            profile.ideal[axis] - avg[axis] + old_bias[axis] * profile.bias_to_reading;
        if let Some(threshold) = profile.offset_threshold
            && offset.abs() > threshold
        {
            tracing::info!(%component, axis = AXES[axis], offset, threshold, "offset out of range");
            progress(PROGRESS_FAILED);
            return;
        }
        bias.insert(entry, (offset / profile.bias_to_reading).round() as i32);
    }
    progress(PROGRESS_BIAS_COMPUTED);

    tracing::debug!(%component, ?bias, "calibration bias computed");
    result(bias);
    progress(PROGRESS_COMPLETE);
}

pub struct AccelerometerCalibration {
    location: SensorLocation,
    channel: Arc<dyn SensorChannel>,
}

impl AccelerometerCalibration {
    pub fn new(location: SensorLocation, channel: Arc<dyn SensorChannel>) -> Self {
        Self { location, channel }
    }
}

impl SensorCalibration for AccelerometerCalibration {
    fn calibrate(&self, progress: &mut dyn FnMut(f64), result: ResultCallback) {
        run_calibration(
            &ACCELEROMETER,
            SensorKind::Accelerometer,
            self.location,
            self.channel.as_ref(),
            progress,
            result,
        );
    }
}

pub struct GyroscopeCalibration {
    location: SensorLocation,
    channel: Arc<dyn SensorChannel>,
}

impl GyroscopeCalibration {
    pub fn new(location: SensorLocation, channel: Arc<dyn SensorChannel>) -> Self {
        Self { location, channel }
    }
}

impl SensorCalibration for GyroscopeCalibration {
    fn calibrate(&self, progress: &mut dyn FnMut(f64), result: ResultCallback) {
        run_calibration(
            &GYROSCOPE,
            SensorKind::Gyroscope,
            self.location,
            self.channel.as_ref(),
            progress,
            result,
        );
    }
}

/// Calibration routine selected by component.
pub enum CalibrationUtility {
    Accelerometer(AccelerometerCalibration),
    Gyroscope(GyroscopeCalibration),
}

impl CalibrationUtility {
    /// `None` for components that are not motion sensors.
    pub fn for_component(component: Component, channel: Arc<dyn SensorChannel>) -> Option<Self> {
        let id = component.sensor()?;
        Some(match id.kind {
            SensorKind::Accelerometer => {
                Self::Accelerometer(AccelerometerCalibration::new(id.location, channel))
            }
            SensorKind::Gyroscope => Self::Gyroscope(GyroscopeCalibration::new(id.location, channel)),
        })
    }

    pub fn component(&self) -> Component {
        let (kind, location) = match self {
            Self::Accelerometer(a) => (SensorKind::Accelerometer, a.location),
            Self::Gyroscope(g) => (SensorKind::Gyroscope, g.location),
        };
        Component::from_sensor(SensorId::new(kind, location))
    }
}

impl SensorCalibration for CalibrationUtility {
    fn calibrate(&self, progress: &mut dyn FnMut(f64), result: ResultCallback) {
        match self {
            Self::Accelerometer(a) => a.calibrate(progress, result),
            Self::Gyroscope(g) => g.calibrate(progress, result),
        }
    }
}
