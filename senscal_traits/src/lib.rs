//! Collaborator interfaces for the calibration core.
//!
//! Everything the calibration core needs from the device goes through these
//! traits: sensor discovery, per-sensor sampling, the persistent workflow
//! store and the non-volatile store that keeps the final bias values. Errors cross the boundary as
//! `Box<dyn Error + Send + Sync>` so back-ends stay free to use their own types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Bias values keyed by their sysfs entry name, e.g. `in_accel_x_base_calibbias`.
pub type BiasMap = BTreeMap<String, i32>;

/// Physical kind of a motion sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SensorKind {
    Accelerometer,
    Gyroscope,
}

impl SensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accelerometer => "accelerometer",
            Self::Gyroscope => "gyroscope",
        }
    }

    /// Channel prefix used by the sensor subsystem (`accel`, `anglvel`).
    pub fn channel_prefix(self) -> &'static str {
        match self {
            Self::Accelerometer => "accel",
            Self::Gyroscope => "anglvel",
        }
    }
}

/// Where the sensor is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SensorLocation {
    Base,
    Lid,
}

impl SensorLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Lid => "lid",
        }
    }
}

impl fmt::Display for SensorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sensor found on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SensorId {
    pub kind: SensorKind,
    pub location: SensorLocation,
}

impl SensorId {
    pub const fn new(kind: SensorKind, location: SensorLocation) -> Self {
        Self { kind, location }
    }
}

/// Formats as `<location>_<kind>`, e.g. `lid_gyroscope`.
impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.location.as_str(), self.kind.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSensor(pub String);

impl fmt::Display for UnknownSensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown sensor `{}`", self.0)
    }
}

impl std::error::Error for UnknownSensor {}

impl FromStr for SensorId {
    type Err = UnknownSensor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (location, kind) = s.split_once('_').ok_or_else(|| UnknownSensor(s.to_owned()))?;
        let location = match location {
            "base" => SensorLocation::Base,
            "lid" => SensorLocation::Lid,
            _ => return Err(UnknownSensor(s.to_owned())),
        };
        let kind = match kind {
            "accelerometer" => SensorKind::Accelerometer,
            "gyroscope" => SensorKind::Gyroscope,
            _ => return Err(UnknownSensor(s.to_owned())),
        };
        Ok(Self::new(kind, location))
    }
}

/// Sensor discovery. Called synchronously whenever the workflow needs a fresh view.
pub trait SensorProbe: Send + Sync {
    fn probe(&self) -> Vec<SensorId>;
}

/// Sampling access to one sensor instance.
///
/// Both calls may block; they are only ever invoked from background workers.
pub trait SensorChannel: Send + Sync {
    /// Read the current hardware bias register for each entry, in order.
    fn read_bias(&self, entries: &[String]) -> Result<Vec<f64>, BoxError>;

    /// Take `count` samples of every channel and return the per-channel mean
    /// and sample variance.
    fn sample_averaged(
        &self,
        channels: &[String],
        count: usize,
    ) -> Result<(Vec<f64>, Vec<f64>), BoxError>;
}

/// Durable, device-scoped storage for calibration bias values.
pub trait CalibrationStore: Send + Sync {
    /// Stage bias values. They are not durable until `flush` succeeds.
    fn write_bias(&self, bias: &BiasMap) -> Result<(), BoxError>;
    fn flush(&self) -> Result<(), BoxError>;
}

/// String-keyed persistent store for workflow state.
///
/// Values are JSON documents; typed access lives in `senscal_core::store`.
pub trait WorkflowStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Option<String>;
    fn set_raw(&self, key: &str, value: String) -> Result<(), BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_prefixes_match_sysfs_names() {
        assert_eq!(SensorKind::Accelerometer.channel_prefix(), "accel");
        assert_eq!(SensorKind::Gyroscope.channel_prefix(), "anglvel");
        assert_eq!(SensorLocation::Lid.to_string(), "lid");
    }

    #[test]
    fn sensor_ids_parse_from_their_display_form() {
        let id = SensorId::new(SensorKind::Gyroscope, SensorLocation::Base);
        assert_eq!(id.to_string(), "base_gyroscope");
        assert_eq!("base_gyroscope".parse::<SensorId>(), Ok(id));
        assert!("lid_magnetometer".parse::<SensorId>().is_err());
        assert!("keyboard".parse::<SensorId>().is_err());
    }
}
