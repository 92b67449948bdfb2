#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema for the calibration tool.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - Algorithm constants (sample counts, thresholds) are deliberately absent:
//!   they are fixed by the calibration procedure, not by deployment.
use std::collections::BTreeSet;
use std::path::PathBuf;

use senscal_traits::SensorId;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreCfg {
    /// Persistent workflow store (JSON object on disk).
    pub workflow_path: PathBuf,
    /// Non-volatile calibration bias store.
    pub calibration_path: PathBuf,
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            workflow_path: PathBuf::from("/var/lib/senscal/workflow.json"),
            calibration_path: PathBuf::from("/var/lib/senscal/calibration.json"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunnerCfg {
    /// Background worker threads running calibration routines.
    pub workers: usize,
    /// How long the driver waits for a calibration round before giving up.
    pub round_timeout_ms: u64,
}

impl Default for RunnerCfg {
    fn default() -> Self {
        Self {
            workers: 2,
            round_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Simulated,
    Sysfs,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BackendCfg {
    pub kind: BackendKind,
    /// Root of the IIO device tree, e.g. `/sys/bus/iio/devices`. Sysfs only.
    pub iio_root: Option<PathBuf>,
}

/// Injected failure for a simulated sensor.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SimFault {
    /// Reading the calibbias registers fails.
    BiasRead,
    /// Sampling fails.
    Sample,
    /// Sampling returns two axes instead of three.
    AxisCount,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SimulatedSensorCfg {
    /// Component tag, e.g. `base_accelerometer`.
    pub component: String,
    /// Per-axis mean reading in m/s² (accelerometer) or rad/s (gyroscope).
    pub average: Vec<f64>,
    #[serde(default = "default_variance")]
    pub variance: Vec<f64>,
    /// Current hardware calibbias registers.
    #[serde(default = "default_bias")]
    pub bias: Vec<i32>,
    #[serde(default)]
    pub fault: Option<SimFault>,
}

fn default_variance() -> Vec<f64> {
    vec![0.01; 3]
}

fn default_bias() -> Vec<i32> {
    vec![0; 3]
}

impl SimulatedSensorCfg {
    pub fn sensor_id(&self) -> Option<SensorId> {
        self.component.parse().ok()
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SimulatedCfg {
    pub sensors: Vec<SimulatedSensorCfg>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WorkflowCfg {
    /// Seeds the "storage wipe requested" flag when the store has none.
    pub wipe_device: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreCfg,
    #[serde(default)]
    pub runner: RunnerCfg,
    #[serde(default)]
    pub backend: BackendCfg,
    #[serde(default)]
    pub simulated: SimulatedCfg,
    #[serde(default)]
    pub workflow: WorkflowCfg,
    #[serde(default)]
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Store
        if self.store.workflow_path.as_os_str().is_empty() {
            eyre::bail!("store.workflow_path must not be empty");
        }
        if self.store.calibration_path.as_os_str().is_empty() {
            eyre::bail!("store.calibration_path must not be empty");
        }

        // Runner
        if !(1..=16).contains(&self.runner.workers) {
            eyre::bail!("runner.workers must be in 1..=16");
        }
        if self.runner.round_timeout_ms == 0 {
            eyre::bail!("runner.round_timeout_ms must be >= 1");
        }

        // Backend
        if self.backend.kind == BackendKind::Sysfs
            && self
                .backend
                .iio_root
                .as_ref()
                .is_none_or(|p| p.as_os_str().is_empty())
        {
            eyre::bail!("backend.iio_root is required for the sysfs backend");
        }

        // Simulated sensors
        let mut seen = BTreeSet::new();
        for sensor in &self.simulated.sensors {
            let Some(id) = sensor.sensor_id() else {
                eyre::bail!(
                    "simulated.sensors: `{}` is not a calibratable component",
                    sensor.component
                );
            };
            if !seen.insert(id) {
                eyre::bail!("simulated.sensors: duplicate component `{id}`");
            }
            if sensor.average.len() != 3 {
                eyre::bail!("simulated.sensors[{id}].average must have 3 entries");
            }
            if sensor.variance.len() != 3 {
                eyre::bail!("simulated.sensors[{id}].variance must have 3 entries");
            }
            if sensor.bias.len() != 3 {
                eyre::bail!("simulated.sensors[{id}].bias must have 3 entries");
            }
            if sensor.average.iter().any(|v| !v.is_finite()) {
                eyre::bail!("simulated.sensors[{id}].average must be finite");
            }
            if sensor.variance.iter().any(|v| !v.is_finite() || *v < 0.0) {
                eyre::bail!("simulated.sensors[{id}].variance must be finite and >= 0");
            }
        }

        // Logging
        if let Some(rotation) = self.logging.rotation.as_deref()
            && !matches!(rotation, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = load_toml("").unwrap();
        assert_eq!(cfg.runner.workers, 2);
        assert_eq!(cfg.runner.round_timeout_ms, 30_000);
        assert_eq!(cfg.backend.kind, BackendKind::Simulated);
        assert!(cfg.simulated.sensors.is_empty());
        assert_eq!(cfg.workflow.wipe_device, None);
        cfg.validate().unwrap();
    }

    #[test]
    fn sensor_defaults_fill_variance_and_bias() {
        let cfg = load_toml(
            r#"
[[simulated.sensors]]
component = "lid_gyroscope"
average = [0.0, 0.0, 0.0]
"#,
        )
        .unwrap();
        let sensor = &cfg.simulated.sensors[0];
        assert_eq!(sensor.variance, vec![0.01; 3]);
        assert_eq!(sensor.bias, vec![0; 3]);
        assert_eq!(sensor.fault, None);
        assert!(sensor.sensor_id().is_some());
    }
}
