//! Sensor back-end assembly: probe, channels and calibration routines from config.

use std::path::Path;
use std::sync::Arc;

use eyre::{Result, WrapErr, eyre};
use senscal_config::{BackendKind, Config, SimFault as CfgFault};
use senscal_core::{CalibrationUtility, Component};
use senscal_hardware::{SimFault, SimulatedBench, SimulatedSensor, SysfsProbe, SysfsSensor};
use senscal_traits::{SensorChannel, SensorId, SensorProbe};

/// One sensor the back-end can calibrate.
#[derive(Clone)]
pub struct SensorHandle {
    pub id: SensorId,
    /// Where readings come from: `simulated` or the device directory.
    pub source: String,
    pub channel: Arc<dyn SensorChannel>,
}

pub struct Backend {
    pub probe: Arc<dyn SensorProbe>,
    pub sensors: Vec<SensorHandle>,
}

fn fault(f: CfgFault) -> SimFault {
    match f {
        CfgFault::BiasRead => SimFault::BiasRead,
        CfgFault::Sample => SimFault::Sample,
        CfgFault::AxisCount => SimFault::AxisCount,
    }
}

impl Backend {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        match cfg.backend.kind {
            BackendKind::Simulated => Self::simulated(cfg),
            BackendKind::Sysfs => {
                let root = cfg
                    .backend
                    .iio_root
                    .as_deref()
                    .ok_or_else(|| eyre!("backend.iio_root is required for the sysfs backend"))?;
                Self::sysfs(root)
            }
        }
    }

    fn simulated(cfg: &Config) -> Result<Self> {
        let mut bench = SimulatedBench::new();
        for sensor in &cfg.simulated.sensors {
            let id = sensor
                .sensor_id()
                .ok_or_else(|| eyre!("`{}` is not a calibratable component", sensor.component))?;
            let mut sim = SimulatedSensor::new(
                sensor.average.clone(),
                sensor.variance.clone(),
                sensor.bias.clone(),
            );
            if let Some(f) = sensor.fault {
                sim = sim.with_fault(fault(f));
            }
            bench = bench.with_sensor(id, sim);
        }
        let sensors = bench
            .channels()
            .into_iter()
            .map(|(id, channel)| SensorHandle {
                id,
                source: "simulated".into(),
                channel,
            })
            .collect();
        tracing::debug!(sensors = cfg.simulated.sensors.len(), "simulated bench ready");
        Ok(Self {
            probe: Arc::new(bench),
            sensors,
        })
    }

    fn sysfs(root: &Path) -> Result<Self> {
        let probe = SysfsProbe::new(root);
        let devices = probe
            .devices()
            .wrap_err_with(|| format!("list IIO devices under {}", root.display()))?;
        let sensors = devices
            .into_iter()
            .map(|device| SensorHandle {
                id: device.id,
                source: device.path.display().to_string(),
                channel: Arc::new(SysfsSensor::new(device.path)),
            })
            .collect::<Vec<_>>();
        tracing::debug!(root = %root.display(), sensors = sensors.len(), "sysfs backend ready");
        Ok(Self {
            probe: Arc::new(probe),
            sensors,
        })
    }

    /// One calibration routine per known sensor.
    pub fn utilities(&self) -> Vec<CalibrationUtility> {
        self.sensors
            .iter()
            .filter_map(|s| {
                CalibrationUtility::for_component(Component::from_sensor(s.id), s.channel.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml: &str) -> Config {
        let cfg = senscal_config::load_toml(toml).unwrap();
        cfg.validate().unwrap();
        cfg
    }

    #[test]
    fn simulated_sensors_become_utilities() {
        let cfg = config(
            r#"
[[simulated.sensors]]
component = "lid_gyroscope"
average = [0.0, 0.0, 0.0]

[[simulated.sensors]]
component = "base_accelerometer"
average = [0.0, 0.0, 9.80665]
fault = "axis_count"
"#,
        );
        let backend = Backend::from_config(&cfg).unwrap();
        assert_eq!(backend.probe.probe().len(), 2);

        let components: Vec<Component> = backend
            .utilities()
            .iter()
            .map(CalibrationUtility::component)
            .collect();
        assert_eq!(
            components,
            [Component::BaseAccelerometer, Component::LidGyroscope]
        );
        assert!(backend.sensors.iter().all(|s| s.source == "simulated"));
    }

    #[test]
    fn missing_iio_root_is_reported() {
        let cfg = senscal_config::load_toml("[backend]\nkind = \"sysfs\"\n").unwrap();
        let err = Backend::from_config(&cfg).err().unwrap();
        assert!(err.to_string().contains("iio_root"));
    }

    #[test]
    fn unreadable_iio_root_is_an_error() {
        let cfg = senscal_config::load_toml(
            "[backend]\nkind = \"sysfs\"\niio_root = \"/definitely/not/here\"\n",
        )
        .unwrap();
        let err = Backend::from_config(&cfg).err().unwrap();
        assert!(format!("{err:#}").contains("/definitely/not/here"));
    }
}
