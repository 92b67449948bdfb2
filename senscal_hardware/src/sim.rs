//! Simulated sensor bench.
//!
//! Each simulated sensor answers with fixed averages and variances, which is
//! enough to drive the calibration math to a known pass or fail. Faults can
//! be injected per sensor.

use std::collections::BTreeMap;
use std::sync::Arc;

use senscal_traits::{BoxError, SensorChannel, SensorId, SensorProbe};

use crate::error::HwError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    BiasRead,
    Sample,
    /// Report two axes instead of three.
    AxisCount,
}

#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    pub bias: Vec<i32>,
    pub average: Vec<f64>,
    pub variance: Vec<f64>,
    pub fault: Option<SimFault>,
}

impl SimulatedSensor {
    pub fn new(average: Vec<f64>, variance: Vec<f64>, bias: Vec<i32>) -> Self {
        Self {
            bias,
            average,
            variance,
            fault: None,
        }
    }

    pub fn with_fault(mut self, fault: SimFault) -> Self {
        self.fault = Some(fault);
        self
    }
}

impl SensorChannel for SimulatedSensor {
    fn read_bias(&self, entries: &[String]) -> Result<Vec<f64>, BoxError> {
        if self.fault == Some(SimFault::BiasRead) {
            return Err(HwError::Simulated("bias read").into());
        }
        entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                self.bias
                    .get(idx)
                    .map(|b| f64::from(*b))
                    .ok_or_else(|| HwError::MissingEntry(entry.clone()).into())
            })
            .collect()
    }

    fn sample_averaged(
        &self,
        channels: &[String],
        count: usize,
    ) -> Result<(Vec<f64>, Vec<f64>), BoxError> {
        tracing::trace!(?channels, count, "simulated sampling");
        match self.fault {
            Some(SimFault::Sample) => Err(HwError::Simulated("sample").into()),
            Some(SimFault::AxisCount) => Ok((
                self.average.iter().copied().take(2).collect(),
                self.variance.iter().copied().take(2).collect(),
            )),
            _ => Ok((self.average.clone(), self.variance.clone())),
        }
    }
}

/// A set of simulated sensors; probing returns exactly these.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBench {
    sensors: BTreeMap<SensorId, Arc<SimulatedSensor>>,
}

impl SimulatedBench {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sensor(mut self, id: SensorId, sensor: SimulatedSensor) -> Self {
        self.sensors.insert(id, Arc::new(sensor));
        self
    }

    pub fn channel(&self, id: SensorId) -> Option<Arc<dyn SensorChannel>> {
        self.sensors
            .get(&id)
            .map(|s| Arc::clone(s) as Arc<dyn SensorChannel>)
    }

    /// Channels of every simulated sensor.
    pub fn channels(&self) -> Vec<(SensorId, Arc<dyn SensorChannel>)> {
        self.sensors
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s) as Arc<dyn SensorChannel>))
            .collect()
    }
}

impl SensorProbe for SimulatedBench {
    fn probe(&self) -> Vec<SensorId> {
        self.sensors.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use senscal_traits::{SensorKind, SensorLocation};

    fn entries() -> Vec<String> {
        ["x", "y", "z"]
            .iter()
            .map(|a| format!("in_accel_{a}_base_calibbias"))
            .collect()
    }

    #[test]
    fn bench_probes_what_it_holds() {
        let lid = SensorId::new(SensorKind::Gyroscope, SensorLocation::Lid);
        let bench = SimulatedBench::new().with_sensor(
            lid,
            SimulatedSensor::new(vec![0.0; 3], vec![0.0; 3], vec![0; 3]),
        );
        assert_eq!(bench.probe(), vec![lid]);
        assert!(bench.channel(lid).is_some());
        assert!(
            bench
                .channel(SensorId::new(SensorKind::Gyroscope, SensorLocation::Base))
                .is_none()
        );
    }

    #[test]
    fn faults_surface_as_hardware_errors() {
        let sensor = SimulatedSensor::new(vec![0.0; 3], vec![0.0; 3], vec![3, 2, 1])
            .with_fault(SimFault::BiasRead);
        let err = sensor.read_bias(&entries()).unwrap_err();
        assert!(err.downcast_ref::<HwError>().is_some());

        let sensor = SimulatedSensor::new(vec![0.0; 3], vec![0.0; 3], vec![0; 3])
            .with_fault(SimFault::AxisCount);
        let (avg, var) = sensor.sample_averaged(&[], 100).unwrap();
        assert_eq!((avg.len(), var.len()), (2, 2));
    }

    #[test]
    fn short_bias_list_is_an_error() {
        let sensor = SimulatedSensor::new(vec![0.0; 3], vec![0.0; 3], vec![7]);
        assert!(sensor.read_bias(&entries()).is_err());
        let sensor = SimulatedSensor::new(vec![0.0; 3], vec![0.0; 3], vec![7, 8, 9]);
        assert_eq!(sensor.read_bias(&entries()).unwrap(), vec![7.0, 8.0, 9.0]);
    }
}
