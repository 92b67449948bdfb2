//! Test and helper mocks for senscal_core.
//!
//! Everything here is deterministic and in-memory, so workflow tests can run
//! the real state handlers without a device.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel as xch;
use senscal_traits::{
    BiasMap, BoxError, CalibrationStore, SensorChannel, SensorId, SensorProbe, WorkflowStore,
};

use crate::signal::{ChannelSignalSink, ComponentStatusSignal, OverallOutcome, Signal, SignalSink};
use crate::store::MemoryStore;

/// Probe that always reports the same sensors.
#[derive(Debug, Clone, Default)]
pub struct FixedProbe(pub Vec<SensorId>);

impl SensorProbe for FixedProbe {
    fn probe(&self) -> Vec<SensorId> {
        self.0.clone()
    }
}

/// Sensor channel returning canned data.
#[derive(Debug)]
pub struct ScriptedChannel {
    pub bias: Result<Vec<f64>, String>,
    pub samples: Result<(Vec<f64>, Vec<f64>), String>,
    /// Sleep before answering `sample_averaged`, to keep a round in flight.
    pub delay: Duration,
    samples_requested: AtomicUsize,
}

impl ScriptedChannel {
    pub fn new(bias: [f64; 3], average: [f64; 3], variance: [f64; 3]) -> Self {
        Self {
            bias: Ok(bias.to_vec()),
            samples: Ok((average.to_vec(), variance.to_vec())),
            delay: Duration::ZERO,
            samples_requested: AtomicUsize::new(0),
        }
    }

    /// Accelerometer lying perfectly flat with calm readings.
    pub fn flat_accelerometer() -> Self {
        Self::new(
            [0.0; 3],
            [0.0, 0.0, crate::algorithm::GRAVITY],
            [0.01; 3],
        )
    }

    /// Gyroscope at rest with calm readings.
    pub fn still_gyroscope() -> Self {
        Self::new([0.0; 3], [0.0; 3], [0.01; 3])
    }

    pub fn failing_bias_read(mut self, msg: &str) -> Self {
        self.bias = Err(msg.to_owned());
        self
    }

    pub fn failing_samples(mut self, msg: &str) -> Self {
        self.samples = Err(msg.to_owned());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sample counts requested so far, summed over calls.
    pub fn samples_requested(&self) -> usize {
        self.samples_requested.load(Ordering::SeqCst)
    }
}

impl SensorChannel for ScriptedChannel {
    fn read_bias(&self, _entries: &[String]) -> Result<Vec<f64>, BoxError> {
        self.bias.clone().map_err(|e| std::io::Error::other(e).into())
    }

    fn sample_averaged(
        &self,
        _channels: &[String],
        count: usize,
    ) -> Result<(Vec<f64>, Vec<f64>), BoxError> {
        self.samples_requested.fetch_add(count, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.samples
            .clone()
            .map_err(|e| std::io::Error::other(e).into())
    }
}

/// Signal sink that keeps every signal for later inspection.
#[derive(Debug)]
pub struct RecordingSink {
    inner: ChannelSignalSink,
    rx: xch::Receiver<Signal>,
    seen: Mutex<Vec<Signal>>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        let (inner, rx) = ChannelSignalSink::new();
        Self {
            inner,
            rx,
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All signals emitted so far, in order.
    pub fn signals(&self) -> Vec<Signal> {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.extend(self.rx.try_iter());
        seen.clone()
    }

    pub fn overall(&self) -> Vec<OverallOutcome> {
        self.signals()
            .into_iter()
            .filter_map(|s| match s {
                Signal::Overall { outcome } => Some(outcome),
                Signal::Component(_) => None,
            })
            .collect()
    }

    pub fn component_signals(&self) -> Vec<ComponentStatusSignal> {
        self.signals()
            .into_iter()
            .filter_map(|s| match s {
                Signal::Component(c) => Some(c),
                Signal::Overall { .. } => None,
            })
            .collect()
    }
}

impl SignalSink for RecordingSink {
    fn emit_component_status(&self, signal: ComponentStatusSignal) {
        self.inner.emit_component_status(signal);
    }

    fn emit_overall_status(&self, outcome: OverallOutcome) {
        self.inner.emit_overall_status(outcome);
    }
}

/// In-memory calibration store with failure injection.
#[derive(Debug, Default)]
pub struct MemoryCalibrationStore {
    staged: Mutex<BiasMap>,
    flushed: Mutex<BiasMap>,
    pub fail_write: AtomicBool,
    pub fail_flush: AtomicBool,
    flushes: AtomicUsize,
}

impl MemoryCalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Values committed by successful flushes.
    pub fn flushed(&self) -> BiasMap {
        self.flushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl CalibrationStore for MemoryCalibrationStore {
    fn write_bias(&self, bias: &BiasMap) -> Result<(), BoxError> {
        if self.fail_write.load(Ordering::SeqCst) {
            return Err("calibration store is read-only".into());
        }
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(bias.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(())
    }

    fn flush(&self) -> Result<(), BoxError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if self.fail_flush.load(Ordering::SeqCst) {
            return Err("calibration store flush failed".into());
        }
        let staged =
            std::mem::take(&mut *self.staged.lock().unwrap_or_else(PoisonError::into_inner));
        self.flushed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(staged);
        Ok(())
    }
}

/// Workflow store whose writes can be switched off.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_writes: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }
}

impl WorkflowStore for FlakyStore {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.inner.get_raw(key)
    }

    fn set_raw(&self, key: &str, value: String) -> Result<(), BoxError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(format!("write of `{key}` refused").into());
        }
        self.inner.set_raw(key, value)
    }
}
