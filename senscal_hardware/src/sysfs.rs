//! IIO sysfs back-end.
//!
//! Devices live under `<root>/iio:deviceN/`. A device is a motion sensor when
//! its `name` mentions `accel` (accelerometer) or `gyro`/`anglvel`
//! (gyroscope), and its `location` file says `base` or `lid`.
//!
//! Sampling reads `in_<channel>_raw` `count` times and scales each reading by
//! `in_<channel>_scale` (falling back to the shared `in_<type>_scale`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use senscal_traits::{BoxError, SensorChannel, SensorId, SensorKind, SensorLocation, SensorProbe};

use crate::error::{HwError, Result};
use crate::util::read_attr;

/// A motion sensor found in the IIO tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfsDevice {
    pub id: SensorId,
    pub path: PathBuf,
}

fn kind_from_name(name: &str) -> Option<SensorKind> {
    let name = name.to_ascii_lowercase();
    if name.contains("accel") {
        Some(SensorKind::Accelerometer)
    } else if name.contains("gyro") || name.contains("anglvel") {
        Some(SensorKind::Gyroscope)
    } else {
        None
    }
}

fn location_from_str(location: &str) -> Option<SensorLocation> {
    match location.trim() {
        "base" => Some(SensorLocation::Base),
        "lid" => Some(SensorLocation::Lid),
        _ => None,
    }
}

/// Discovers motion sensors below an IIO root directory.
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    root: PathBuf,
}

impl SysfsProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Every recognised device, sorted by sensor id. The first device wins
    /// when two report the same kind and location.
    pub fn devices(&self) -> Result<Vec<SysfsDevice>> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("iio:device"))
            })
            .collect();
        dirs.sort();

        let mut found: Vec<SysfsDevice> = Vec::new();
        for dir in dirs {
            let Ok(name) = fs::read_to_string(dir.join("name")) else {
                continue;
            };
            let Some(kind) = kind_from_name(&name) else {
                tracing::trace!(path = %dir.display(), name = name.trim(), "not a motion sensor");
                continue;
            };
            let location = fs::read_to_string(dir.join("location"))
                .ok()
                .and_then(|l| location_from_str(&l));
            let Some(location) = location else {
                tracing::debug!(path = %dir.display(), "motion sensor without usable location");
                continue;
            };
            let id = SensorId::new(kind, location);
            if found.iter().any(|d| d.id == id) {
                tracing::warn!(sensor = %id, path = %dir.display(), "duplicate sensor ignored");
                continue;
            }
            found.push(SysfsDevice { id, path: dir });
        }
        found.sort_by_key(|d| d.id);
        Ok(found)
    }

    pub fn sensor(&self, id: SensorId) -> Option<SysfsSensor> {
        match self.devices() {
            Ok(devices) => devices
                .into_iter()
                .find(|d| d.id == id)
                .map(|d| SysfsSensor::new(d.path)),
            Err(e) => {
                tracing::warn!(error = %e, root = %self.root.display(), "cannot list iio devices");
                None
            }
        }
    }
}

impl SensorProbe for SysfsProbe {
    fn probe(&self) -> Vec<SensorId> {
        match self.devices() {
            Ok(devices) => devices.into_iter().map(|d| d.id).collect(),
            Err(e) => {
                tracing::warn!(error = %e, root = %self.root.display(), "cannot list iio devices");
                Vec::new()
            }
        }
    }
}

/// Running mean and variance, Welford's online update.
#[derive(Debug, Clone, Copy, Default)]
struct Welford {
    n: usize,
    mean: f64,
    m2: f64,
}

impl Welford {
    fn push(&mut self, x: f64) {
        self.n += 1;
        let dx = x - self.mean;
        self.mean += dx / self.n as f64;
        self.m2 += dx * (x - self.mean);
    }

    /// Unbiased sample variance; zero below two samples.
    fn variance(&self) -> f64 {
        if self.n < 2 {
            0.0
        } else {
            self.m2 / (self.n - 1) as f64
        }
    }
}

/// One IIO device directory.
#[derive(Debug, Clone)]
pub struct SysfsSensor {
    dir: PathBuf,
    interval: Duration,
}

impl SysfsSensor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            interval: Duration::ZERO,
        }
    }

    /// Pause between consecutive raw reads.
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `in_accel_x_base_calibbias` is looked up as given, then without the
    /// location segment (`in_accel_x_calibbias`), which is how a per-device
    /// directory names it.
    fn bias_path(&self, entry: &str) -> Result<PathBuf> {
        let direct = self.dir.join(entry);
        if direct.exists() {
            return Ok(direct);
        }
        for location in [SensorLocation::Base, SensorLocation::Lid] {
            let segment = format!("_{location}_");
            if entry.contains(&segment) {
                let fallback = self.dir.join(entry.replacen(&segment, "_", 1));
                if fallback.exists() {
                    return Ok(fallback);
                }
            }
        }
        Err(HwError::MissingEntry(entry.to_owned()))
    }

    fn scale(&self, channel: &str) -> f64 {
        let own = self.dir.join(format!("in_{channel}_scale"));
        let shared = channel
            .split_once('_')
            .map(|(ty, _)| self.dir.join(format!("in_{ty}_scale")));
        for path in std::iter::once(own).chain(shared) {
            if let Ok(scale) = read_attr::<f64>(&path) {
                return scale;
            }
        }
        tracing::debug!(channel, dir = %self.dir.display(), "no scale attribute, using 1.0");
        1.0
    }

    fn sample(&self, channels: &[String], count: usize) -> Result<(Vec<f64>, Vec<f64>)> {
        let scales: Vec<f64> = channels.iter().map(|c| self.scale(c)).collect();
        let raw_paths: Vec<PathBuf> = channels
            .iter()
            .map(|c| self.dir.join(format!("in_{c}_raw")))
            .collect();

        let mut stats = vec![Welford::default(); channels.len()];
        for i in 0..count {
            if i > 0 && !self.interval.is_zero() {
                std::thread::sleep(self.interval);
            }
            for ((path, scale), acc) in raw_paths.iter().zip(&scales).zip(stats.iter_mut()) {
                let raw: f64 = read_attr(path)?;
                acc.push(raw * scale);
            }
        }
        Ok((
            stats.iter().map(|s| s.mean).collect(),
            stats.iter().map(Welford::variance).collect(),
        ))
    }
}

impl SensorChannel for SysfsSensor {
    fn read_bias(&self, entries: &[String]) -> std::result::Result<Vec<f64>, BoxError> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let value: i32 = read_attr(&self.bias_path(entry)?)?;
            out.push(f64::from(value));
        }
        Ok(out)
    }

    fn sample_averaged(
        &self,
        channels: &[String],
        count: usize,
    ) -> std::result::Result<(Vec<f64>, Vec<f64>), BoxError> {
        if count == 0 {
            return Err(HwError::ChannelCount {
                expected: 1,
                got: 0,
            }
            .into());
        }
        Ok(self.sample(channels, count)?)
    }
}
