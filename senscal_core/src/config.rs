//! Runtime configuration for the calibration core.
//!
//! Separate from the TOML-deserialized config in `senscal_config`; see
//! `conversions` for the bridge.

/// Background task runner settings for the Run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerCfg {
    /// Worker threads running calibration routines concurrently.
    pub workers: usize,
    /// Upper bound for one calibration round when the driver waits on it.
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
