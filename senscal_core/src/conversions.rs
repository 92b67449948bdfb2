//! `From` implementations bridging `senscal_config` types to `senscal_core` types.

use crate::config::RunnerCfg;

impl From<&senscal_config::RunnerCfg> for RunnerCfg {
    fn from(c: &senscal_config::RunnerCfg) -> Self {
        Self {
            workers: c.workers,
            round_timeout_ms: c.round_timeout_ms,
        }
    }
}
