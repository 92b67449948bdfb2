//! Back-ends for the calibration collaborator traits.
//!
//! - `sim`: simulated sensor bench with fault injection
//! - `sysfs`: IIO sysfs prober and sensor reader
//! - `store`: JSON file workflow store
//! - `vpd`: JSON file non-volatile calibration store
pub mod error;
pub mod sim;
pub mod store;
pub mod sysfs;
pub mod util;
pub mod vpd;

pub use error::HwError;
pub use sim::{SimFault, SimulatedBench, SimulatedSensor};
pub use store::JsonFileStore;
pub use sysfs::{SysfsDevice, SysfsProbe, SysfsSensor};
pub use vpd::FileCalibrationStore;
