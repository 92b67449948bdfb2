//! Maps `Box<dyn Error>` from trait boundaries to typed `CalibError`.
//!
//! The traits in `senscal_traits` use `Box<dyn Error + Send + Sync>` for maximum
//! flexibility; this module converts those to our typed error enum, with an
//! optional feature-gated path for `senscal_hardware::HwError` downcasting.

use crate::error::CalibError;

/// Map a trait-boundary error to a typed `CalibError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to string-based heuristics.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> CalibError {
    #[cfg(feature = "hardware-errors")]
    {
        if let Some(hw) = e.downcast_ref::<senscal_hardware::error::HwError>() {
            return match hw {
                senscal_hardware::error::HwError::Timeout => CalibError::Timeout,
                other => CalibError::Hardware(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") {
        CalibError::Timeout
    } else {
        CalibError::Hardware(s)
    }
}
