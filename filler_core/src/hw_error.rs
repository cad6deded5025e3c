//! Maps `Box<dyn Error>` from trait boundaries to typed `FillerError`.
//!
//! The traits in `filler_traits` use `Box<dyn Error + Send + Sync>` for maximum
//! flexibility; this module converts those to our typed error enum, with an
//! optional feature-gated path for `filler_hardware::HwError` downcasting.

use crate::error::FillerError;

/// Map a trait-boundary error to a typed `FillerError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to string-based heuristics. Anything that is not a timeout is a link
/// failure: the station behind it can no longer be trusted.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> FillerError {
    #[cfg(feature = "hardware-errors")]
    {
        if let Some(hw) = e.downcast_ref::<filler_hardware::error::HwError>() {
            return match hw {
                filler_hardware::error::HwError::Timeout => FillerError::Timeout,
                other => FillerError::LinkFailure(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timed out") || s.to_lowercase().contains("timeout") {
        FillerError::Timeout
    } else {
        FillerError::LinkFailure(s)
    }
}

/// Convenience for `map_err` on boxed trait errors.
pub(crate) fn from_boxed(e: filler_traits::BoxError) -> FillerError {
    map_hw_error(&*e)
}
