//! Spectral reduction and calibration.
//!
//! - [`reducer`]: 2-D frame → 1-D intensity vector
//! - [`calibration`]: pixel → wavelength → Raman shift
//! - [`baseline`]: background removal on intensity vectors

pub mod baseline;
pub mod calibration;
pub mod reducer;

pub use baseline::{Baseline, MAX_POLYNOMIAL_DEGREE};
pub use calibration::{raman_shift, CalibrationModel};
pub use reducer::{reduce, ReadoutMode};
