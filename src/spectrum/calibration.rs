//! Pixel → wavelength → Raman shift.

use crate::error::{Result, SpectrometerError};
use serde::{Deserialize, Serialize};

/// Quadratic wavelength calibration plus optional excitation laser.
///
/// `wavelength(p) = a·p² + b·p + c` with `coefficients = [a, b, c]`. Fewer than
/// three coefficients are treated as missing higher-order terms, so `[b, c]`
/// becomes `[0, b, c]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCalibration")]
pub struct CalibrationModel {
    coefficients: [f64; 3],
    laser_wavelength_nm: Option<f64>,
}

#[derive(Deserialize)]
struct RawCalibration {
    coefficients: Vec<f64>,
    #[serde(default)]
    laser_wavelength_nm: Option<f64>,
}

impl TryFrom<RawCalibration> for CalibrationModel {
    type Error = SpectrometerError;

    fn try_from(raw: RawCalibration) -> Result<Self> {
        Self::new(&raw.coefficients, raw.laser_wavelength_nm)
    }
}

impl Default for CalibrationModel {
    /// Identity mapping: wavelength equals pixel index.
    fn default() -> Self {
        Self {
            coefficients: [0.0, 1.0, 0.0],
            laser_wavelength_nm: None,
        }
    }
}

impl CalibrationModel {
    /// Validate and build a calibration.
    pub fn new(coefficients: &[f64], laser_wavelength_nm: Option<f64>) -> Result<Self> {
        if coefficients.is_empty() || coefficients.len() > 3 {
            return Err(SpectrometerError::InvalidParameter(format!(
                "calibration needs 1 to 3 coefficients, got {}",
                coefficients.len()
            )));
        }
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Err(SpectrometerError::InvalidParameter(
                "calibration coefficients must be finite".to_string(),
            ));
        }
        if let Some(laser) = laser_wavelength_nm {
            if !laser.is_finite() || laser <= 0.0 {
                return Err(SpectrometerError::InvalidParameter(format!(
                    "laser wavelength must be positive, got {laser}"
                )));
            }
        }

        let mut padded = [0.0; 3];
        padded[3 - coefficients.len()..].copy_from_slice(coefficients);
        Ok(Self {
            coefficients: padded,
            laser_wavelength_nm,
        })
    }

    /// `[a, b, c]`.
    #[must_use]
    pub fn coefficients(&self) -> [f64; 3] {
        self.coefficients
    }

    /// Excitation laser wavelength, if configured.
    #[must_use]
    pub fn laser_wavelength_nm(&self) -> Option<f64> {
        self.laser_wavelength_nm
    }

    /// Wavelength in nm at a (binned) pixel index.
    #[must_use]
    pub fn wavelength(&self, pixel: f64) -> f64 {
        let [a, b, c] = self.coefficients;
        (a * pixel + b) * pixel + c
    }

    /// Wavelengths for pixels `0..count`.
    #[must_use]
    pub fn wavelengths(&self, count: usize) -> Vec<f64> {
        (0..count).map(|p| self.wavelength(p as f64)).collect()
    }

    /// Check that Raman shifts exist for pixels `0..count`.
    ///
    /// Passes trivially without a laser. Fails the same way `raman_shifts`
    /// would if any of those pixels maps to a non-positive wavelength.
    pub fn check_raman(&self, count: usize) -> Result<()> {
        let Some(laser) = self.laser_wavelength_nm else {
            return Ok(());
        };
        (0..count).try_for_each(|p| raman_shift(self.wavelength(p as f64), laser).map(|_| ()))
    }

    /// Raman shifts for each wavelength, using the configured laser.
    pub fn raman_shifts(&self, wavelengths: &[f64]) -> Result<Vec<f64>> {
        let laser = self.laser_wavelength_nm.ok_or_else(|| {
            SpectrometerError::RamanUnavailable("no laser wavelength configured".to_string())
        })?;
        wavelengths
            .iter()
            .map(|&wavelength| raman_shift(wavelength, laser))
            .collect()
    }
}

/// Raman shift in cm⁻¹, rounded to the nearest integer.
///
/// `round((1/laser − 1/wavelength) × 1e7)`
pub fn raman_shift(wavelength_nm: f64, laser_nm: f64) -> Result<f64> {
    if !laser_nm.is_finite() || laser_nm <= 0.0 {
        return Err(SpectrometerError::RamanUnavailable(format!(
            "laser wavelength {laser_nm} nm is not positive"
        )));
    }
    if !wavelength_nm.is_finite() || wavelength_nm <= 0.0 {
        return Err(SpectrometerError::InvalidParameter(format!(
            "wavelength {wavelength_nm} nm is not positive"
        )));
    }
    Ok(((1.0 / laser_nm - 1.0 / wavelength_nm) * 1e7).round())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_calibration() {
        let model = CalibrationModel::default();
        for pixel in [0.0, 1.0, 17.0, 5495.0] {
            assert_eq!(model.wavelength(pixel), pixel);
        }
    }

    #[test]
    fn test_linear_calibration_scenario() {
        let model = CalibrationModel::new(&[0.0, 0.5, 400.0], None).unwrap();
        assert_eq!(model.wavelength(200.0), 500.0);
        assert_eq!(model.wavelengths(3), vec![400.0, 400.5, 401.0]);
    }

    #[test]
    fn test_quadratic_term() {
        let model = CalibrationModel::new(&[0.001, 0.2, 350.0], None).unwrap();
        assert!((model.wavelength(100.0) - 380.0).abs() < 1e-9);
        assert!((model.wavelength(0.0) - 350.0).abs() < 1e-12);
    }

    #[test]
    fn test_short_coefficients_are_left_padded() {
        let model = CalibrationModel::new(&[0.5, 400.0], None).unwrap();
        assert_eq!(model.coefficients(), [0.0, 0.5, 400.0]);
        let constant = CalibrationModel::new(&[532.0], None).unwrap();
        assert_eq!(constant.wavelength(42.0), 532.0);
    }

    #[test]
    fn test_invalid_calibration_rejected() {
        assert!(CalibrationModel::new(&[], None).is_err());
        assert!(CalibrationModel::new(&[1.0, 2.0, 3.0, 4.0], None).is_err());
        assert!(CalibrationModel::new(&[f64::NAN, 1.0, 0.0], None).is_err());
        assert!(CalibrationModel::new(&[0.0, 1.0, 0.0], Some(0.0)).is_err());
        assert!(CalibrationModel::new(&[0.0, 1.0, 0.0], Some(-532.0)).is_err());
    }

    #[test]
    fn test_raman_shift_scenario() {
        let expected = ((1.0 / 532.0 - 1.0 / 540.0) * 1e7_f64).round();
        assert_eq!(expected, 278.0);
        assert_eq!(raman_shift(540.0, 532.0).unwrap(), expected);
    }

    #[test]
    fn test_raman_shift_rejects_bad_laser() {
        for laser in [0.0, -532.0, f64::NAN] {
            assert!(matches!(
                raman_shift(540.0, laser),
                Err(SpectrometerError::RamanUnavailable(_))
            ));
        }
        assert!(matches!(
            raman_shift(0.0, 532.0),
            Err(SpectrometerError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_raman_shifts_need_laser() {
        let model = CalibrationModel::default();
        assert!(matches!(
            model.raman_shifts(&[540.0]),
            Err(SpectrometerError::RamanUnavailable(_))
        ));
        let model = CalibrationModel::new(&[0.0, 1.0, 0.0], Some(532.0)).unwrap();
        assert_eq!(model.raman_shifts(&[532.0, 540.0]).unwrap(), vec![0.0, 278.0]);
    }

    #[test]
    fn test_check_raman_covers_every_pixel() {
        let identity = CalibrationModel::new(&[0.0, 1.0, 0.0], Some(532.0)).unwrap();
        // pixel 0 maps to 0 nm
        assert!(matches!(
            identity.check_raman(100),
            Err(SpectrometerError::InvalidParameter(_))
        ));

        let offset = CalibrationModel::new(&[0.0, 0.5, 400.0], Some(532.0)).unwrap();
        assert!(offset.check_raman(5496).is_ok());
        // descending axis reaches 0 nm at pixel 800
        let descending = CalibrationModel::new(&[0.0, -0.5, 400.0], Some(532.0)).unwrap();
        assert!(descending.check_raman(800).is_ok());
        assert!(descending.check_raman(801).is_err());

        assert!(CalibrationModel::default().check_raman(100).is_ok());
    }

    #[test]
    fn test_deserialize_validates() {
        let model: CalibrationModel =
            serde_json::from_str(r#"{"coefficients": [0.5, 400.0], "laser_wavelength_nm": 785.0}"#)
                .unwrap();
        assert_eq!(model.coefficients(), [0.0, 0.5, 400.0]);
        assert_eq!(model.laser_wavelength_nm(), Some(785.0));

        let bad = serde_json::from_str::<CalibrationModel>(r#"{"coefficients": []}"#);
        assert!(bad.is_err());
    }
}
