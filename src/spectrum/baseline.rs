//! Baseline correction of intensity vectors.
//!
//! The polynomial method is the improved modified polynomial fit (IModPoly,
//! Zhao et al., Appl. Spectrosc. 61, 2007): fit a least-squares polynomial,
//! clamp the working signal to `min(signal, fit + σ)` where σ is the standard
//! deviation of the fit residual, and repeat until σ settles. Peaks stop pulling
//! the fit upwards while noise on the baseline is kept. The final fit is the
//! baseline.

use crate::error::{Result, SpectrometerError};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Highest polynomial degree accepted.
pub const MAX_POLYNOMIAL_DEGREE: usize = 10;

const IMODPOLY_TOLERANCE: f64 = 1e-3;
const IMODPOLY_MAX_ITERATIONS: usize = 100;
const IMODPOLY_MIN_DEVIATION: f64 = 1e-9;

/// Baseline correction applied to intensities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Baseline {
    /// Leave intensities untouched.
    #[default]
    None,
    /// Subtract the line through the first and last samples.
    Linear,
    /// Subtract an iteratively fitted polynomial (IModPoly).
    Polynomial {
        /// Polynomial degree, `1..=MAX_POLYNOMIAL_DEGREE`.
        degree: usize,
    },
}

impl fmt::Display for Baseline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Baseline::None => f.write_str("none"),
            Baseline::Linear => f.write_str("linear"),
            Baseline::Polynomial { degree } => write!(f, "polynomial(degree {degree})"),
        }
    }
}

impl Baseline {
    /// Reject unusable polynomial degrees.
    pub fn validate(&self) -> Result<()> {
        if let Baseline::Polynomial { degree } = *self {
            if !(1..=MAX_POLYNOMIAL_DEGREE).contains(&degree) {
                return Err(SpectrometerError::InvalidParameter(format!(
                    "polynomial baseline degree {degree} outside 1..={MAX_POLYNOMIAL_DEGREE}"
                )));
            }
        }
        Ok(())
    }

    /// Subtract the baseline in place. Corrected values are clamped at zero.
    pub fn apply(&self, intensities: &mut [f64]) -> Result<()> {
        self.validate()?;
        match *self {
            Baseline::None => {}
            Baseline::Linear => subtract(intensities, &linear_baseline(intensities)),
            Baseline::Polynomial { degree } => {
                let baseline = imodpoly_baseline(intensities, degree);
                subtract(intensities, &baseline);
            }
        }
        Ok(())
    }
}

fn subtract(intensities: &mut [f64], baseline: &[f64]) {
    for (value, base) in intensities.iter_mut().zip(baseline) {
        *value = (*value - base).max(0.0);
    }
}

fn linear_baseline(signal: &[f64]) -> Vec<f64> {
    let (Some(&first), Some(&last)) = (signal.first(), signal.last()) else {
        return Vec::new();
    };
    if signal.len() == 1 {
        return vec![first];
    }
    let slope = (last - first) / (signal.len() - 1) as f64;
    (0..signal.len())
        .map(|i| first + slope * i as f64)
        .collect()
}

fn imodpoly_baseline(signal: &[f64], degree: usize) -> Vec<f64> {
    let n = signal.len();
    if n == 0 {
        return Vec::new();
    }
    let degree = degree.min(n - 1);

    // Pixel axis scaled to [-1, 1] keeps the Vandermonde matrix well conditioned
    let scale = if n > 1 { 2.0 / (n - 1) as f64 } else { 0.0 };
    let vandermonde = DMatrix::from_fn(n, degree + 1, |row, col| {
        (row as f64 * scale - 1.0).powi(col as i32)
    });
    let svd = vandermonde.clone().svd(true, true);

    let mut work = DVector::from_column_slice(signal);
    let mut fit = DVector::zeros(n);
    let mut previous_dev: Option<f64> = None;
    for iteration in 0..IMODPOLY_MAX_ITERATIONS {
        let coefficients = match svd.solve(&work, 1e-12) {
            Ok(coefficients) => coefficients,
            Err(err) => {
                tracing::warn!(error = err, "Polynomial baseline fit failed");
                break;
            }
        };
        fit = &vandermonde * coefficients;

        let dev = (&work - &fit).variance().sqrt();
        let settled = previous_dev
            .map_or(false, |previous| (dev - previous).abs() <= IMODPOLY_TOLERANCE * dev);
        if settled || dev < IMODPOLY_MIN_DEVIATION {
            tracing::trace!(iteration, degree, dev, "Polynomial baseline converged");
            break;
        }
        previous_dev = Some(dev);
        work = work.zip_map(&fit, |w, f| w.min(f + dev));
    }
    fit.iter().copied().collect()
}
