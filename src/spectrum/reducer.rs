//! Column-wise reduction of a 2-D frame into an intensity vector.

use crate::camera::RawFrame;
use crate::error::{Result, SpectrometerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the rows of each column are collapsed into one intensity value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadoutMode {
    /// Arithmetic mean of the column.
    #[default]
    Average,
    /// Largest sample in the column.
    Maximum,
}

impl fmt::Display for ReadoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadoutMode::Average => f.write_str("average"),
            ReadoutMode::Maximum => f.write_str("maximum"),
        }
    }
}

impl FromStr for ReadoutMode {
    type Err = SpectrometerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "average" | "mean" => Ok(ReadoutMode::Average),
            "maximum" | "max" => Ok(ReadoutMode::Maximum),
            other => Err(SpectrometerError::InvalidParameter(format!(
                "unknown readout mode '{other}', expected 'average' or 'maximum'"
            ))),
        }
    }
}

/// Reduce `frame` to one value per column.
///
/// The output has `frame.width()` elements in the native sample range. A frame
/// with no rows or no columns is rejected with `InvalidFrame`.
pub fn reduce(frame: &RawFrame, mode: ReadoutMode) -> Result<Vec<f64>> {
    if frame.height() == 0 || frame.width() == 0 {
        return Err(SpectrometerError::InvalidFrame(format!(
            "cannot reduce a {}x{} frame",
            frame.width(),
            frame.height()
        )));
    }
    let width = frame.width() as usize;

    let intensities = match mode {
        ReadoutMode::Average => {
            // u64 sums cannot overflow: 65535 * u32::MAX rows fits
            let mut sums = vec![0u64; width];
            for row in frame.rows() {
                for (sum, &sample) in sums.iter_mut().zip(row) {
                    *sum += u64::from(sample);
                }
            }
            let rows = f64::from(frame.height());
            sums.into_iter().map(|sum| sum as f64 / rows).collect()
        }
        ReadoutMode::Maximum => {
            let mut maxima = vec![0u16; width];
            for row in frame.rows() {
                for (max, &sample) in maxima.iter_mut().zip(row) {
                    *max = (*max).max(sample);
                }
            }
            maxima.into_iter().map(f64::from).collect()
        }
    };
    Ok(intensities)
}
