//! Camera data model shared by the device adapter, the controller and the
//! orchestrator.
//!
//! Exposure is carried as an [`Exposure`] newtype that stores microseconds (the
//! unit the sensor registers use) and only speaks milliseconds at the boundary:
//! constructors, accessors and serde all use milliseconds.

pub mod controller;
pub mod device;
pub mod simulated;

pub use controller::{CameraController, CaptureTiming, ControllerStatus};
pub use device::{CameraDevice, ExposureStatus};
pub use simulated::{
    asi183mm_info, EmissionLine, FramePattern, SimRegisters, SimulatedCamera, SimulatorOp,
};

use crate::error::{Result, SpectrometerError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Shortest exposure accepted at the boundary, in milliseconds.
pub const MIN_EXPOSURE_MS: u64 = 1;
/// Longest exposure accepted at the boundary, in milliseconds (10 minutes).
pub const MAX_EXPOSURE_MS: u64 = 600_000;
/// Highest analog gain value accepted.
pub const MAX_GAIN: u32 = 500;
/// Exposure applied by a freshly constructed controller.
pub const DEFAULT_EXPOSURE_MS: u64 = 100;
/// Upper bound on the height of the default spectroscopy ROI, in sensor rows.
pub const DEFAULT_ROI_HEIGHT: u32 = 100;

// =============================================================================
// Exposure
// =============================================================================

/// Validated exposure time.
///
/// Serializes as integer milliseconds; deserialization re-runs the range check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Exposure {
    micros: u64,
}

impl Exposure {
    /// Build an exposure from milliseconds, rejecting values outside
    /// `MIN_EXPOSURE_MS..=MAX_EXPOSURE_MS`.
    pub fn from_millis(ms: u64) -> Result<Self> {
        if !(MIN_EXPOSURE_MS..=MAX_EXPOSURE_MS).contains(&ms) {
            return Err(SpectrometerError::InvalidParameter(format!(
                "exposure {ms} ms outside {MIN_EXPOSURE_MS}..={MAX_EXPOSURE_MS} ms"
            )));
        }
        Ok(Self { micros: ms * 1000 })
    }

    /// Exposure in microseconds, the register unit.
    #[must_use]
    pub fn as_micros(self) -> u64 {
        self.micros
    }

    /// Exposure in milliseconds, the boundary unit.
    #[must_use]
    pub fn as_millis(self) -> u64 {
        self.micros / 1000
    }

    /// Exposure as a wall-clock duration.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::from_micros(self.micros)
    }
}

impl Default for Exposure {
    fn default() -> Self {
        Self {
            micros: DEFAULT_EXPOSURE_MS * 1000,
        }
    }
}

impl TryFrom<u64> for Exposure {
    type Error = SpectrometerError;

    fn try_from(ms: u64) -> Result<Self> {
        Self::from_millis(ms)
    }
}

impl From<Exposure> for u64 {
    fn from(exposure: Exposure) -> Self {
        exposure.as_millis()
    }
}

impl fmt::Display for Exposure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ms", self.as_millis())
    }
}

// =============================================================================
// Settings and geometry
// =============================================================================

/// Exposure, gain and binning held by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Exposure time (milliseconds on the wire).
    #[serde(rename = "exposure_ms")]
    pub exposure: Exposure,
    /// Analog gain, `0..=MAX_GAIN`.
    pub gain: u32,
    /// Symmetric binning factor, at least 1.
    pub binning: u32,
}

impl CameraSettings {
    /// Build settings from boundary values, validating each of them.
    pub fn new(exposure_ms: u64, gain: u32, binning: u32) -> Result<Self> {
        let settings = Self {
            exposure: Exposure::from_millis(exposure_ms)?,
            gain,
            binning,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check gain and binning ranges. Exposure is valid by construction.
    pub fn validate(&self) -> Result<()> {
        if self.gain > MAX_GAIN {
            return Err(SpectrometerError::InvalidParameter(format!(
                "gain {} outside 0..={MAX_GAIN}",
                self.gain
            )));
        }
        if self.binning == 0 {
            return Err(SpectrometerError::InvalidParameter(
                "binning factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            exposure: Exposure::default(),
            gain: 0,
            binning: 1,
        }
    }
}

/// Static description of the connected sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    /// Model name reported by the SDK.
    pub name: String,
    /// SDK camera index.
    pub camera_id: u32,
    /// Full sensor width in unbinned pixels.
    pub max_width: u32,
    /// Full sensor height in unbinned pixels.
    pub max_height: u32,
    /// Pixel pitch in micrometres.
    pub pixel_size_um: f64,
    /// Binning factors the hardware accepts.
    pub supported_bins: Vec<u32>,
    /// ADC bit depth.
    pub bit_depth: u8,
    /// Whether the sensor has a colour filter array.
    pub is_color: bool,
    /// Binned ROI width must be a multiple of this.
    pub width_step: u32,
    /// Binned ROI height must be a multiple of this.
    pub height_step: u32,
}

impl CameraInfo {
    /// True if `binning` is one of the hardware bins.
    #[must_use]
    pub fn supports_binning(&self, binning: u32) -> bool {
        self.supported_bins.contains(&binning)
    }
}

/// Region of interest in unbinned sensor pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionOfInterest {
    /// First column.
    pub start_x: u32,
    /// First row.
    pub start_y: u32,
    /// Number of columns.
    pub width: u32,
    /// Number of rows.
    pub height: u32,
}

impl RegionOfInterest {
    /// Create a region. No validation happens until it is checked against a sensor.
    #[must_use]
    pub fn new(start_x: u32, start_y: u32, width: u32, height: u32) -> Self {
        Self {
            start_x,
            start_y,
            width,
            height,
        }
    }

    /// Whole-sensor region.
    #[must_use]
    pub fn full_sensor(info: &CameraInfo) -> Self {
        Self::new(0, 0, info.max_width, info.max_height)
    }

    /// Thin horizontal strip centred on the sensor, spanning the full width.
    ///
    /// Height is `min(DEFAULT_ROI_HEIGHT, max_height / 4)`, snapped down to the
    /// binning and alignment grid.
    #[must_use]
    pub fn default_spectroscopy(info: &CameraInfo, binning: u32) -> Self {
        let binning = binning.max(1);
        let col_grid = binning * info.width_step.max(1);
        let row_grid = binning * info.height_step.max(1);

        let width = (info.max_width / col_grid * col_grid).max(col_grid.min(info.max_width));
        let wanted = DEFAULT_ROI_HEIGHT.min(info.max_height / 4);
        let height = (wanted / row_grid * row_grid)
            .max(row_grid)
            .min(info.max_height);
        let start_y = (info.max_height - height) / 2;

        Self::new(0, start_y, width, height)
    }

    /// Columns after binning.
    #[must_use]
    pub fn binned_width(&self, binning: u32) -> u32 {
        self.width / binning.max(1)
    }

    /// Rows after binning.
    #[must_use]
    pub fn binned_height(&self, binning: u32) -> u32 {
        self.height / binning.max(1)
    }

    /// Check this region against the sensor geometry and binning rules.
    pub fn validate(&self, info: &CameraInfo, binning: u32) -> Result<()> {
        let invalid = |msg: String| Err(SpectrometerError::InvalidParameter(msg));

        if self.width == 0 || self.height == 0 {
            return invalid(format!(
                "ROI must have non-zero size, got {}x{}",
                self.width, self.height
            ));
        }
        let end_x = self.start_x.checked_add(self.width);
        if end_x.map_or(true, |end| end > info.max_width) {
            return invalid(format!(
                "ROI columns {}+{} exceed sensor width {}",
                self.start_x, self.width, info.max_width
            ));
        }
        let end_y = self.start_y.checked_add(self.height);
        if end_y.map_or(true, |end| end > info.max_height) {
            return invalid(format!(
                "ROI rows {}+{} exceed sensor height {}",
                self.start_y, self.height, info.max_height
            ));
        }
        if binning == 0 {
            return invalid("binning factor must be at least 1".to_string());
        }
        if self.width % binning != 0 || self.height % binning != 0 {
            return invalid(format!(
                "ROI {}x{} not divisible by binning {binning}",
                self.width, self.height
            ));
        }
        let width_step = info.width_step.max(1);
        let height_step = info.height_step.max(1);
        if self.binned_width(binning) % width_step != 0 {
            return invalid(format!(
                "binned ROI width {} must be a multiple of {width_step}",
                self.binned_width(binning)
            ));
        }
        if self.binned_height(binning) % height_step != 0 {
            return invalid(format!(
                "binned ROI height {} must be a multiple of {height_step}",
                self.binned_height(binning)
            ));
        }
        Ok(())
    }
}

impl fmt::Display for RegionOfInterest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x={} y={} w={} h={}",
            self.start_x, self.start_y, self.width, self.height
        )
    }
}

/// Connection lifecycle of the camera controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No device handle held.
    #[default]
    Disconnected,
    /// Device opened, driver still settling.
    Connecting,
    /// Ready for configuration and capture.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

// =============================================================================
// RawFrame
// =============================================================================

/// Acquisition context stamped on a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameMetadata {
    /// Settings in effect during the exposure.
    pub settings: CameraSettings,
    /// Region read out.
    pub roi: RegionOfInterest,
    /// Wall-clock time the buffer was pulled.
    pub captured_at: DateTime<Utc>,
}

/// Immutable row-major grid of 16-bit samples.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    width: u32,
    height: u32,
    data: Vec<u16>,
    metadata: Option<FrameMetadata>,
}

impl RawFrame {
    /// Wrap a sample buffer, rejecting it if its length is not `width * height`.
    pub fn new(width: u32, height: u32, data: Vec<u16>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| {
                SpectrometerError::InvalidFrame(format!("{width}x{height} frame size overflows"))
            })?;
        if data.len() != expected {
            return Err(SpectrometerError::InvalidFrame(format!(
                "buffer holds {} samples, {width}x{height} frame needs {expected}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
            metadata: None,
        })
    }

    /// Attach acquisition context.
    #[must_use]
    pub fn with_metadata(mut self, metadata: FrameMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Columns.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Rows.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// All samples, row-major.
    #[must_use]
    pub fn data(&self) -> &[u16] {
        &self.data
    }

    /// Acquisition context, if the frame came from a capture.
    #[must_use]
    pub fn metadata(&self) -> Option<&FrameMetadata> {
        self.metadata.as_ref()
    }

    /// Iterate over rows. Yields nothing for a zero-width frame.
    pub fn rows(&self) -> impl Iterator<Item = &[u16]> {
        // chunks_exact panics on a zero chunk size
        self.data.chunks_exact(self.width.max(1) as usize)
    }
}
