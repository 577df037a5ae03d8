//! Camera device adapter.
//!
//! `CameraDevice` is the seam between the controller's state machine and the
//! vendor SDK. Implementations own the native handle and expose register-level
//! calls only; they do no validation of their own beyond what the SDK does and
//! keep no notion of connection state beyond "handle open or not".
//!
//! Methods report `anyhow::Result` so SDK wrappers can attach context freely;
//! the controller maps failures to `SpectrometerError::Device`.

use super::{CameraInfo, RegionOfInterest};
use anyhow::Result;
use async_trait::async_trait;

/// Exposure progress as reported by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureStatus {
    /// No exposure has been started.
    Idle,
    /// Exposure or readout still in progress.
    Working,
    /// Frame is ready to be pulled.
    Success,
    /// The sensor aborted the exposure.
    Failed,
}

/// Register-level access to a single camera.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Open the native handle and read the sensor description.
    async fn open(&self) -> Result<CameraInfo>;

    /// Release the native handle.
    async fn close(&self) -> Result<()>;

    /// Write the exposure register (microseconds).
    async fn set_exposure_us(&self, micros: u64) -> Result<()>;

    /// Write the analog gain register.
    async fn set_gain(&self, gain: u32) -> Result<()>;

    /// Program the readout window and binning.
    async fn set_roi(&self, roi: &RegionOfInterest, binning: u32) -> Result<()>;

    /// Trigger a single exposure.
    async fn start_exposure(&self) -> Result<()>;

    /// Query exposure progress.
    async fn exposure_status(&self) -> Result<ExposureStatus>;

    /// Abandon an in-flight exposure. Hardware without abort support may ignore it.
    async fn abort_exposure(&self) -> Result<()> {
        Ok(())
    }

    /// Pull the completed frame buffer, row-major, sized to the binned ROI.
    async fn read_frame(&self) -> Result<Vec<u16>>;
}
