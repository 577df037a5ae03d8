//! Custom error types for the spectrometer core.
//!
//! This module defines `SpectrometerError`, the single error type returned by the
//! camera controller, the spectral reducer, the calibration transform and the
//! acquisition orchestrator. It is built with `thiserror`.
//!
//! ## Error Hierarchy
//!
//! - **`NotConnected`**: an operation that needs the camera was attempted outside the
//!   `Connected` state. No hardware call is made.
//! - **`InvalidParameter`**: out-of-range exposure, gain, ROI, binning or calibration
//!   input. Always raised before any hardware state is touched.
//! - **`Device`**: a call into the camera adapter failed. The adapter reports
//!   `anyhow::Error`s; they are flattened here together with the operation name.
//! - **`CaptureTimeout`**: the exposure-complete poll budget was exhausted.
//! - **`InvalidFrame`**: a zero-sized or malformed frame reached the reducer.
//! - **`RamanUnavailable`**: a Raman shift was requested without a usable laser
//!   wavelength.
//!
//! Every failing operation leaves the held camera settings exactly as they were
//! before the call.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the spectrometer error type.
pub type Result<T> = std::result::Result<T, SpectrometerError>;

/// Errors produced by the acquisition-and-reduction pipeline.
#[derive(Error, Debug)]
pub enum SpectrometerError {
    /// The camera is not in the `Connected` state.
    #[error("Camera not connected")]
    NotConnected,

    /// `connect()` was called while already connecting or connected.
    #[error("Camera already connected")]
    AlreadyConnected,

    /// `disconnect()` ran while `connect()` was waiting for the driver to settle.
    #[error("Connection aborted by disconnect during driver settle")]
    ConnectionAborted,

    /// A requested setting was rejected before reaching hardware.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The underlying camera SDK call failed.
    #[error("Device error during {operation}: {message}")]
    Device {
        /// Adapter operation that failed.
        operation: &'static str,
        /// Flattened error chain reported by the adapter.
        message: String,
    },

    /// The exposure never reported completion within the poll budget.
    #[error("Capture timed out after {polls} status polls ({waited:?} total wait)")]
    CaptureTimeout {
        /// Number of status polls issued.
        polls: u32,
        /// Total time spent waiting for the exposure.
        waited: Duration,
    },

    /// Zero-sized or malformed frame.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Raman shift cannot be derived.
    #[error("Raman shift unavailable: {0}")]
    RamanUnavailable(String),
}

impl SpectrometerError {
    /// Wrap an adapter failure, keeping the whole context chain in the message.
    pub fn device(operation: &'static str, err: anyhow::Error) -> Self {
        Self::Device {
            operation,
            message: format!("{err:#}"),
        }
    }

    /// True for errors raised by input validation rather than hardware.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidParameter(_))
    }
}
