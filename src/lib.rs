//! Core library for the spectro_daq application.
//!
//! Operates a scientific camera as a line-scan spectrometer: camera connection
//! and configuration, frame capture, column-wise reduction of a region of
//! interest into an intensity spectrum, and wavelength / Raman calibration.
//!
//! The camera SDK sits behind the [`CameraDevice`] trait; [`SimulatedCamera`]
//! implements it without hardware.
//!
//! ```no_run
//! use spectro_daq::{CaptureTiming, ReadoutMode, SimulatedCamera, Spectrometer};
//! use std::sync::Arc;
//!
//! # async fn run() -> spectro_daq::Result<()> {
//! let spectrometer = Spectrometer::new(Arc::new(SimulatedCamera::new()), CaptureTiming::default());
//! spectrometer.connect().await?;
//! spectrometer.set_exposure(250, 100).await?;
//! spectrometer.set_calibration(&[0.0, 0.05, 500.0], Some(532.0)).await?;
//! let spectrum = spectrometer.acquire_spectrum(ReadoutMode::Average, false).await?;
//! println!("{} points", spectrum.len());
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod config;
pub mod error;
pub mod logging;
pub mod spectrometer;
pub mod spectrum;
pub mod storage;

pub use camera::{
    CameraController, CameraDevice, CameraInfo, CameraSettings, CaptureTiming, ConnectionState,
    Exposure, RawFrame, RegionOfInterest, SimulatedCamera,
};
pub use error::{Result, SpectrometerError};
pub use spectrometer::{
    AcquisitionRequest, DefaultSettings, ImageSnapshot, ProcessingSettings, Spectrometer,
    SpectrometerStatus, SpectrumResult,
};
pub use spectrum::{Baseline, CalibrationModel, ReadoutMode};
