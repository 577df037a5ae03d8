//! Acquisition orchestrator.
//!
//! `Spectrometer` owns the camera controller together with the calibration and
//! processing settings, and sequences a single acquisition:
//!
//! ```text
//! [set_roi] -> capture -> reduce -> wavelengths -> baseline -> [Raman] -> [image]
//! ```
//!
//! Any failing stage aborts the whole acquisition; a `SpectrumResult` is either
//! complete or not produced at all. Nothing is retried. The ROI switch and the
//! Raman range check happen under the same controller lock as the capture, and
//! the last frame is only replaced once the whole pipeline succeeded.
//!
//! Calibration and processing settings are plain data. They can be changed in
//! any connection state and survive reconnects.

use crate::camera::{
    CameraController, CameraDevice, CameraInfo, CameraSettings, CaptureTiming, ConnectionState,
    ControllerStatus, RawFrame, RegionOfInterest,
};
use crate::error::{Result, SpectrometerError};
use crate::spectrum::{reduce, Baseline, CalibrationModel, ReadoutMode};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use image::{GrayImage, ImageFormat};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::io::Cursor;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default reduction applied when a request does not override it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    /// Column reduction.
    pub readout_mode: ReadoutMode,
    /// Baseline correction.
    pub baseline: Baseline,
}

impl ProcessingSettings {
    /// Check the baseline parameters.
    pub fn validate(&self) -> Result<()> {
        self.baseline.validate()
    }
}

/// One acquisition. Unset fields fall back to the held settings.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionRequest {
    /// ROI to capture on. Stays active after a successful acquisition.
    pub roi: Option<RegionOfInterest>,
    /// Calibration for this acquisition only.
    pub calibration: Option<CalibrationModel>,
    /// Column reduction for this acquisition only.
    pub readout_mode: Option<ReadoutMode>,
    /// Baseline correction for this acquisition only.
    pub baseline: Option<Baseline>,
    /// Attach the raw frame to the result.
    pub include_image: bool,
}

/// Immutable view of a captured frame, encodable as PNG.
#[derive(Debug, Clone)]
pub struct ImageSnapshot {
    frame: Arc<RawFrame>,
}

impl ImageSnapshot {
    fn new(frame: Arc<RawFrame>) -> Self {
        Self { frame }
    }

    /// The underlying frame.
    pub fn frame(&self) -> &RawFrame {
        &self.frame
    }

    /// Columns.
    pub fn width(&self) -> u32 {
        self.frame.width()
    }

    /// Rows.
    pub fn height(&self) -> u32 {
        self.frame.height()
    }

    /// 8-bit greyscale PNG, stretched between the frame's min and max samples.
    pub fn to_png(&self) -> image::ImageResult<Vec<u8>> {
        let data = self.frame.data();
        let min = data.iter().copied().min().unwrap_or(0);
        let max = data.iter().copied().max().unwrap_or(0);
        let span = f64::from(max - min).max(1.0);
        let pixels: Vec<u8> = data
            .iter()
            .map(|&v| (f64::from(v - min) * 255.0 / span).round() as u8)
            .collect();

        let img = GrayImage::from_raw(self.width(), self.height(), pixels).ok_or_else(|| {
            image::ImageError::Parameter(image::error::ParameterError::from_kind(
                image::error::ParameterErrorKind::DimensionMismatch,
            ))
        })?;
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
        Ok(png)
    }

    /// PNG encoded as standard base64.
    pub fn to_png_base64(&self) -> image::ImageResult<String> {
        Ok(BASE64.encode(self.to_png()?))
    }
}

impl Serialize for ImageSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let png = self.to_png_base64().map_err(serde::ser::Error::custom)?;
        let mut state = serializer.serialize_struct("ImageSnapshot", 3)?;
        state.serialize_field("width", &self.width())?;
        state.serialize_field("height", &self.height())?;
        state.serialize_field("png_base64", &png)?;
        state.end()
    }
}

/// Result of one acquisition.
///
/// `wavelengths`, `intensities` and `raman_shifts` (when present) all have one
/// entry per binned ROI column.
#[derive(Debug, Clone, Serialize)]
pub struct SpectrumResult {
    /// Time the frame was read out.
    pub timestamp: DateTime<Utc>,
    /// Exposure used, in milliseconds.
    pub exposure_ms: u64,
    /// Gain used.
    pub gain: u32,
    /// Binning used.
    pub binning: u32,
    /// ROI read out.
    pub roi: RegionOfInterest,
    /// Column reduction used.
    pub readout_mode: ReadoutMode,
    /// Baseline correction used.
    pub baseline: Baseline,
    /// Wavelength per column, in nm.
    pub wavelengths: Vec<f64>,
    /// Intensity per column, baseline-corrected.
    pub intensities: Vec<f64>,
    /// Raman shift per column in cm⁻¹, when a laser wavelength is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raman_shifts: Option<Vec<f64>>,
    /// Raw frame, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageSnapshot>,
}

impl SpectrumResult {
    /// Number of spectral points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.intensities.len()
    }

    /// True for an empty spectrum.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intensities.is_empty()
    }
}

/// Camera status plus the orchestrator's own settings.
#[derive(Debug, Clone, Serialize)]
pub struct SpectrometerStatus {
    /// Connection, sensor, settings and ROI.
    #[serde(flatten)]
    pub camera: ControllerStatus,
    /// Active calibration.
    pub calibration: CalibrationModel,
    /// Default processing.
    pub processing: ProcessingSettings,
}

/// Externally persisted settings bundle.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DefaultSettings {
    /// Exposure, gain and binning.
    pub camera: CameraSettings,
    /// ROI, or `None` for the default spectroscopy strip.
    pub roi: Option<RegionOfInterest>,
    /// Calibration.
    pub calibration: CalibrationModel,
    /// Processing defaults.
    pub processing: ProcessingSettings,
}

/// The acquisition-and-reduction pipeline for one camera.
pub struct Spectrometer {
    controller: CameraController,
    calibration: RwLock<CalibrationModel>,
    processing: RwLock<ProcessingSettings>,
    last_frame: RwLock<Option<Arc<RawFrame>>>,
}

impl Spectrometer {
    /// Create a disconnected spectrometer on top of `device`.
    pub fn new(device: Arc<dyn CameraDevice>, timing: CaptureTiming) -> Self {
        Self {
            controller: CameraController::new(device, timing),
            calibration: RwLock::new(CalibrationModel::default()),
            processing: RwLock::new(ProcessingSettings::default()),
            last_frame: RwLock::new(None),
        }
    }

    /// The underlying camera controller.
    pub fn controller(&self) -> &CameraController {
        &self.controller
    }

    /// Connect the camera. See [`CameraController::connect`].
    pub async fn connect(&self) -> Result<CameraInfo> {
        self.controller.connect().await
    }

    /// Disconnect the camera.
    pub async fn disconnect(&self) -> Result<()> {
        self.controller.disconnect().await
    }

    /// Set exposure (milliseconds) and gain together.
    pub async fn set_exposure(&self, exposure_ms: u64, gain: u32) -> Result<()> {
        self.controller.set_exposure(exposure_ms, gain).await
    }

    /// Replace the active ROI.
    pub async fn set_roi(&self, roi: RegionOfInterest) -> Result<()> {
        self.controller.set_roi(roi).await
    }

    /// Change the binning factor.
    pub async fn set_binning(&self, binning: u32) -> Result<()> {
        self.controller.set_binning(binning).await
    }

    /// Replace the calibration. Works in any connection state.
    pub async fn set_calibration(
        &self,
        coefficients: &[f64],
        laser_wavelength_nm: Option<f64>,
    ) -> Result<()> {
        let model = CalibrationModel::new(coefficients, laser_wavelength_nm)?;
        *self.calibration.write().await = model;
        tracing::info!(
            coefficients = ?model.coefficients(),
            laser_wavelength_nm = ?laser_wavelength_nm,
            "Calibration updated"
        );
        Ok(())
    }

    /// Active calibration.
    pub async fn calibration(&self) -> CalibrationModel {
        *self.calibration.read().await
    }

    /// Replace the default processing settings.
    pub async fn set_processing(&self, processing: ProcessingSettings) -> Result<()> {
        processing.validate()?;
        *self.processing.write().await = processing;
        Ok(())
    }

    /// Acquire a spectrum with the held ROI, calibration and baseline.
    pub async fn acquire_spectrum(
        &self,
        readout_mode: ReadoutMode,
        include_image: bool,
    ) -> Result<SpectrumResult> {
        self.acquire(AcquisitionRequest {
            readout_mode: Some(readout_mode),
            include_image,
            ..AcquisitionRequest::default()
        })
        .await
    }

    /// Acquire a spectrum.
    pub async fn acquire(&self, request: AcquisitionRequest) -> Result<SpectrumResult> {
        let processing = *self.processing.read().await;
        let readout_mode = request.readout_mode.unwrap_or(processing.readout_mode);
        let baseline = request.baseline.unwrap_or(processing.baseline);
        baseline.validate()?;
        let calibration = match request.calibration {
            Some(calibration) => calibration,
            None => *self.calibration.read().await,
        };

        let frame = self
            .controller
            .capture_with(request.roi, |settings, roi| {
                calibration.check_raman(roi.binned_width(settings.binning) as usize)
            })
            .await?;
        let frame = Arc::new(frame);

        let mut intensities = reduce(&frame, readout_mode)?;
        let wavelengths = calibration.wavelengths(intensities.len());
        baseline.apply(&mut intensities)?;
        let raman_shifts = match calibration.laser_wavelength_nm() {
            Some(_) => Some(calibration.raman_shifts(&wavelengths)?),
            None => None,
        };

        let metadata = frame.metadata().copied().ok_or_else(|| {
            SpectrometerError::InvalidFrame("captured frame carries no metadata".to_string())
        })?;
        let result = SpectrumResult {
            timestamp: metadata.captured_at,
            exposure_ms: metadata.settings.exposure.as_millis(),
            gain: metadata.settings.gain,
            binning: metadata.settings.binning,
            roi: metadata.roi,
            readout_mode,
            baseline,
            wavelengths,
            intensities,
            raman_shifts,
            image: request
                .include_image
                .then(|| ImageSnapshot::new(frame.clone())),
        };
        *self.last_frame.write().await = Some(frame);
        tracing::info!(
            points = result.len(),
            exposure_ms = result.exposure_ms,
            gain = result.gain,
            %readout_mode,
            %baseline,
            "Spectrum acquired"
        );
        Ok(result)
    }

    /// Capture a raw frame without reduction.
    pub async fn acquire_image(&self) -> Result<ImageSnapshot> {
        let frame = Arc::new(self.controller.capture().await?);
        *self.last_frame.write().await = Some(frame.clone());
        tracing::info!(width = frame.width(), height = frame.height(), "Image acquired");
        Ok(ImageSnapshot::new(frame))
    }

    /// Most recently captured frame, from either acquisition path.
    pub async fn last_image(&self) -> Option<ImageSnapshot> {
        self.last_frame.read().await.clone().map(ImageSnapshot::new)
    }

    /// Camera status plus calibration and processing.
    pub async fn status(&self) -> SpectrometerStatus {
        SpectrometerStatus {
            camera: self.controller.status(),
            calibration: *self.calibration.read().await,
            processing: *self.processing.read().await,
        }
    }

    /// Apply a persisted settings bundle.
    ///
    /// Camera settings go to the hardware when connected and are held for the
    /// next connect otherwise. Calibration and processing are only replaced once
    /// the camera part succeeded.
    pub async fn apply_defaults(&self, defaults: &DefaultSettings) -> Result<()> {
        defaults.processing.validate()?;
        let status = self.controller.status();
        match status.connection_state {
            ConnectionState::Connected => {
                let roi = defaults
                    .roi
                    .or(status.roi)
                    .ok_or(SpectrometerError::NotConnected)?;
                self.controller.configure(defaults.camera, roi).await?;
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                self.controller.preset(defaults.camera, defaults.roi).await?;
            }
        }
        *self.calibration.write().await = defaults.calibration;
        *self.processing.write().await = defaults.processing;
        tracing::info!(state = %status.connection_state, "Default settings applied");
        Ok(())
    }

    /// Snapshot of the current settings as a persistable bundle.
    pub async fn current_defaults(&self) -> DefaultSettings {
        let status = self.controller.status();
        DefaultSettings {
            camera: status.settings,
            roi: status.roi,
            calibration: *self.calibration.read().await,
            processing: *self.processing.read().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{FramePattern, SimulatedCamera, SimulatorOp};
    use std::time::Duration;

    fn fast_timing() -> CaptureTiming {
        CaptureTiming {
            connect_settle: Duration::ZERO,
            readout_margin: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            max_polls: 5,
        }
    }

    async fn connected(value: u16) -> (Arc<SimulatedCamera>, Spectrometer) {
        let camera = Arc::new(
            SimulatedCamera::with_sensor(200, 40).with_pattern(FramePattern::Constant { value }),
        );
        let spectrometer = Spectrometer::new(camera.clone(), fast_timing());
        spectrometer
            .apply_defaults(&DefaultSettings {
                camera: CameraSettings::new(2, 0, 1).unwrap(),
                ..DefaultSettings::default()
            })
            .await
            .unwrap();
        spectrometer.connect().await.unwrap();
        (camera, spectrometer)
    }

    #[tokio::test]
    async fn test_constant_frame_scenario() {
        let (_camera, spectrometer) = connected(500).await;
        let result = spectrometer
            .acquire(AcquisitionRequest {
                roi: Some(RegionOfInterest::new(0, 0, 100, 10)),
                ..AcquisitionRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(result.intensities, vec![500.0; 100]);
        assert_eq!(result.wavelengths.len(), 100);
        assert_eq!(result.wavelengths[42], 42.0);
        assert_eq!(result.exposure_ms, 2);
        assert!(result.raman_shifts.is_none());
        assert!(result.image.is_none());
    }

    #[tokio::test]
    async fn test_raman_shifts_follow_laser() {
        let (_camera, spectrometer) = connected(100).await;
        spectrometer
            .set_calibration(&[0.0, 0.1, 532.0], Some(532.0))
            .await
            .unwrap();
        let result = spectrometer
            .acquire_spectrum(ReadoutMode::Maximum, false)
            .await
            .unwrap();
        let shifts = result.raman_shifts.unwrap();
        assert_eq!(shifts.len(), result.wavelengths.len());
        assert_eq!(shifts[0], 0.0);
        // pixel 80 -> 540 nm
        assert_eq!(shifts[80], 278.0);
    }

    #[tokio::test]
    async fn test_invalid_baseline_aborts_before_capture() {
        let (camera, spectrometer) = connected(100).await;
        camera.clear_calls().await;
        let err = spectrometer
            .acquire(AcquisitionRequest {
                baseline: Some(Baseline::Polynomial { degree: 42 }),
                ..AcquisitionRequest::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(camera.hardware_calls().await, 0);
    }

    #[tokio::test]
    async fn test_failed_capture_returns_no_result() {
        let (camera, spectrometer) = connected(100).await;
        camera.fail_next(SimulatorOp::ReadFrame).await;
        let err = spectrometer
            .acquire_spectrum(ReadoutMode::Average, true)
            .await
            .unwrap_err();
        assert!(matches!(err, SpectrometerError::Device { operation: "read_frame", .. }));
        assert!(spectrometer.last_image().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_capture_keeps_held_roi() {
        let (camera, spectrometer) = connected(100).await;
        let before = spectrometer.status().await.camera.roi;
        assert_eq!(before, Some(RegionOfInterest::new(0, 15, 200, 10)));

        camera.fail_next(SimulatorOp::ReadFrame).await;
        let err = spectrometer
            .acquire(AcquisitionRequest {
                roi: Some(RegionOfInterest::new(0, 0, 100, 10)),
                ..AcquisitionRequest::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SpectrometerError::Device { operation: "read_frame", .. }));
        assert_eq!(spectrometer.status().await.camera.roi, before);
        assert!(spectrometer.last_image().await.is_none());
    }

    #[tokio::test]
    async fn test_unusable_raman_axis_rejected_before_capture() {
        let (camera, spectrometer) = connected(100).await;
        let earlier = spectrometer.acquire_image().await.unwrap();
        // identity axis puts pixel 0 at 0 nm
        spectrometer
            .set_calibration(&[0.0, 1.0, 0.0], Some(532.0))
            .await
            .unwrap();
        camera.clear_calls().await;

        let err = spectrometer
            .acquire_spectrum(ReadoutMode::Average, true)
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(camera.hardware_calls().await, 0);
        assert_eq!(camera.frames_read().await, 1);
        let last = spectrometer.last_image().await.unwrap();
        assert_eq!(last.frame(), earlier.frame());

        // An axis starting above 0 nm is accepted
        spectrometer
            .set_calibration(&[0.0, 1.0, 100.0], Some(532.0))
            .await
            .unwrap();
        assert!(spectrometer
            .acquire_spectrum(ReadoutMode::Average, false)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_image_snapshot_encodes_png() {
        let (_camera, spectrometer) = connected(1234).await;
        let result = spectrometer
            .acquire_spectrum(ReadoutMode::Average, true)
            .await
            .unwrap();
        let image = result.image.unwrap();
        let png = image.to_png().unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");

        let json = serde_json::to_value(&image).unwrap();
        assert_eq!(json["width"], 200);
        assert!(json["png_base64"].as_str().unwrap().starts_with("iVBORw0KGgo"));

        let last = spectrometer.last_image().await.unwrap();
        assert_eq!(last.frame(), image.frame());
    }

    #[tokio::test]
    async fn test_calibration_survives_reconnect() {
        let (_camera, spectrometer) = connected(100).await;
        spectrometer
            .set_calibration(&[0.5, 400.0], Some(785.0))
            .await
            .unwrap();
        spectrometer.disconnect().await.unwrap();
        spectrometer.connect().await.unwrap();
        let calibration = spectrometer.calibration().await;
        assert_eq!(calibration.coefficients(), [0.0, 0.5, 400.0]);
        assert_eq!(calibration.laser_wavelength_nm(), Some(785.0));
    }

    #[tokio::test]
    async fn test_status_serializes_flat() {
        let (_camera, spectrometer) = connected(100).await;
        let json = serde_json::to_value(spectrometer.status().await).unwrap();
        assert_eq!(json["connection_state"], "connected");
        assert_eq!(json["settings"]["exposure_ms"], 2);
        assert_eq!(json["processing"]["readout_mode"], "average");
        assert!(json["calibration"]["coefficients"].is_array());
    }

    #[tokio::test]
    async fn test_defaults_round_trip() {
        let (_camera, spectrometer) = connected(100).await;
        let defaults = DefaultSettings {
            camera: CameraSettings::new(3, 50, 2).unwrap(),
            roi: Some(RegionOfInterest::new(0, 10, 100, 20)),
            calibration: CalibrationModel::new(&[0.0, 0.5, 400.0], None).unwrap(),
            processing: ProcessingSettings {
                readout_mode: ReadoutMode::Maximum,
                baseline: Baseline::Linear,
            },
        };
        spectrometer.apply_defaults(&defaults).await.unwrap();
        assert_eq!(spectrometer.current_defaults().await, defaults);
    }
}
