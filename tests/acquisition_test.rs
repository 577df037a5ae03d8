//! End-to-end acquisition tests against the simulated camera.

use spectro_daq::camera::{EmissionLine, FramePattern, SimulatorOp};
use spectro_daq::{
    AcquisitionRequest, Baseline, CalibrationModel, CameraSettings, CaptureTiming,
    ConnectionState, DefaultSettings, ReadoutMode, RegionOfInterest, SimulatedCamera,
    Spectrometer, SpectrometerError,
};
use std::sync::Arc;
use std::time::Duration;

fn fast_timing() -> CaptureTiming {
    CaptureTiming {
        connect_settle: Duration::ZERO,
        readout_margin: Duration::from_millis(1),
        poll_interval: Duration::from_millis(1),
        max_polls: 5,
    }
}

fn single_line_camera() -> SimulatedCamera {
    SimulatedCamera::with_sensor(400, 40).with_pattern(FramePattern::Spectrum {
        lines: vec![EmissionLine {
            column: 250.0,
            sigma: 2.0,
            counts_per_ms: 100.0,
        }],
        bias: 100.0,
        background_per_ms: 0.0,
        noise: 0.0,
        slit_sigma_rows: 10.0,
    })
}

async fn connected_spectrometer(
    camera: SimulatedCamera,
    exposure_ms: u64,
) -> (Arc<SimulatedCamera>, Arc<Spectrometer>) {
    let camera = Arc::new(camera);
    let spectrometer = Arc::new(Spectrometer::new(camera.clone(), fast_timing()));
    spectrometer
        .apply_defaults(&DefaultSettings {
            camera: CameraSettings::new(exposure_ms, 0, 1).unwrap(),
            ..DefaultSettings::default()
        })
        .await
        .unwrap();
    spectrometer.connect().await.unwrap();
    (camera, spectrometer)
}

fn peak_index(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap()
}

#[tokio::test]
async fn test_emission_line_lands_at_calibrated_wavelength() {
    let (_camera, spectrometer) = connected_spectrometer(single_line_camera(), 10).await;
    spectrometer
        .set_calibration(&[0.0, 0.5, 400.0], Some(500.0))
        .await
        .unwrap();

    let result = spectrometer
        .acquire_spectrum(ReadoutMode::Average, false)
        .await
        .unwrap();

    assert_eq!(result.len(), 400);
    assert_eq!(result.wavelengths.len(), result.intensities.len());
    let peak = peak_index(&result.intensities);
    assert!((249..=250).contains(&peak), "peak at column {peak}");
    assert!((524.5..=525.0).contains(&result.wavelengths[peak]));

    // Far from the line only the bias remains
    assert!((result.intensities[0] - 100.0).abs() < 1.0);

    let shifts = result.raman_shifts.unwrap();
    assert_eq!(shifts.len(), 400);
    // 400 nm is anti-Stokes relative to a 500 nm laser
    assert!(shifts[0] < 0.0);
}

#[tokio::test]
async fn test_maximum_mode_exceeds_average() {
    let (_camera, spectrometer) = connected_spectrometer(single_line_camera(), 10).await;
    let average = spectrometer
        .acquire_spectrum(ReadoutMode::Average, false)
        .await
        .unwrap();
    let maximum = spectrometer
        .acquire_spectrum(ReadoutMode::Maximum, false)
        .await
        .unwrap();

    let peak = peak_index(&maximum.intensities);
    assert!(maximum.intensities[peak] > average.intensities[peak]);
    assert_eq!(maximum.readout_mode, ReadoutMode::Maximum);
}

#[tokio::test]
async fn test_linear_baseline_removes_bias() {
    let (_camera, spectrometer) = connected_spectrometer(single_line_camera(), 10).await;
    let result = spectrometer
        .acquire(AcquisitionRequest {
            baseline: Some(Baseline::Linear),
            ..AcquisitionRequest::default()
        })
        .await
        .unwrap();

    assert!(result.intensities.iter().all(|&v| v >= 0.0));
    assert_eq!(result.intensities[0], 0.0);
    assert!(result.intensities[peak_index(&result.intensities)] > 100.0);
    assert_eq!(result.baseline, Baseline::Linear);
}

#[tokio::test]
async fn test_request_roi_and_binning_shape_the_spectrum() {
    let (_camera, spectrometer) = connected_spectrometer(single_line_camera(), 5).await;
    spectrometer.set_binning(2).await.unwrap();

    let result = spectrometer
        .acquire(AcquisitionRequest {
            roi: Some(RegionOfInterest::new(100, 10, 200, 20)),
            calibration: Some(CalibrationModel::new(&[0.0, 1.0, 0.0], None).unwrap()),
            ..AcquisitionRequest::default()
        })
        .await
        .unwrap();

    // roi.width / binning
    assert_eq!(result.len(), 100);
    assert_eq!(result.binning, 2);
    assert_eq!(result.roi, RegionOfInterest::new(100, 10, 200, 20));
    assert_eq!(
        spectrometer.status().await.camera.roi,
        Some(RegionOfInterest::new(100, 10, 200, 20))
    );
}

#[tokio::test]
async fn test_roi_past_sensor_edge_is_rejected() {
    let (camera, spectrometer) = connected_spectrometer(single_line_camera(), 5).await;
    let held = spectrometer.status().await.camera.roi;
    camera.clear_calls().await;

    let err = spectrometer
        .set_roi(RegionOfInterest::new(300, 0, 200, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, SpectrometerError::InvalidParameter(_)));
    assert_eq!(spectrometer.status().await.camera.roi, held);
    assert!(camera.calls().await.is_empty());
}

#[tokio::test]
async fn test_acquire_without_connection() {
    let camera = Arc::new(single_line_camera());
    let spectrometer = Spectrometer::new(camera.clone(), fast_timing());

    let err = spectrometer
        .acquire_spectrum(ReadoutMode::Average, true)
        .await
        .unwrap_err();
    assert!(matches!(err, SpectrometerError::NotConnected));
    assert_eq!(camera.hardware_calls().await, 0);

    // Calibration does not need the camera
    assert!(spectrometer
        .set_calibration(&[0.0, 0.5, 400.0], None)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_capture_timeout_propagates() {
    let (camera, spectrometer) = connected_spectrometer(single_line_camera(), 2).await;
    camera.set_stalled(true).await;

    let err = spectrometer
        .acquire_spectrum(ReadoutMode::Average, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SpectrometerError::CaptureTimeout { polls: 5, .. }
    ));
    assert_eq!(
        spectrometer.status().await.camera.connection_state,
        ConnectionState::Connected
    );

    camera.set_stalled(false).await;
    assert!(spectrometer
        .acquire_spectrum(ReadoutMode::Average, false)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_configuration_queues_behind_capture() {
    let (_camera, spectrometer) = connected_spectrometer(single_line_camera(), 80).await;

    let acquisition = tokio::spawn({
        let spectrometer = spectrometer.clone();
        async move {
            spectrometer
                .acquire_spectrum(ReadoutMode::Average, false)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Status is published, not locked
    let status = tokio::time::timeout(Duration::from_millis(10), spectrometer.status())
        .await
        .expect("status blocked behind capture");
    assert_eq!(status.camera.connection_state, ConnectionState::Connected);

    spectrometer.set_exposure(5, 10).await.unwrap();
    let result = acquisition.await.unwrap().unwrap();
    assert_eq!(result.exposure_ms, 80);
    assert_eq!(result.gain, 0);

    let status = spectrometer.status().await;
    assert_eq!(status.camera.settings.exposure.as_millis(), 5);
    assert_eq!(status.camera.settings.gain, 10);
}

#[tokio::test]
async fn test_image_acquisition_keeps_last_frame() {
    let (_camera, spectrometer) = connected_spectrometer(single_line_camera(), 5).await;
    assert!(spectrometer.last_image().await.is_none());

    let snapshot = spectrometer.acquire_image().await.unwrap();
    assert_eq!((snapshot.width(), snapshot.height()), (400, 10));
    let last = spectrometer.last_image().await.unwrap();
    assert_eq!(last.frame(), snapshot.frame());
    assert!(!snapshot.to_png_base64().unwrap().is_empty());
}

#[tokio::test]
async fn test_gain_write_failure_leaves_settings_unchanged() {
    let (camera, spectrometer) = connected_spectrometer(single_line_camera(), 5).await;
    let before = spectrometer.status().await.camera.settings;

    camera.fail_next(SimulatorOp::SetGain).await;
    assert!(spectrometer.set_exposure(50, 100).await.is_err());
    assert_eq!(spectrometer.status().await.camera.settings, before);
    assert_eq!(camera.registers().await.exposure_us, 5_000);
}

#[cfg(feature = "storage_csv")]
#[tokio::test]
async fn test_csv_export() {
    use spectro_daq::storage::CsvWriter;

    let (_camera, spectrometer) = connected_spectrometer(single_line_camera(), 5).await;
    spectrometer
        .set_calibration(&[0.0, 0.5, 400.0], Some(532.0))
        .await
        .unwrap();
    let result = spectrometer
        .acquire_spectrum(ReadoutMode::Average, false)
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spectra").join("spectrum.csv");
    CsvWriter::new(&path).write(&result).unwrap();

    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .from_path(&path)
        .unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(
        headers.iter().collect::<Vec<_>>(),
        vec!["wavelength_nm", "intensity", "raman_shift_cm1"]
    );
    let rows: Vec<(f64, f64, f64)> = reader.deserialize().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), result.len());
    assert_eq!(rows[0].0, 400.0);
    assert_eq!(rows[0].1, result.intensities[0]);
}
