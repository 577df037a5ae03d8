//! Camera connection and configuration state machine.
//!
//! `CameraController` wraps a [`CameraDevice`] and owns everything the
//! spectrometer knows about the camera: connection state, sensor description,
//! held settings and the active ROI.
//!
//! ## Serialization
//!
//! One fair `tokio::sync::Mutex` guards the held state and is kept for the whole
//! duration of every hardware operation, including a capture. A second capture
//! or a configuration call issued mid-capture therefore queues (FIFO) until the
//! first one finishes. `status()` never takes that lock: every committed change
//! is published through a `watch` channel and read from there.
//!
//! ## Configuration commits
//!
//! Configuration is validate → apply → commit. Validation happens before any
//! hardware call. Hardware writes are issued in the order exposure, gain,
//! ROI/binning and only for values that actually change; if one write fails, the
//! writes already made are reverted in reverse order and the held state is left
//! untouched.

use super::device::{CameraDevice, ExposureStatus};
use super::{
    CameraInfo, CameraSettings, ConnectionState, Exposure, FrameMetadata, RawFrame,
    RegionOfInterest,
};
use crate::error::{Result, SpectrometerError};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Timing constants for connect and capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTiming {
    /// Driver warm-up between opening the device and applying settings.
    pub connect_settle: Duration,
    /// Added to the exposure time before the first status poll.
    pub readout_margin: Duration,
    /// Delay between exposure status polls.
    pub poll_interval: Duration,
    /// Status polls issued before giving up with `CaptureTimeout`.
    pub max_polls: u32,
}

impl Default for CaptureTiming {
    fn default() -> Self {
        Self {
            connect_settle: Duration::from_millis(1500),
            readout_margin: Duration::from_millis(100),
            poll_interval: Duration::from_millis(50),
            max_polls: 20,
        }
    }
}

/// Snapshot of the controller published after every committed change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    /// Connection lifecycle state.
    pub connection_state: ConnectionState,
    /// Sensor description while a device handle is held.
    pub camera: Option<CameraInfo>,
    /// Held exposure, gain and binning.
    pub settings: CameraSettings,
    /// Held ROI, if one has been chosen.
    pub roi: Option<RegionOfInterest>,
}

struct HeldState {
    connection: ConnectionState,
    /// Bumped on every connect and disconnect so a settling connect can detect
    /// that it was overtaken.
    epoch: u64,
    info: Option<CameraInfo>,
    settings: CameraSettings,
    roi: Option<RegionOfInterest>,
}

impl HeldState {
    fn snapshot(&self) -> ControllerStatus {
        ControllerStatus {
            connection_state: self.connection,
            camera: self.info.clone(),
            settings: self.settings,
            roi: self.roi,
        }
    }

    fn connected_info(&self) -> Result<&CameraInfo> {
        match (&self.connection, &self.info) {
            (ConnectionState::Connected, Some(info)) => Ok(info),
            _ => Err(SpectrometerError::NotConnected),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplyStep {
    Exposure,
    Gain,
    Roi,
}

/// Connection/configuration state machine for a single camera.
pub struct CameraController {
    device: Arc<dyn CameraDevice>,
    timing: CaptureTiming,
    state: Mutex<HeldState>,
    status_tx: watch::Sender<ControllerStatus>,
}

impl CameraController {
    /// Create a disconnected controller with default settings.
    pub fn new(device: Arc<dyn CameraDevice>, timing: CaptureTiming) -> Self {
        let state = HeldState {
            connection: ConnectionState::Disconnected,
            epoch: 0,
            info: None,
            settings: CameraSettings::default(),
            roi: None,
        };
        let (status_tx, _) = watch::channel(state.snapshot());
        Self {
            device,
            timing,
            state: Mutex::new(state),
            status_tx,
        }
    }

    /// Timing constants in use.
    pub fn timing(&self) -> CaptureTiming {
        self.timing
    }

    /// Latest published snapshot. Never waits for an in-flight operation.
    pub fn status(&self) -> ControllerStatus {
        self.status_tx.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status_tx.subscribe()
    }

    /// Sensor description, if connected or connecting.
    pub fn info(&self) -> Option<CameraInfo> {
        self.status_tx.borrow().camera.clone()
    }

    fn publish(&self, state: &HeldState) {
        self.status_tx.send_replace(state.snapshot());
    }

    /// Replace the settings applied by the next `connect()`.
    ///
    /// Only allowed while disconnected. Sensor-dependent checks (supported bins,
    /// ROI bounds) happen at connect time, where an unusable binning falls back
    /// to 1 and an unusable ROI to the default spectroscopy strip.
    pub async fn preset(
        &self,
        settings: CameraSettings,
        roi: Option<RegionOfInterest>,
    ) -> Result<()> {
        settings.validate()?;
        let mut st = self.state.lock().await;
        if st.connection != ConnectionState::Disconnected {
            return Err(SpectrometerError::AlreadyConnected);
        }
        st.settings = settings;
        st.roi = roi;
        self.publish(&st);
        Ok(())
    }

    /// Open the camera, let the driver settle and apply the held settings.
    pub async fn connect(&self) -> Result<CameraInfo> {
        let epoch = {
            let mut st = self.state.lock().await;
            if st.connection != ConnectionState::Disconnected {
                return Err(SpectrometerError::AlreadyConnected);
            }
            let info = self
                .device
                .open()
                .await
                .map_err(|e| SpectrometerError::device("open", e))?;
            tracing::info!(
                camera = %info.name,
                width = info.max_width,
                height = info.max_height,
                "Camera opened, waiting for driver to settle"
            );
            st.connection = ConnectionState::Connecting;
            st.info = Some(info);
            st.epoch += 1;
            self.publish(&st);
            st.epoch
        };

        // Lock is released so disconnect() can abort the settle
        if !self.timing.connect_settle.is_zero() {
            tokio::time::sleep(self.timing.connect_settle).await;
        }

        let mut st = self.state.lock().await;
        if st.epoch != epoch || st.connection != ConnectionState::Connecting {
            tracing::warn!("Connect aborted by disconnect during driver settle");
            return Err(SpectrometerError::ConnectionAborted);
        }
        let Some(info) = st.info.clone() else {
            return Err(SpectrometerError::ConnectionAborted);
        };

        let (settings, roi) = match Self::initial_configuration(&info, st.settings, st.roi) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::error!(error = %err, "No usable ROI for this sensor");
                self.abandon_connect(&mut st).await;
                return Err(err);
            }
        };

        for step in [ApplyStep::Exposure, ApplyStep::Gain, ApplyStep::Roi] {
            if let Err(err) = self.write(step, &settings, &roi).await {
                tracing::error!(error = %err, "Initial camera configuration failed");
                self.abandon_connect(&mut st).await;
                return Err(err);
            }
        }

        st.settings = settings;
        st.roi = Some(roi);
        st.connection = ConnectionState::Connected;
        self.publish(&st);
        tracing::info!(
            camera = %info.name,
            exposure = %settings.exposure,
            gain = settings.gain,
            binning = settings.binning,
            %roi,
            "Camera connected"
        );
        Ok(info)
    }

    /// Settings and ROI written by `connect()`.
    ///
    /// Falls back to binning 1 when the held binning is unsupported or leaves no
    /// room for an aligned default strip, and fails when even an unbinned strip
    /// does not fit the sensor's alignment grid.
    fn initial_configuration(
        info: &CameraInfo,
        held: CameraSettings,
        held_roi: Option<RegionOfInterest>,
    ) -> Result<(CameraSettings, RegionOfInterest)> {
        let mut settings = held;
        if !info.supports_binning(settings.binning) {
            tracing::warn!(
                binning = settings.binning,
                "Held binning not supported by sensor, using 1"
            );
            settings.binning = 1;
        }
        if let Some(roi) = held_roi {
            if roi.validate(info, settings.binning).is_ok() {
                return Ok((settings, roi));
            }
        }

        let roi = RegionOfInterest::default_spectroscopy(info, settings.binning);
        let roi = match roi.validate(info, settings.binning) {
            Ok(()) => roi,
            Err(_) if settings.binning != 1 => {
                tracing::warn!(
                    binning = settings.binning,
                    "Sensor too small for binned default ROI, using binning 1"
                );
                settings.binning = 1;
                let roi = RegionOfInterest::default_spectroscopy(info, 1);
                roi.validate(info, 1)?;
                roi
            }
            Err(err) => return Err(err),
        };
        if held_roi.is_some() {
            tracing::warn!(%roi, "Held ROI does not fit sensor, using default");
        }
        Ok((settings, roi))
    }

    async fn abandon_connect(&self, st: &mut HeldState) {
        if let Err(close_err) = self.device.close().await {
            tracing::warn!(error = %close_err, "Camera close after failed connect also failed");
        }
        st.connection = ConnectionState::Disconnected;
        st.info = None;
        st.epoch += 1;
        self.publish(st);
    }

    /// Release the camera. A no-op when already disconnected.
    ///
    /// A failing device close is logged and the controller still ends up
    /// disconnected. Held settings and ROI are kept for the next connect.
    pub async fn disconnect(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        if st.connection == ConnectionState::Disconnected {
            return Ok(());
        }
        if let Err(err) = self.device.close().await {
            tracing::warn!(error = %err, "Camera close failed, releasing handle anyway");
        }
        st.connection = ConnectionState::Disconnected;
        st.info = None;
        st.epoch += 1;
        self.publish(&st);
        tracing::info!("Camera disconnected");
        Ok(())
    }

    /// Set exposure (milliseconds) and gain together.
    pub async fn set_exposure(&self, exposure_ms: u64, gain: u32) -> Result<()> {
        let mut st = self.state.lock().await;
        st.connected_info()?;
        let settings = CameraSettings {
            exposure: Exposure::from_millis(exposure_ms)?,
            gain,
            ..st.settings
        };
        let roi = Self::held_roi(&st)?;
        self.configure_locked(&mut st, settings, roi).await
    }

    /// Replace the active ROI.
    pub async fn set_roi(&self, roi: RegionOfInterest) -> Result<()> {
        let mut st = self.state.lock().await;
        st.connected_info()?;
        let settings = st.settings;
        self.configure_locked(&mut st, settings, roi).await
    }

    /// Change the binning factor, keeping the active ROI.
    pub async fn set_binning(&self, binning: u32) -> Result<()> {
        let mut st = self.state.lock().await;
        st.connected_info()?;
        let settings = CameraSettings {
            binning,
            ..st.settings
        };
        let roi = Self::held_roi(&st)?;
        self.configure_locked(&mut st, settings, roi).await
    }

    /// Apply settings and ROI as one atomic change.
    pub async fn configure(&self, settings: CameraSettings, roi: RegionOfInterest) -> Result<()> {
        let mut st = self.state.lock().await;
        self.configure_locked(&mut st, settings, roi).await
    }

    fn held_roi(st: &HeldState) -> Result<RegionOfInterest> {
        st.roi.ok_or(SpectrometerError::NotConnected)
    }

    async fn configure_locked(
        &self,
        st: &mut HeldState,
        settings: CameraSettings,
        roi: RegionOfInterest,
    ) -> Result<()> {
        let info = st.connected_info()?;
        settings.validate()?;
        if !info.supports_binning(settings.binning) {
            return Err(SpectrometerError::InvalidParameter(format!(
                "binning {} not supported, sensor accepts {:?}",
                settings.binning, info.supported_bins
            )));
        }
        roi.validate(info, settings.binning)?;

        let previous = st.settings;
        let previous_roi = st.roi.unwrap_or(roi);

        let mut steps = Vec::with_capacity(3);
        if settings.exposure != previous.exposure {
            steps.push(ApplyStep::Exposure);
        }
        if settings.gain != previous.gain {
            steps.push(ApplyStep::Gain);
        }
        if st.roi != Some(roi) || settings.binning != previous.binning {
            steps.push(ApplyStep::Roi);
        }

        let mut applied = Vec::with_capacity(steps.len());
        for step in steps {
            if let Err(err) = self.write(step, &settings, &roi).await {
                for done in applied.iter().rev() {
                    if let Err(rollback_err) = self.write(*done, &previous, &previous_roi).await {
                        tracing::warn!(
                            step = ?done,
                            error = %rollback_err,
                            "Rollback of camera setting failed"
                        );
                    }
                }
                return Err(err);
            }
            applied.push(step);
        }

        st.settings = settings;
        st.roi = Some(roi);
        self.publish(st);
        tracing::debug!(
            exposure = %settings.exposure,
            gain = settings.gain,
            binning = settings.binning,
            %roi,
            "Camera configuration committed"
        );
        Ok(())
    }

    async fn write(
        &self,
        step: ApplyStep,
        settings: &CameraSettings,
        roi: &RegionOfInterest,
    ) -> Result<()> {
        match step {
            ApplyStep::Exposure => self
                .device
                .set_exposure_us(settings.exposure.as_micros())
                .await
                .map_err(|e| SpectrometerError::device("set_exposure", e)),
            ApplyStep::Gain => self
                .device
                .set_gain(settings.gain)
                .await
                .map_err(|e| SpectrometerError::device("set_gain", e)),
            ApplyStep::Roi => self
                .device
                .set_roi(roi, settings.binning)
                .await
                .map_err(|e| SpectrometerError::device("set_roi", e)),
        }
    }

    /// Expose one frame with the held settings.
    ///
    /// Waits `exposure + readout_margin`, then polls exposure status up to
    /// `max_polls` times. The lock is held throughout, so other operations queue.
    pub async fn capture(&self) -> Result<RawFrame> {
        self.capture_with(None, |_, _| Ok(())).await
    }

    /// Expose one frame, optionally on a different ROI, as a single locked step.
    ///
    /// `preflight` sees the settings and ROI the frame will be taken with and
    /// runs before any hardware call; an error from it aborts the capture. A
    /// requested ROI stays active after a successful capture. If the capture
    /// fails, the previous ROI is written back.
    pub async fn capture_with<F>(
        &self,
        roi: Option<RegionOfInterest>,
        preflight: F,
    ) -> Result<RawFrame>
    where
        F: FnOnce(&CameraSettings, &RegionOfInterest) -> Result<()> + Send,
    {
        let mut st = self.state.lock().await;
        let info = st.connected_info()?;
        let settings = st.settings;
        let previous_roi = Self::held_roi(&st)?;
        let target = roi.unwrap_or(previous_roi);
        target.validate(info, settings.binning)?;
        preflight(&settings, &target)?;

        let switched = target != previous_roi;
        if switched {
            self.configure_locked(&mut st, settings, target).await?;
        }
        let captured = self.capture_locked(settings, target).await;
        if captured.is_err() && switched {
            match self.configure_locked(&mut st, settings, previous_roi).await {
                Ok(()) => tracing::debug!(roi = %previous_roi, "Restored ROI after failed capture"),
                Err(err) => tracing::warn!(error = %err, "Restoring ROI after failed capture failed"),
            }
        }
        captured
    }

    async fn capture_locked(
        &self,
        settings: CameraSettings,
        roi: RegionOfInterest,
    ) -> Result<RawFrame> {
        self.device
            .start_exposure()
            .await
            .map_err(|e| SpectrometerError::device("start_exposure", e))?;

        let mut waited = settings.exposure.as_duration() + self.timing.readout_margin;
        tokio::time::sleep(waited).await;

        let max_polls = self.timing.max_polls;
        for poll in 1..=max_polls {
            let status = self
                .device
                .exposure_status()
                .await
                .map_err(|e| SpectrometerError::device("exposure_status", e))?;
            match status {
                ExposureStatus::Success => {
                    tracing::trace!(poll, "Exposure complete");
                    return self.read_frame(settings, roi).await;
                }
                ExposureStatus::Failed => {
                    if let Err(err) = self.device.abort_exposure().await {
                        tracing::warn!(error = %err, "Abort after failed exposure failed");
                    }
                    return Err(SpectrometerError::Device {
                        operation: "capture",
                        message: "sensor reported exposure failure".to_string(),
                    });
                }
                ExposureStatus::Idle | ExposureStatus::Working => {}
            }
            if poll < max_polls {
                tokio::time::sleep(self.timing.poll_interval).await;
                waited += self.timing.poll_interval;
            }
        }

        if let Err(err) = self.device.abort_exposure().await {
            tracing::warn!(error = %err, "Abort after capture timeout failed");
        }
        tracing::error!(polls = max_polls, ?waited, "Capture timed out");
        Err(SpectrometerError::CaptureTimeout {
            polls: max_polls,
            waited,
        })
    }

    async fn read_frame(
        &self,
        settings: CameraSettings,
        roi: RegionOfInterest,
    ) -> Result<RawFrame> {
        let data = match self.device.read_frame().await {
            Ok(data) => data,
            Err(err) => {
                if let Err(abort_err) = self.device.abort_exposure().await {
                    tracing::warn!(error = %abort_err, "Abort after failed readout failed");
                }
                return Err(SpectrometerError::device("read_frame", err));
            }
        };
        let frame = RawFrame::new(
            roi.binned_width(settings.binning),
            roi.binned_height(settings.binning),
            data,
        )?;
        Ok(frame.with_metadata(FrameMetadata {
            settings,
            roi,
            captured_at: Utc::now(),
        }))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
