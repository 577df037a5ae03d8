//! Simulated camera
//!
//! Provides a `CameraDevice` that behaves like a monochrome CMOS spectrometer
//! camera without any hardware attached. All waiting uses tokio time, never
//! `std::thread::sleep`.
//!
//! # Behaviour
//!
//! - Exposure completes once the programmed exposure time has elapsed
//! - Frames are sized to the programmed ROI after binning
//! - Frame content follows a [`FramePattern`]: a constant level, or a synthetic
//!   emission-line spectrum projected as a horizontal band with uniform noise
//! - Every adapter call is recorded so tests can assert on hardware traffic
//! - Failures can be injected per operation, exposures can be stalled to
//!   exercise the capture timeout path, and the sensor can report a failed
//!   exposure

use super::device::{CameraDevice, ExposureStatus};
use super::{CameraInfo, RegionOfInterest};
use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Adapter operations, used for call recording and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatorOp {
    /// `open`
    Open,
    /// `close`
    Close,
    /// `set_exposure_us`
    SetExposure,
    /// `set_gain`
    SetGain,
    /// `set_roi`
    SetRoi,
    /// `start_exposure`
    StartExposure,
    /// `exposure_status`
    ExposureStatus,
    /// `abort_exposure`
    AbortExposure,
    /// `read_frame`
    ReadFrame,
}

/// A Gaussian emission line on the simulated spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionLine {
    /// Centre column in unbinned sensor pixels.
    pub column: f64,
    /// Gaussian sigma in pixels.
    pub sigma: f64,
    /// Peak signal in counts per millisecond of exposure at unity gain.
    pub counts_per_ms: f64,
}

/// What the simulated sensor sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FramePattern {
    /// Every sample has the same value, regardless of exposure and gain.
    Constant {
        /// Sample value.
        value: u16,
    },
    /// Emission lines dispersed along the columns, focused into a horizontal band.
    Spectrum {
        /// Lines to render.
        lines: Vec<EmissionLine>,
        /// Constant readout offset in counts.
        bias: f64,
        /// Flat continuum in counts per millisecond.
        background_per_ms: f64,
        /// Half-width of the uniform noise added to every sample.
        noise: f64,
        /// Vertical Gaussian sigma of the band, in sensor rows.
        slit_sigma_rows: f64,
    },
}

impl Default for FramePattern {
    fn default() -> Self {
        let line = |column: f64, counts_per_ms: f64| EmissionLine {
            column,
            sigma: 3.5,
            counts_per_ms,
        };
        FramePattern::Spectrum {
            lines: vec![
                line(820.0, 180.0),
                line(1410.0, 95.0),
                line(2050.0, 300.0),
                line(2300.0, 140.0),
                line(3150.0, 220.0),
                line(4020.0, 60.0),
                line(4700.0, 120.0),
            ],
            bias: 200.0,
            background_per_ms: 0.4,
            noise: 12.0,
            slit_sigma_rows: 40.0,
        }
    }
}

/// Register contents of the simulated sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimRegisters {
    /// Exposure in microseconds.
    pub exposure_us: u64,
    /// Analog gain.
    pub gain: u32,
    /// Readout window.
    pub roi: RegionOfInterest,
    /// Binning factor.
    pub binning: u32,
}

struct SimState {
    open: bool,
    registers: SimRegisters,
    exposure_started: Option<Instant>,
    frames_read: u64,
    stalled: bool,
    exposure_failed: bool,
    failures: HashSet<SimulatorOp>,
    calls: Vec<SimulatorOp>,
}

impl SimState {
    /// Record a call and fail it if a fault was injected or the handle is closed.
    fn record(&mut self, op: SimulatorOp) -> Result<()> {
        self.calls.push(op);
        if self.failures.remove(&op) {
            bail!("injected {op:?} failure");
        }
        if op != SimulatorOp::Open && !self.open {
            bail!("camera handle not open");
        }
        Ok(())
    }

    fn exposure_done(&self) -> bool {
        self.exposure_started.map_or(false, |started| {
            started.elapsed() >= Duration::from_micros(self.registers.exposure_us)
        })
    }
}

/// Camera simulator implementing [`CameraDevice`].
pub struct SimulatedCamera {
    info: CameraInfo,
    pattern: FramePattern,
    state: Mutex<SimState>,
}

/// Sensor description of a ZWO ASI183MM, the camera the simulator models by default.
#[must_use]
pub fn asi183mm_info() -> CameraInfo {
    CameraInfo {
        name: "ZWO ASI183MM Pro (simulated)".to_string(),
        camera_id: 0,
        max_width: 5496,
        max_height: 3672,
        pixel_size_um: 2.4,
        supported_bins: vec![1, 2, 3, 4],
        bit_depth: 12,
        is_color: false,
        width_step: 8,
        height_step: 2,
    }
}

impl SimulatedCamera {
    /// Simulated ASI183MM with the default emission-line spectrum.
    pub fn new() -> Self {
        Self::with_info(asi183mm_info())
    }

    /// Simulator with a custom sensor description.
    pub fn with_info(info: CameraInfo) -> Self {
        let registers = SimRegisters {
            exposure_us: 100_000,
            gain: 0,
            roi: RegionOfInterest::full_sensor(&info),
            binning: 1,
        };
        Self {
            info,
            pattern: FramePattern::default(),
            state: Mutex::new(SimState {
                open: false,
                registers,
                exposure_started: None,
                frames_read: 0,
                stalled: false,
                exposure_failed: false,
                failures: HashSet::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// Small unaligned sensor, handy for tests.
    pub fn with_sensor(width: u32, height: u32) -> Self {
        Self::with_info(CameraInfo {
            name: "Simulated test sensor".to_string(),
            max_width: width,
            max_height: height,
            width_step: 1,
            height_step: 1,
            ..asi183mm_info()
        })
    }

    /// Replace the frame pattern.
    #[must_use]
    pub fn with_pattern(mut self, pattern: FramePattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Sensor description returned by `open`.
    pub fn info(&self) -> &CameraInfo {
        &self.info
    }

    /// Make the next call of `op` fail.
    pub async fn fail_next(&self, op: SimulatorOp) {
        self.state.lock().await.failures.insert(op);
    }

    /// Keep exposures in the `Working` state forever.
    pub async fn set_stalled(&self, stalled: bool) {
        self.state.lock().await.stalled = stalled;
    }

    /// Make started exposures report `Failed`, as a sensor fault would.
    pub async fn set_exposure_failed(&self, failed: bool) {
        self.state.lock().await.exposure_failed = failed;
    }

    /// Every adapter call so far, in order.
    pub async fn calls(&self) -> Vec<SimulatorOp> {
        self.state.lock().await.calls.clone()
    }

    /// Number of adapter calls so far.
    pub async fn hardware_calls(&self) -> usize {
        self.state.lock().await.calls.len()
    }

    /// Forget recorded calls.
    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Number of frames pulled.
    pub async fn frames_read(&self) -> u64 {
        self.state.lock().await.frames_read
    }

    /// Whether the native handle is open.
    pub async fn is_open(&self) -> bool {
        self.state.lock().await.open
    }

    /// Current register contents.
    pub async fn registers(&self) -> SimRegisters {
        self.state.lock().await.registers
    }

    fn render(&self, registers: &SimRegisters) -> Vec<u16> {
        let binning = registers.binning.max(1);
        let width = registers.roi.binned_width(binning) as usize;
        let height = registers.roi.binned_height(binning) as usize;

        match &self.pattern {
            FramePattern::Constant { value } => vec![*value; width * height],
            FramePattern::Spectrum {
                lines,
                bias,
                background_per_ms,
                noise,
                slit_sigma_rows,
            } => {
                // Binned pixels sample the centre of their sensor block
                let centre = |start: u32, index: usize| {
                    f64::from(start) + (index as f64 + 0.5) * f64::from(binning)
                };
                let columns: Vec<f64> = (0..width)
                    .map(|bx| {
                        let x = centre(registers.roi.start_x, bx);
                        background_per_ms
                            + lines
                                .iter()
                                .map(|line| {
                                    let z = (x - line.column) / line.sigma.max(f64::EPSILON);
                                    line.counts_per_ms * (-0.5 * z * z).exp()
                                })
                                .sum::<f64>()
                    })
                    .collect();
                let band_centre = f64::from(self.info.max_height) / 2.0;
                let rows: Vec<f64> = (0..height)
                    .map(|by| {
                        let z = (centre(registers.roi.start_y, by) - band_centre)
                            / slit_sigma_rows.max(f64::EPSILON);
                        (-0.5 * z * z).exp()
                    })
                    .collect();

                // Gain register is in 0.1 dB steps; binning sums charge
                let exposure_ms = registers.exposure_us as f64 / 1000.0;
                let gain = 10f64.powf(f64::from(registers.gain) / 200.0);
                let scale = exposure_ms * gain * f64::from(binning * binning);

                let mut rng = rand::thread_rng();
                let mut data = Vec::with_capacity(width * height);
                for row in &rows {
                    for column in &columns {
                        let mut value = bias + column * row * scale;
                        if *noise > 0.0 {
                            value += rng.gen_range(-*noise..=*noise);
                        }
                        data.push(value.round().clamp(0.0, f64::from(u16::MAX)) as u16);
                    }
                }
                data
            }
        }
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CameraDevice for SimulatedCamera {
    async fn open(&self) -> Result<CameraInfo> {
        let mut st = self.state.lock().await;
        st.record(SimulatorOp::Open)?;
        if st.open {
            bail!("camera {} already open", self.info.camera_id);
        }
        st.open = true;
        tracing::debug!(camera = %self.info.name, "Simulated camera opened");
        Ok(self.info.clone())
    }

    async fn close(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        st.record(SimulatorOp::Close)?;
        st.open = false;
        st.exposure_started = None;
        tracing::debug!(camera = %self.info.name, "Simulated camera closed");
        Ok(())
    }

    async fn set_exposure_us(&self, micros: u64) -> Result<()> {
        let mut st = self.state.lock().await;
        st.record(SimulatorOp::SetExposure)?;
        st.registers.exposure_us = micros;
        Ok(())
    }

    async fn set_gain(&self, gain: u32) -> Result<()> {
        let mut st = self.state.lock().await;
        st.record(SimulatorOp::SetGain)?;
        st.registers.gain = gain;
        Ok(())
    }

    async fn set_roi(&self, roi: &RegionOfInterest, binning: u32) -> Result<()> {
        let mut st = self.state.lock().await;
        st.record(SimulatorOp::SetRoi)?;
        if roi.start_x + roi.width > self.info.max_width
            || roi.start_y + roi.height > self.info.max_height
        {
            bail!("ROI {roi} outside sensor");
        }
        if !self.info.supports_binning(binning) {
            bail!("unsupported binning {binning}");
        }
        st.registers.roi = *roi;
        st.registers.binning = binning;
        Ok(())
    }

    async fn start_exposure(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        st.record(SimulatorOp::StartExposure)?;
        if st.exposure_started.is_some() {
            bail!("exposure already in progress");
        }
        st.exposure_started = Some(Instant::now());
        Ok(())
    }

    async fn exposure_status(&self) -> Result<ExposureStatus> {
        let mut st = self.state.lock().await;
        st.record(SimulatorOp::ExposureStatus)?;
        let status = if st.exposure_started.is_none() {
            ExposureStatus::Idle
        } else if st.exposure_failed {
            ExposureStatus::Failed
        } else if st.stalled || !st.exposure_done() {
            ExposureStatus::Working
        } else {
            ExposureStatus::Success
        };
        Ok(status)
    }

    async fn abort_exposure(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        st.record(SimulatorOp::AbortExposure)?;
        st.exposure_started = None;
        Ok(())
    }

    async fn read_frame(&self) -> Result<Vec<u16>> {
        let mut st = self.state.lock().await;
        st.record(SimulatorOp::ReadFrame)?;
        if st.exposure_started.is_none() {
            bail!("no exposure started");
        }
        if st.stalled || !st.exposure_done() {
            bail!("exposure still in progress");
        }
        st.exposure_started = None;
        st.frames_read += 1;
        let registers = st.registers;
        drop(st);
        Ok(self.render(&registers))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
