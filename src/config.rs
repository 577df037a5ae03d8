//! Layered configuration using Figment.
//!
//! Configuration is merged from, lowest to highest precedence:
//! 1. Built-in defaults
//! 2. `config/default_settings.toml` (factory defaults, shipped with the app)
//! 3. `config/current_settings.toml` (last saved operator settings)
//! 4. Environment variables prefixed with `SPECTRO_`, `__` separating sections
//!
//! ```text
//! SPECTRO_APPLICATION__LOG_LEVEL=debug
//! SPECTRO_CAMERA__EXPOSURE_MS=250
//! SPECTRO_TIMING__MAX_POLLS=40
//! ```
//!
//! Missing files are skipped. After merging, [`SpectrometerConfig::validate`]
//! checks every value that the core would otherwise reject at runtime.

use crate::camera::{
    asi183mm_info, CameraInfo, CameraSettings, CaptureTiming, FramePattern, RegionOfInterest,
    SimulatedCamera,
};
use crate::spectrometer::{DefaultSettings, ProcessingSettings};
use crate::spectrum::CalibrationModel;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Directory searched by [`SpectrometerConfig::load`].
pub const DEFAULT_CONFIG_DIR: &str = "config";
/// Factory defaults file name.
pub const DEFAULT_SETTINGS_FILE: &str = "default_settings.toml";
/// Operator settings file name.
pub const CURRENT_SETTINGS_FILE: &str = "current_settings.toml";
/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SPECTRO_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Merging or extracting the layers failed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value is out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    /// Writing a settings file failed.
    #[error("Configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
    /// Rendering TOML failed.
    #[error("Configuration serialization error: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, coloured.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SpectrometerConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Camera settings applied on connect
    #[serde(default)]
    pub camera: CameraConfig,
    /// Wavelength calibration
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Default reduction
    #[serde(default)]
    pub processing: ProcessingSettings,
    /// Connect and capture timing
    #[serde(default)]
    pub timing: TimingConfig,
    /// Simulated camera
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Camera configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Exposure time in milliseconds
    #[serde(default = "default_exposure_ms")]
    pub exposure_ms: u64,
    /// Analog gain
    #[serde(default)]
    pub gain: u32,
    /// Binning factor
    #[serde(default = "default_binning")]
    pub binning: u32,
    /// ROI in unbinned pixels; omitted for the default spectroscopy strip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roi: Option<RegionOfInterest>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            exposure_ms: default_exposure_ms(),
            gain: 0,
            binning: default_binning(),
            roi: None,
        }
    }
}

/// Calibration configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Polynomial coefficients `[a, b, c]`, highest order first
    #[serde(default = "default_coefficients")]
    pub coefficients: Vec<f64>,
    /// Excitation laser wavelength in nm, for Raman shifts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub laser_wavelength_nm: Option<f64>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            coefficients: default_coefficients(),
            laser_wavelength_nm: None,
        }
    }
}

/// Timing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Driver settle delay after open, in milliseconds
    #[serde(default = "default_connect_settle")]
    pub connect_settle_ms: u64,
    /// Readout margin added to the exposure, in milliseconds
    #[serde(default = "default_readout_margin")]
    pub readout_margin_ms: u64,
    /// Delay between exposure status polls, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Status polls before a capture times out
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_settle_ms: default_connect_settle(),
            readout_margin_ms: default_readout_margin(),
            poll_interval_ms: default_poll_interval(),
            max_polls: default_max_polls(),
        }
    }
}

/// Simulated camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Reported model name
    pub name: String,
    /// Sensor width in pixels
    pub max_width: u32,
    /// Sensor height in pixels
    pub max_height: u32,
    /// Pixel pitch in micrometres
    pub pixel_size_um: f64,
    /// Accepted binning factors
    pub supported_bins: Vec<u32>,
    /// ADC bit depth
    pub bit_depth: u8,
    /// Binned ROI width alignment
    pub width_step: u32,
    /// Binned ROI height alignment
    pub height_step: u32,
    /// Frame content
    #[serde(default)]
    pub pattern: FramePattern,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        let info = asi183mm_info();
        Self {
            name: info.name,
            max_width: info.max_width,
            max_height: info.max_height,
            pixel_size_um: info.pixel_size_um,
            supported_bins: info.supported_bins,
            bit_depth: info.bit_depth,
            width_step: info.width_step,
            height_step: info.height_step,
            pattern: FramePattern::default(),
        }
    }
}

impl SimulatorConfig {
    /// Sensor description reported by the simulated camera.
    pub fn camera_info(&self) -> CameraInfo {
        CameraInfo {
            name: self.name.clone(),
            camera_id: 0,
            max_width: self.max_width,
            max_height: self.max_height,
            pixel_size_um: self.pixel_size_um,
            supported_bins: self.supported_bins.clone(),
            bit_depth: self.bit_depth,
            is_color: false,
            width_step: self.width_step,
            height_step: self.height_step,
        }
    }

    /// Build the simulated camera.
    pub fn build(&self) -> SimulatedCamera {
        SimulatedCamera::with_info(self.camera_info()).with_pattern(self.pattern.clone())
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_app_name() -> String {
    "Spectro DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_exposure_ms() -> u64 {
    crate::camera::DEFAULT_EXPOSURE_MS
}

fn default_binning() -> u32 {
    1
}

fn default_coefficients() -> Vec<f64> {
    vec![0.0, 1.0, 0.0]
}

fn default_connect_settle() -> u64 {
    1500
}

fn default_readout_margin() -> u64 {
    100
}

fn default_poll_interval() -> u64 {
    50
}

fn default_max_polls() -> u32 {
    20
}

// ============================================================================
// Configuration Loading, Validation and Persistence
// ============================================================================

impl SpectrometerConfig {
    /// Load from `config/` and the environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_dir(DEFAULT_CONFIG_DIR)
    }

    /// Load `default_settings.toml` and `current_settings.toml` from `dir`.
    pub fn load_from_dir<P: AsRef<Path>>(dir: P) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        Self::load_layered(
            dir.join(DEFAULT_SETTINGS_FILE),
            Some(dir.join(CURRENT_SETTINGS_FILE)),
        )
    }

    /// Merge defaults, the given files and the environment, then validate.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if a file cannot be parsed, a value has the wrong
    /// type, or validation fails.
    pub fn load_layered<P: AsRef<Path>>(
        defaults: P,
        current: Option<P>,
    ) -> Result<Self, ConfigError> {
        let mut figment =
            Figment::from(Serialized::defaults(Self::default())).merge(Toml::file(defaults.as_ref()));
        if let Some(current) = current {
            figment = figment.merge(Toml::file(current.as_ref()));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Load only the factory defaults file, ignoring operator settings and the
    /// environment.
    pub fn load_factory_defaults<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Camera exposure, gain and binning are in range
    /// - ROI fits the simulated sensor
    /// - Calibration coefficients and laser wavelength are usable
    /// - Baseline degree is in range
    /// - Timing allows at least one status poll
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let invalid = |section: &str, err: crate::error::SpectrometerError| {
            ConfigError::ValidationError(format!("[{section}] {err}"))
        };
        let settings = self.camera_settings().map_err(|e| invalid("camera", e))?;
        if let Some(roi) = self.camera.roi {
            roi.validate(&self.simulator.camera_info(), settings.binning)
                .map_err(|e| invalid("camera.roi", e))?;
        }
        self.calibration_model()
            .map_err(|e| invalid("calibration", e))?;
        self.processing
            .validate()
            .map_err(|e| invalid("processing", e))?;

        if self.timing.max_polls == 0 {
            return Err(ConfigError::ValidationError(
                "[timing] max_polls must be at least 1".to_string(),
            ));
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "[timing] poll_interval_ms must be at least 1".to_string(),
            ));
        }

        let sim = &self.simulator;
        if sim.max_width == 0 || sim.max_height == 0 {
            return Err(ConfigError::ValidationError(format!(
                "[simulator] sensor must have non-zero size, got {}x{}",
                sim.max_width, sim.max_height
            )));
        }
        if sim.supported_bins.is_empty() || sim.supported_bins.contains(&0) {
            return Err(ConfigError::ValidationError(
                "[simulator] supported_bins must list factors of at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn camera_settings(&self) -> crate::error::Result<CameraSettings> {
        CameraSettings::new(self.camera.exposure_ms, self.camera.gain, self.camera.binning)
    }

    fn calibration_model(&self) -> crate::error::Result<CalibrationModel> {
        CalibrationModel::new(
            &self.calibration.coefficients,
            self.calibration.laser_wavelength_nm,
        )
    }

    /// Settings bundle consumed by [`Spectrometer::apply_defaults`](crate::Spectrometer::apply_defaults).
    pub fn to_defaults(&self) -> Result<DefaultSettings, ConfigError> {
        Ok(DefaultSettings {
            camera: self
                .camera_settings()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?,
            roi: self.camera.roi,
            calibration: self
                .calibration_model()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?,
            processing: self.processing,
        })
    }

    /// Replace the camera, calibration and processing sections from a live bundle.
    #[must_use]
    pub fn with_defaults(mut self, defaults: &DefaultSettings) -> Self {
        self.camera = CameraConfig {
            exposure_ms: defaults.camera.exposure.as_millis(),
            gain: defaults.camera.gain,
            binning: defaults.camera.binning,
            roi: defaults.roi,
        };
        let [a, b, c] = defaults.calibration.coefficients();
        self.calibration = CalibrationConfig {
            coefficients: vec![a, b, c],
            laser_wavelength_nm: defaults.calibration.laser_wavelength_nm(),
        };
        self.processing = defaults.processing;
        self
    }

    /// Capture timing constants.
    pub fn capture_timing(&self) -> CaptureTiming {
        CaptureTiming {
            connect_settle: Duration::from_millis(self.timing.connect_settle_ms),
            readout_margin: Duration::from_millis(self.timing.readout_margin_ms),
            poll_interval: Duration::from_millis(self.timing.poll_interval_ms),
            max_polls: self.timing.max_polls,
        }
    }

    /// Write this configuration as TOML, creating the parent directory if needed.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf, ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let rendered = toml::to_string_pretty(self)?;
        std::fs::write(path, rendered)?;
        tracing::info!(path = %path.display(), "Settings saved");
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectrum::{Baseline, ReadoutMode};
    use figment::Jail;

    #[test]
    fn test_default_config_is_valid() {
        let config = SpectrometerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture_timing(), CaptureTiming::default());
        assert_eq!(config.to_defaults().unwrap(), DefaultSettings::default());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = SpectrometerConfig::default();
        config.application.log_level = "verbose".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_camera_values() {
        let mut config = SpectrometerConfig::default();
        config.camera.exposure_ms = 0;
        assert!(config.validate().is_err());

        let mut config = SpectrometerConfig::default();
        config.camera.roi = Some(RegionOfInterest::new(5000, 0, 800, 100));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("camera.roi"));
    }

    #[test]
    fn test_invalid_processing_and_timing() {
        let mut config = SpectrometerConfig::default();
        config.processing.baseline = Baseline::Polynomial { degree: 20 };
        assert!(config.validate().is_err());

        let mut config = SpectrometerConfig::default();
        config.timing.max_polls = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_layers_and_environment() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_SETTINGS_FILE,
                r#"
                [camera]
                exposure_ms = 500
                gain = 10

                [calibration]
                coefficients = [0.0, 0.5, 400.0]
                "#,
            )?;
            jail.create_file(
                CURRENT_SETTINGS_FILE,
                r#"
                [camera]
                gain = 20

                [processing]
                readout_mode = "maximum"
                baseline = { method = "polynomial", degree = 3 }
                "#,
            )?;
            jail.set_env("SPECTRO_TIMING__MAX_POLLS", 40);

            let config = SpectrometerConfig::load_from_dir(".").map_err(|e| e.to_string())?;
            assert_eq!(config.camera.exposure_ms, 500);
            assert_eq!(config.camera.gain, 20);
            assert_eq!(config.camera.binning, 1);
            assert_eq!(config.calibration.coefficients, vec![0.0, 0.5, 400.0]);
            assert_eq!(config.processing.readout_mode, ReadoutMode::Maximum);
            assert_eq!(
                config.processing.baseline,
                Baseline::Polynomial { degree: 3 }
            );
            assert_eq!(config.timing.max_polls, 40);
            assert_eq!(config.timing.poll_interval_ms, 50);
            Ok(())
        });
    }

    #[test]
    fn test_missing_files_fall_back_to_defaults() {
        Jail::expect_with(|_jail| {
            let config = SpectrometerConfig::load_from_dir("nowhere").map_err(|e| e.to_string())?;
            assert_eq!(config, SpectrometerConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CURRENT_SETTINGS_FILE);

        let defaults = DefaultSettings {
            camera: CameraSettings::new(250, 30, 2).unwrap(),
            roi: Some(RegionOfInterest::new(0, 1800, 5488, 100)),
            calibration: CalibrationModel::new(&[0.001, 0.5, 400.0], Some(785.0)).unwrap(),
            processing: ProcessingSettings {
                readout_mode: ReadoutMode::Maximum,
                baseline: Baseline::Linear,
            },
        };
        let config = SpectrometerConfig::default().with_defaults(&defaults);
        config.save_to(&path).unwrap();

        let reloaded = SpectrometerConfig::load_factory_defaults(&path).unwrap();
        assert_eq!(reloaded, config);
        assert_eq!(reloaded.to_defaults().unwrap(), defaults);
    }

    #[test]
    fn test_simulator_build_uses_geometry() {
        let mut config = SpectrometerConfig::default();
        config.simulator.max_width = 640;
        config.simulator.max_height = 480;
        let camera = config.simulator.build();
        assert_eq!(camera.info().max_width, 640);
        assert_eq!(camera.info().max_height, 480);
    }
}
