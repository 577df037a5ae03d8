//! Spectrum and image writers with clean feature flag handling.
use crate::spectrometer::{ImageSnapshot, SpectrumResult};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

// ============================================================================
// CSV Writer
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    /// Writes spectra as `wavelength_nm,intensity[,raman_shift_cm1]` rows,
    /// preceded by `#`-prefixed acquisition metadata.
    pub struct CsvWriter {
        path: PathBuf,
    }

    impl CsvWriter {
        /// Writer targeting `path`. Parent directories are created on write.
        pub fn new<P: AsRef<Path>>(path: P) -> Self {
            Self {
                path: path.as_ref().to_path_buf(),
            }
        }

        /// Output path.
        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Write one spectrum, replacing any existing file.
        pub fn write(&self, result: &SpectrumResult) -> Result<()> {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create storage directory at {:?}", parent)
                    })?;
                }
            }
            let mut file = File::create(&self.path)
                .with_context(|| format!("Failed to create CSV file at {:?}", self.path))?;

            let header = [
                format!("timestamp: {}", result.timestamp.to_rfc3339()),
                format!("exposure_ms: {}", result.exposure_ms),
                format!("gain: {}", result.gain),
                format!("binning: {}", result.binning),
                format!("roi: {}", result.roi),
                format!("readout_mode: {}", result.readout_mode),
                format!("baseline: {}", result.baseline),
            ];
            for line in &header {
                writeln!(file, "# {line}").context("Failed to write metadata to CSV file")?;
            }

            let mut writer = csv::Writer::from_writer(file);
            match &result.raman_shifts {
                Some(shifts) => {
                    writer
                        .write_record(["wavelength_nm", "intensity", "raman_shift_cm1"])
                        .context("Failed to write CSV header")?;
                    for ((wavelength, intensity), shift) in result
                        .wavelengths
                        .iter()
                        .zip(&result.intensities)
                        .zip(shifts)
                    {
                        writer
                            .serialize((wavelength, intensity, shift))
                            .context("Failed to write CSV row")?;
                    }
                }
                None => {
                    writer
                        .write_record(["wavelength_nm", "intensity"])
                        .context("Failed to write CSV header")?;
                    for (wavelength, intensity) in result.wavelengths.iter().zip(&result.intensities)
                    {
                        writer
                            .serialize((wavelength, intensity))
                            .context("Failed to write CSV row")?;
                    }
                }
            }
            writer.flush().context("Failed to flush CSV writer")?;
            tracing::info!(path = %self.path.display(), points = result.len(), "Spectrum saved");
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// Placeholder used when the `storage_csv` feature is off.
    pub struct CsvWriter {
        path: PathBuf,
    }

    impl CsvWriter {
        /// Writer targeting `path`.
        pub fn new<P: AsRef<Path>>(path: P) -> Self {
            Self {
                path: path.as_ref().to_path_buf(),
            }
        }

        /// Output path.
        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Always fails: CSV support was not compiled in.
        pub fn write(&self, _result: &SpectrumResult) -> Result<()> {
            anyhow::bail!("CSV export requires the 'storage_csv' feature")
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvWriter;

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvWriter;

// ============================================================================
// PNG Writer
// ============================================================================

/// Write a frame snapshot as an 8-bit greyscale PNG.
pub fn write_image_png<P: AsRef<Path>>(path: P, image: &ImageSnapshot) -> Result<()> {
    let path = path.as_ref();
    let png = image
        .to_png()
        .with_context(|| format!("Failed to encode {}x{} frame", image.width(), image.height()))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create image directory at {:?}", parent))?;
        }
    }
    std::fs::write(path, png).with_context(|| format!("Failed to write PNG at {:?}", path))?;
    tracing::info!(path = %path.display(), "Image saved");
    Ok(())
}

/// `base.ext` → `base_0003.ext`, for numbered series.
pub fn numbered_path(base: &Path, index: usize) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match base.extension() {
        Some(ext) => format!("{stem}_{index:04}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{index:04}"),
    };
    base.with_file_name(name)
}
