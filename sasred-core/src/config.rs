//! Immutable pipeline configuration.
//!
//! All enable flags and stage parameters are resolved once, before the
//! first frame is processed, and passed by reference into every stage.
//! There is no process-wide mutable state.

use crate::{Error, Result};
use ndarray::Array2;
use std::path::PathBuf;

/// A detector to reduce, identified by its NeXus group name.
#[derive(Clone, Debug)]
pub struct DetectorSpec {
    /// Group name under the entry, e.g. `"Pilatus2M"`.
    pub name: String,
    /// Trailing image rank of the `data` node (1 or 2).
    pub rank: usize,
    /// Pixel size in millimetres, when known.
    pub pixel_size_mm: Option<f64>,
}

impl DetectorSpec {
    #[must_use]
    pub fn new(name: &str, rank: usize) -> Self {
        Self {
            name: name.to_string(),
            rank,
            pixel_size_mm: None,
        }
    }
}

/// Annular sector over a 2-D detector frame, in pixel coordinates.
#[derive(Clone, Debug)]
pub struct SectorGeometry {
    /// Beam centre `[x, y]`.
    pub centre: [f64; 2],
    /// Inner and outer radius `[r_min, r_max]`.
    pub radii: [f64; 2],
    /// Angular range `[start, end]` in radians, end > start.
    pub angles: [f64; 2],
    /// Fold pixels from the point-symmetric sector into the same bins.
    pub fold_symmetry: bool,
}

impl SectorGeometry {
    /// # Errors
    /// Returns `Error::Config` on degenerate radii or angles.
    pub fn validate(&self) -> Result<()> {
        if !(self.radii[0] >= 0.0 && self.radii[1] > self.radii[0]) {
            return Err(Error::Config(format!(
                "sector radii {:?} must satisfy 0 <= r_min < r_max",
                self.radii
            )));
        }
        if self.angles[1] <= self.angles[0] {
            return Err(Error::Config(format!(
                "sector angles {:?} must be increasing",
                self.angles
            )));
        }
        if self.angles[1] - self.angles[0] > 2.0 * std::f64::consts::PI {
            return Err(Error::Config(
                "sector angular range exceeds a full turn".to_string(),
            ));
        }
        Ok(())
    }
}

/// Linear pixel-to-q calibration for the radial axis.
///
/// `q = gradient * r + intercept` with `r` the radial bin centre in pixels.
#[derive(Clone, Copy, Debug)]
pub struct QCalibration {
    pub gradient: f64,
    pub intercept: f64,
}

impl QCalibration {
    #[must_use]
    pub fn q_of(&self, radius_px: f64) -> f64 {
        self.gradient * radius_px + self.intercept
    }
}

/// Frame averaging mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AverageMode {
    /// Plain arithmetic mean; `err'^2 = sum(err_i^2) / n^2`.
    #[default]
    Plain,
    /// Inverse-variance weighted mean; falls back to plain without errors.
    Weighted,
}

/// Scattering-law plot kinds derived from a reduced `(q, I)` curve.
///
/// Each kind maps to an `{axis, axis_error, data, data_error}` transform
/// quadruple in `sasred-algorithms`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SaxsPlotKind {
    LogNorm,
    LogLog,
    Guinier,
    Porod,
    Kratky,
    Zimm,
    DebyeBueche,
}

impl SaxsPlotKind {
    /// NeXus group name for the plot result.
    #[must_use]
    pub fn group_name(self) -> &'static str {
        match self {
            Self::LogNorm => "LogNormPlot",
            Self::LogLog => "LogLogPlot",
            Self::Guinier => "GuinierPlot",
            Self::Porod => "PorodPlot",
            Self::Kratky => "KratkyPlot",
            Self::Zimm => "ZimmPlot",
            Self::DebyeBueche => "DebyeBuechePlot",
        }
    }

    /// Axis and data labels, `(variable, data)`.
    #[must_use]
    pub fn axis_names(self) -> (&'static str, &'static str) {
        match self {
            Self::LogNorm => ("q", "log10(I)"),
            Self::LogLog => ("log10(q)", "log10(I)"),
            Self::Guinier => ("q^2", "ln(I)"),
            Self::Porod => ("q", "Iq^4"),
            Self::Kratky => ("q", "Iq^2"),
            Self::Zimm => ("q^2", "1/I"),
            Self::DebyeBueche => ("q^2", "1/sqrt(I)"),
        }
    }

    /// All supported kinds in output order.
    #[must_use]
    pub fn all() -> &'static [SaxsPlotKind] {
        &[
            Self::LogNorm,
            Self::LogLog,
            Self::Guinier,
            Self::Porod,
            Self::Kratky,
            Self::Zimm,
            Self::DebyeBueche,
        ]
    }
}

/// Immutable reduction parameters, resolved once per run.
#[derive(Clone, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub struct PipelineConfig {
    /// Detectors to reduce, in pass order.
    pub detectors: Vec<DetectorSpec>,
    /// Monitor/scaler group name used for normalisation.
    pub calibration: Option<String>,
    /// Channel index within the calibration dataset.
    pub norm_channel: usize,
    /// Absolute intensity scaling factor.
    pub abs_scaling: Option<f64>,
    /// Sample thickness dividing the absolute scaling.
    pub sample_thickness: Option<f64>,
    /// Background scan file.
    pub background_path: Option<PathBuf>,
    /// Frame selection applied to the background prepass.
    pub background_selection: Option<String>,
    /// Frame selection applied by the averaging stage, e.g. `"0-5,8"`.
    pub grid_average: Option<String>,
    pub average_mode: AverageMode,
    pub sector: Option<SectorGeometry>,
    /// Exclusion mask; `true` marks a pixel to drop.
    pub mask: Option<Array2<bool>>,
    pub q_calibration: Option<QCalibration>,
    /// Directory receiving results and reduced background files.
    pub working_dir: PathBuf,
    /// Maximum frames read per slice window.
    pub frame_batch: usize,
    pub enable_normalisation: bool,
    pub enable_background: bool,
    pub enable_sector: bool,
    pub enable_radial: bool,
    pub enable_azimuthal: bool,
    pub enable_mask: bool,
    pub enable_average: bool,
    pub enable_invariant: bool,
    /// Plot groups written from the reduced curve.
    pub plots: Vec<SaxsPlotKind>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detectors: Vec::new(),
            calibration: None,
            norm_channel: 1,
            abs_scaling: None,
            sample_thickness: None,
            background_path: None,
            background_selection: None,
            grid_average: None,
            average_mode: AverageMode::Plain,
            sector: None,
            mask: None,
            q_calibration: None,
            working_dir: PathBuf::from("."),
            frame_batch: 1,
            enable_normalisation: false,
            enable_background: false,
            enable_sector: false,
            enable_radial: true,
            enable_azimuthal: false,
            enable_mask: false,
            enable_average: false,
            enable_invariant: false,
            plots: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Combined normalisation scale: `abs_scaling / sample_thickness`.
    #[must_use]
    pub fn norm_scale(&self) -> f64 {
        let scale = self.abs_scaling.unwrap_or(1.0);
        match self.sample_thickness {
            Some(thickness) if thickness > 0.0 => scale / thickness,
            _ => scale,
        }
    }

    /// Validate the configuration before any I/O.
    ///
    /// # Errors
    /// Returns `Error::Config` on an inconsistent flag set.
    pub fn validate(&self) -> Result<()> {
        if self.detectors.is_empty() {
            return Err(Error::Config("no detectors selected".to_string()));
        }
        if self.frame_batch == 0 {
            return Err(Error::Config("frame batch must be at least 1".to_string()));
        }
        if self.enable_normalisation && self.calibration.is_none() {
            return Err(Error::Config(
                "normalisation enabled without a calibration dataset".to_string(),
            ));
        }
        if self.enable_background && self.background_path.is_none() {
            return Err(Error::Config(
                "background subtraction enabled without a background file".to_string(),
            ));
        }
        if self.enable_sector {
            if !(self.enable_radial || self.enable_azimuthal) {
                return Err(Error::Config(
                    "sector integration enabled but neither radial nor azimuthal output is"
                        .to_string(),
                ));
            }
            let sector = self
                .sector
                .as_ref()
                .ok_or_else(|| Error::Config("sector integration without geometry".to_string()))?;
            sector.validate()?;
            if let Some(det) = self.detectors.iter().find(|d| d.rank != 2) {
                return Err(Error::Config(format!(
                    "sector integration requires 2-D detector frames, but {} has rank {}",
                    det.name, det.rank
                )));
            }
        }
        if self.enable_mask && self.mask.is_none() {
            return Err(Error::Config("masking enabled without a mask".to_string()));
        }
        if !self.plots.is_empty() {
            if !self.enable_sector {
                return Err(Error::Config(
                    "scattering plots require sector integration output".to_string(),
                ));
            }
            if !self.enable_average {
                return Err(Error::Config(
                    "scattering plots require an averaged curve".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sector() -> SectorGeometry {
        SectorGeometry {
            centre: [64.0, 64.0],
            radii: [5.0, 50.0],
            angles: [0.0, std::f64::consts::FRAC_PI_2],
            fold_symmetry: false,
        }
    }

    #[test]
    fn sector_requires_radial_or_azimuthal() {
        let config = PipelineConfig {
            detectors: vec![DetectorSpec::new("det", 2)],
            enable_sector: true,
            enable_radial: false,
            enable_azimuthal: false,
            sector: Some(sector()),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn plots_require_averaging() {
        let config = PipelineConfig {
            detectors: vec![DetectorSpec::new("det", 2)],
            enable_sector: true,
            sector: Some(sector()),
            plots: vec![SaxsPlotKind::LogNorm],
            ..PipelineConfig::default()
        };
        // Without averaging there is no curve to plot or fit.
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            enable_average: true,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mask_flag_requires_mask() {
        let config = PipelineConfig {
            detectors: vec![DetectorSpec::new("det", 2)],
            enable_mask: true,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn valid_sector_config_passes() {
        let config = PipelineConfig {
            detectors: vec![DetectorSpec::new("det", 2)],
            enable_sector: true,
            sector: Some(sector()),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn norm_scale_divides_by_thickness() {
        let config = PipelineConfig {
            abs_scaling: Some(10.0),
            sample_thickness: Some(2.0),
            ..PipelineConfig::default()
        };
        assert!((config.norm_scale() - 5.0).abs() < 1e-12);
    }
}
