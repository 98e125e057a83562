//! Command-line driver for SAXS/WAXS data reduction.

use clap::{Parser, Subcommand};
use log::{error, info};
use ndarray::Array2;
use rayon::prelude::*;
use sasred_core::{
    AverageMode, DetectorSpec, PipelineConfig, QCalibration, SaxsPlotKind, SectorGeometry,
};
use sasred_io::{ArrayStore, ProgressMonitor, ReductionContext, ReductionStatus};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parameter file error: {0}")]
    Params(#[from] serde_json::Error),

    #[error("parameter error: {0}")]
    BadParam(String),

    #[error("reduction error: {0}")]
    Reduction(#[from] sasred_io::Error),
}

/// Detector entry in the parameter file.
#[derive(Debug, Deserialize)]
struct DetectorParams {
    name: String,
    /// Trailing image rank of the detector data, 1 or 2.
    #[serde(default = "default_rank")]
    rank: usize,
    pixel_size_mm: Option<f64>,
}

fn default_rank() -> usize {
    2
}

/// Sector geometry in the parameter file; angles are given in degrees.
#[derive(Debug, Deserialize)]
struct SectorParams {
    centre: [f64; 2],
    radii: [f64; 2],
    angles_deg: [f64; 2],
    #[serde(default)]
    fold_symmetry: bool,
    #[serde(default = "default_true")]
    radial: bool,
    #[serde(default)]
    azimuthal: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct QCalibrationParams {
    gradient: f64,
    intercept: f64,
}

/// A mask dataset inside an HDF5 file; nonzero values exclude a pixel.
#[derive(Debug, Deserialize)]
struct MaskParams {
    file: PathBuf,
    node: String,
}

/// JSON reduction parameters.
///
/// Stage enablement follows from which sections are present: naming a
/// calibration enables normalisation, naming a background file enables
/// subtraction, and so on.
#[derive(Debug, Deserialize)]
struct ReductionParams {
    detectors: Vec<DetectorParams>,
    calibration: Option<String>,
    #[serde(default = "default_channel")]
    norm_channel: usize,
    abs_scaling: Option<f64>,
    sample_thickness: Option<f64>,
    background_file: Option<PathBuf>,
    background_selection: Option<String>,
    grid_average: Option<String>,
    #[serde(default)]
    weighted_average: bool,
    sector: Option<SectorParams>,
    mask: Option<MaskParams>,
    q_calibration: Option<QCalibrationParams>,
    #[serde(default)]
    plots: Vec<String>,
    #[serde(default = "default_batch")]
    frame_batch: usize,
    #[serde(default = "default_true")]
    average: bool,
    #[serde(default)]
    invariant: bool,
}

fn default_channel() -> usize {
    1
}

fn default_batch() -> usize {
    4
}

/// SAXS/WAXS data reduction for NeXus/HDF5 detector scans.
#[derive(Parser)]
#[command(name = "sasred")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reduce one or more scan files
    Reduce {
        /// Input NeXus file(s)
        #[arg(required = true)]
        input: Vec<PathBuf>,

        /// JSON parameter file
        #[arg(short, long)]
        params: PathBuf,

        /// Directory receiving results files
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Worker threads (defaults to the rayon heuristic)
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Show the entry structure of a scan file
    Inspect {
        /// Input NeXus file
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Reduce {
            input,
            params,
            output_dir,
            threads,
        } => reduce(&input, &params, output_dir, threads),
        Commands::Inspect { input } => inspect(&input),
    }
}

fn reduce(
    inputs: &[PathBuf],
    params_path: &Path,
    output_dir: PathBuf,
    threads: Option<usize>,
) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| CliError::BadParam(format!("thread pool: {e}")))?;
    }

    let params: ReductionParams = serde_json::from_reader(std::fs::File::open(params_path)?)?;
    let config = build_config(params, output_dir)?;
    let mut context = ReductionContext::new(config);
    context.configure()?;
    let monitor = ProgressMonitor::new();

    info!("reducing {} file(s)", inputs.len());
    let statuses: Vec<(PathBuf, sasred_io::Result<ReductionStatus>)> = inputs
        .par_iter()
        .map(|path| (path.clone(), context.process(path, &monitor)))
        .collect();

    let mut failed = false;
    for (path, status) in statuses {
        match status {
            Ok(ReductionStatus::Ok { results }) => {
                println!("{} -> {}", path.display(), results.display());
            }
            Ok(ReductionStatus::Skipped { reason }) => {
                println!("{}: skipped ({reason})", path.display());
            }
            Ok(ReductionStatus::Cancelled) => {
                println!("{}: cancelled", path.display());
            }
            Err(e) => {
                error!("{}: {e}", path.display());
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn inspect(input: &Path) -> Result<()> {
    let store = ArrayStore::open(input)?;
    let entry = store.group("/entry1")?;
    if let Ok(Some(title)) = store.read_string(&entry, "title") {
        println!("title: {title}");
    }
    for name in entry.member_names().map_err(sasred_io::Error::from)? {
        let Ok(group) = store.group(&format!("/entry1/{name}")) else {
            continue;
        };
        match group.dataset("data") {
            Ok(dataset) => println!("{name}: data {:?}", dataset.shape()),
            Err(_) => println!("{name}"),
        }
    }
    Ok(())
}

fn build_config(params: ReductionParams, working_dir: PathBuf) -> Result<PipelineConfig> {
    let detectors = params
        .detectors
        .into_iter()
        .map(|d| DetectorSpec {
            name: d.name,
            rank: d.rank,
            pixel_size_mm: d.pixel_size_mm,
        })
        .collect();

    let (sector, enable_radial, enable_azimuthal) = match params.sector {
        Some(s) => (
            Some(SectorGeometry {
                centre: s.centre,
                radii: s.radii,
                angles: [s.angles_deg[0].to_radians(), s.angles_deg[1].to_radians()],
                fold_symmetry: s.fold_symmetry,
            }),
            s.radial,
            s.azimuthal,
        ),
        None => (None, true, false),
    };

    let mask = params.mask.map(load_mask).transpose()?;
    let plots = params
        .plots
        .iter()
        .map(|name| plot_kind(name))
        .collect::<Result<Vec<_>>>()?;

    Ok(PipelineConfig {
        enable_normalisation: params.calibration.is_some(),
        enable_background: params.background_file.is_some(),
        enable_sector: sector.is_some(),
        enable_radial,
        enable_azimuthal,
        enable_mask: mask.is_some(),
        enable_average: params.average,
        enable_invariant: params.invariant,
        detectors,
        calibration: params.calibration,
        norm_channel: params.norm_channel,
        abs_scaling: params.abs_scaling,
        sample_thickness: params.sample_thickness,
        background_path: params.background_file,
        background_selection: params.background_selection,
        grid_average: params.grid_average,
        average_mode: if params.weighted_average {
            AverageMode::Weighted
        } else {
            AverageMode::Plain
        },
        sector,
        mask,
        q_calibration: params.q_calibration.map(|q| QCalibration {
            gradient: q.gradient,
            intercept: q.intercept,
        }),
        working_dir,
        frame_batch: params.frame_batch,
        plots,
    })
}

fn load_mask(params: MaskParams) -> Result<Array2<bool>> {
    let store = ArrayStore::open(&params.file)?;
    let group = store.group("/")?;
    let dataset = group
        .dataset(&params.node)
        .map_err(|e| CliError::BadParam(format!("mask node {}: {e}", params.node)))?;
    let shape = dataset.shape();
    if shape.len() != 2 {
        return Err(CliError::BadParam(format!(
            "mask node {} is not 2-D: {shape:?}",
            params.node
        )));
    }
    let raw = dataset
        .read_raw::<u8>()
        .map_err(|e| CliError::BadParam(format!("mask node {}: {e}", params.node)))?;
    Array2::from_shape_vec((shape[0], shape[1]), raw.iter().map(|&v| v != 0).collect())
        .map_err(|e| CliError::BadParam(e.to_string()))
}

fn plot_kind(name: &str) -> Result<SaxsPlotKind> {
    match name.to_ascii_lowercase().as_str() {
        "lognorm" => Ok(SaxsPlotKind::LogNorm),
        "loglog" => Ok(SaxsPlotKind::LogLog),
        "guinier" => Ok(SaxsPlotKind::Guinier),
        "porod" => Ok(SaxsPlotKind::Porod),
        "kratky" => Ok(SaxsPlotKind::Kratky),
        "zimm" => Ok(SaxsPlotKind::Zimm),
        "debyebueche" => Ok(SaxsPlotKind::DebyeBueche),
        other => Err(CliError::BadParam(format!("unknown plot kind {other}"))),
    }
}
