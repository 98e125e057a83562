//! Pipeline coordinator: drives the slice cursor, sequences the enabled
//! reduction stages and writes results under the shared write lock.

use crate::results::{create_results_file, results_path, ResultsFile};
use crate::slice::{SliceCursor, SliceWindow};
use crate::store::{set_attr_f64, set_attr_str, ArrayStore, SignalPair};
use crate::{Error, Result};
use hdf5::Group;
use log::{debug, info, warn};
use ndarray::{Array2, ArrayD, ArrayView1, IxDyn};
use sasred_algorithms::{
    transform_curve, BackgroundSubtraction, CalibrationData, FrameAverage, GuinierFitter,
    Invariant, Normalisation, SectorIntegration,
};
use sasred_core::{
    parse_selection, DetectorSpec, FrameBuffer, PipelineConfig, SaxsPlotKind,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

const ACCEPTED_EXTENSIONS: [&str; 3] = ["nxs", "h5", "hdf5"];

/// Terminal status of one input file.
#[derive(Clone, Debug)]
pub enum ReductionStatus {
    /// Reduction completed; `results` names the output file.
    Ok { results: PathBuf },
    /// The file was skipped with a warning; the batch continues.
    Skipped { reason: String },
    /// Cancellation was observed at a frame boundary.
    Cancelled,
}

/// Cooperative cancellation flag polled between frames and detector
/// passes.
#[derive(Debug, Default)]
pub struct ProgressMonitor {
    cancelled: AtomicBool,
}

impl ProgressMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

struct BackgroundState {
    /// The prepass runs at most once per context.
    pending: bool,
    reduced: Option<PathBuf>,
}

/// Per-run aggregate: configuration, destination write lock and the
/// background-prepass state. One context may serve many input files,
/// possibly from concurrent workers.
pub struct ReductionContext {
    config: PipelineConfig,
    write_lock: Mutex<()>,
    /// Writers currently inside the destination critical section.
    write_active: AtomicUsize,
    /// Times a writer entered the critical section while another writer
    /// was still inside. Stays zero while every destination write holds
    /// the write lock.
    write_overlaps: AtomicUsize,
    background: Mutex<BackgroundState>,
    configured: bool,
}

/// Write-lock guard that tracks critical-section occupancy.
struct WriteGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    active: &'a AtomicUsize,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Stage enablement for one pass; the background prepass runs the same
/// chain with the background, invariant and plot stages force-disabled
/// and the result always averaged down to a single frame.
struct StageFlags<'a> {
    normalisation: bool,
    background: bool,
    sector: bool,
    average: bool,
    invariant: bool,
    plots: &'a [SaxsPlotKind],
    selection: Option<&'a str>,
}

impl ReductionContext {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        let pending = config.enable_background;
        Self {
            config,
            write_lock: Mutex::new(()),
            write_active: AtomicUsize::new(0),
            write_overlaps: AtomicUsize::new(0),
            background: Mutex::new(BackgroundState {
                pending,
                reduced: None,
            }),
            configured: false,
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate the configuration before any file is touched.
    ///
    /// # Errors
    /// Returns `Error::Config` on an inconsistent flag set or an
    /// unusable working directory.
    pub fn configure(&mut self) -> Result<()> {
        self.config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        let dir = &self.config.working_dir;
        let meta = std::fs::metadata(dir)
            .map_err(|e| Error::Config(format!("working directory {}: {e}", dir.display())))?;
        if !meta.is_dir() || meta.permissions().readonly() {
            return Err(Error::Config(format!(
                "working directory {} is not a writable directory",
                dir.display()
            )));
        }
        self.configured = true;
        Ok(())
    }

    /// Reduce one input file, producing a results file in the working
    /// directory.
    ///
    /// The first call with background subtraction enabled also runs the
    /// background prepass, reducing the configured background file once
    /// for the whole context.
    ///
    /// # Errors
    /// Returns `Error::Config` when the context is not configured and
    /// storage errors for destination-file failures. Per-file input
    /// problems are reported as `ReductionStatus::Skipped`, not errors.
    pub fn process(&self, path: &Path, monitor: &ProgressMonitor) -> Result<ReductionStatus> {
        if !self.configured {
            return Err(Error::Config("context has not been configured".to_string()));
        }
        if !has_accepted_extension(path) {
            let reason = format!("{} does not have a data file extension", path.display());
            warn!("skipping: {reason}");
            return Ok(ReductionStatus::Skipped { reason });
        }

        let background = if self.config.enable_background {
            let mut state = self
                .background
                .lock()
                .map_err(|_| Error::Storage("background state lock poisoned".to_string()))?;
            if state.pending {
                let bg_path = self.config.background_path.clone().ok_or_else(|| {
                    Error::Config("background subtraction without a background file".to_string())
                })?;
                info!("reducing background file {}", bg_path.display());
                match self.reduce_file(&bg_path, true, None, monitor)? {
                    Outcome::Completed(reduced) => {
                        state.reduced = Some(reduced);
                        state.pending = false;
                    }
                    Outcome::Cancelled => return Ok(ReductionStatus::Cancelled),
                    Outcome::Skipped(reason) => {
                        return Err(Error::Config(format!(
                            "background file unusable: {reason}"
                        )));
                    }
                }
            }
            state.reduced.clone()
        } else {
            None
        };

        match self.reduce_file(path, false, background.as_deref(), monitor)? {
            Outcome::Completed(results) => Ok(ReductionStatus::Ok { results }),
            Outcome::Cancelled => Ok(ReductionStatus::Cancelled),
            Outcome::Skipped(reason) => {
                warn!("skipping {}: {reason}", path.display());
                Ok(ReductionStatus::Skipped { reason })
            }
        }
    }

    fn stage_flags(&self, prepass: bool) -> StageFlags<'_> {
        if prepass {
            StageFlags {
                normalisation: self.config.enable_normalisation,
                background: false,
                sector: false,
                average: true,
                invariant: false,
                plots: &[],
                selection: self.config.background_selection.as_deref(),
            }
        } else {
            StageFlags {
                normalisation: self.config.enable_normalisation,
                background: self.config.enable_background,
                sector: self.config.enable_sector,
                average: self.config.enable_average,
                invariant: self.config.enable_invariant,
                plots: &self.config.plots,
                selection: self.config.grid_average.as_deref(),
            }
        }
    }

    /// Times a destination write entered the critical section while
    /// another write was still inside. Zero as long as every results
    /// write goes through the write lock.
    #[must_use]
    pub fn write_overlaps(&self) -> usize {
        self.write_overlaps.load(Ordering::SeqCst)
    }

    fn write_guard(&self) -> Result<WriteGuard<'_>> {
        let guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Storage("write lock poisoned".to_string()))?;
        if self.write_active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.write_overlaps.fetch_add(1, Ordering::SeqCst);
        }
        Ok(WriteGuard {
            _guard: guard,
            active: &self.write_active,
        })
    }

    fn reduce_file(
        &self,
        input_path: &Path,
        prepass: bool,
        background: Option<&Path>,
        monitor: &ProgressMonitor,
    ) -> Result<Outcome> {
        let input = match ArrayStore::open(input_path) {
            Ok(store) => store,
            Err(e) => return Ok(Outcome::Skipped(format!("cannot open input: {e}"))),
        };
        let detectors: Vec<String> = self
            .config
            .detectors
            .iter()
            .map(|d| d.name.clone())
            .collect();
        let prefix = if prepass { "background" } else { "results" };
        let out_path = results_path(&self.config.working_dir, input_path, &detectors, prefix)?;

        let results = {
            let _guard = self.write_guard()?;
            create_results_file(
                &out_path,
                &input,
                &detectors,
                self.config.calibration.as_deref(),
            )?
        };

        let flags = self.stage_flags(prepass);
        for detector in &self.config.detectors {
            if monitor.is_cancelled() {
                info!("cancelled before {} pass", detector.name);
                return Ok(Outcome::Cancelled);
            }
            let pass = DetectorPass {
                ctx: self,
                input: &input,
                results: &results,
                flags: &flags,
                background,
                monitor,
            };
            match pass.run(detector) {
                Ok(true) => {}
                Ok(false) => return Ok(Outcome::Cancelled),
                Err(e) if e.is_skippable() => return Ok(Outcome::Skipped(e.to_string())),
                Err(e) => return Err(e),
            }
        }
        info!("wrote {}", out_path.display());
        Ok(Outcome::Completed(out_path))
    }
}

enum Outcome {
    Completed(PathBuf),
    Cancelled,
    Skipped(String),
}

fn has_accepted_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| ACCEPTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// One detector's pass over one input file.
struct DetectorPass<'a> {
    ctx: &'a ReductionContext,
    input: &'a ArrayStore,
    results: &'a ResultsFile,
    flags: &'a StageFlags<'a>,
    background: Option<&'a Path>,
    monitor: &'a ProgressMonitor,
}

/// Writable output datasets for one detector pass.
#[derive(Default)]
struct OutputNodes {
    normalisation: Option<SignalPair>,
    background: Option<SignalPair>,
    radial: Option<SignalPair>,
    azimuthal: Option<SignalPair>,
    invariant: Option<SignalPair>,
}

/// Frames retained for the final average, stacked at finalize time.
struct AverageCollector {
    selection: Option<Vec<usize>>,
    trailing_shape: Vec<usize>,
    values: Vec<f32>,
    errors: Option<Vec<f64>>,
    count: usize,
}

impl AverageCollector {
    fn push(&mut self, buffer: &FrameBuffer, offset: usize) -> Result<()> {
        let trailing_rank = self.trailing_shape.len();
        let frames = buffer.frame_count(trailing_rank);
        let frame_size = buffer.frame_size(trailing_rank);
        let values = buffer
            .values()
            .as_slice()
            .ok_or_else(|| Error::Storage("frame buffer is not contiguous".to_string()))?;
        let errors = buffer.errors().map(|e| {
            e.as_slice()
                .ok_or_else(|| Error::Storage("error buffer is not contiguous".to_string()))
        });
        let errors = errors.transpose()?;
        for local in 0..frames {
            let keep = self
                .selection
                .as_ref()
                .is_none_or(|s| s.binary_search(&(offset + local)).is_ok());
            if !keep {
                continue;
            }
            let range = local * frame_size..(local + 1) * frame_size;
            self.values.extend_from_slice(&values[range.clone()]);
            if let (Some(out), Some(err)) = (self.errors.as_mut(), errors) {
                out.extend_from_slice(&err[range]);
            }
            self.count += 1;
        }
        Ok(())
    }

    fn stack(self) -> Result<Option<FrameBuffer>> {
        if self.count == 0 {
            return Ok(None);
        }
        let mut shape = vec![self.count];
        shape.extend_from_slice(&self.trailing_shape);
        let values = ArrayD::from_shape_vec(IxDyn(&shape), self.values)
            .map_err(|e| Error::Storage(e.to_string()))?;
        let buffer = match self.errors {
            Some(errors) => {
                let errors = ArrayD::from_shape_vec(IxDyn(&shape), errors)
                    .map_err(|e| Error::Storage(e.to_string()))?;
                FrameBuffer::with_errors(values, errors)?
            }
            None => FrameBuffer::new(values),
        };
        Ok(Some(buffer))
    }
}

impl DetectorPass<'_> {
    /// Returns `Ok(false)` when cancellation was observed.
    #[allow(clippy::too_many_lines)]
    fn run(&self, detector: &DetectorSpec) -> Result<bool> {
        let config = self.ctx.config();
        let flags = self.flags;

        let group_path = format!("/entry1/{}", detector.name);
        let group = self.input.group(&group_path).map_err(|_| {
            Error::SkippableInput(format!(
                "{} has no {group_path} group",
                self.input.path().display()
            ))
        })?;
        let pair = match self.input.open_signal(&group) {
            Ok(pair) => pair,
            Err(Error::Hdf5(_)) => {
                return Err(Error::SkippableInput(format!(
                    "{group_path} has no data node in {}",
                    self.input.path().display()
                )));
            }
            Err(e) => return Err(e),
        };
        let shape = pair.shape();
        if shape.len() < detector.rank {
            return Err(Error::SkippableInput(format!(
                "{group_path}/data rank {} is below the detector rank {}",
                shape.len(),
                detector.rank
            )));
        }
        let grid_dims = shape.len() - detector.rank;
        let has_errors = pair.has_errors();

        // Stage construction.
        let calibration = if flags.normalisation {
            Some(self.load_calibration()?)
        } else {
            None
        };
        let mut effective_shape = shape.clone();
        if let Some(calibration) = &calibration {
            clip_to_calibration(&mut effective_shape, grid_dims, calibration.frames())?;
        }
        let normalisation = Normalisation::new(config.norm_channel, config.norm_scale());

        let subtraction = if flags.background {
            Some(BackgroundSubtraction::new(
                self.load_reduced_background(&detector.name)?,
            ))
        } else {
            None
        };

        let sector = if flags.sector {
            let geometry = config
                .sector
                .as_ref()
                .ok_or_else(|| Error::Config("sector integration without geometry".to_string()))?;
            let image = [
                effective_shape[grid_dims],
                effective_shape[grid_dims + 1],
            ];
            let mask = config.enable_mask.then_some(config.mask.as_ref()).flatten();
            Some(SectorIntegration::new(
                geometry,
                mask,
                image,
                config.enable_radial,
                config.enable_azimuthal,
            )?)
        } else {
            None
        };

        let cursor = SliceCursor::new(&effective_shape, grid_dims, config.frame_batch)?;
        let total_frames = cursor.total_frames();
        let selection = flags
            .selection
            .map(|s| parse_selection(s, total_frames))
            .transpose()?;

        // Shape of the buffer leaving the last per-frame stage.
        let trailing_shape: Vec<usize> = match &sector {
            Some(sector) => match sector.radial_bins().or(sector.azimuthal_bins()) {
                Some(bins) => vec![bins],
                None => effective_shape[grid_dims..].to_vec(),
            },
            None => effective_shape[grid_dims..].to_vec(),
        };

        let outputs = {
            let _guard = self.ctx.write_guard()?;
            self.create_outputs(
                detector,
                &effective_shape,
                grid_dims,
                total_frames,
                has_errors,
                sector.as_ref(),
            )?
        };
        let mut collector = flags.average.then(|| AverageCollector {
            selection,
            trailing_shape: trailing_shape.clone(),
            values: Vec::new(),
            errors: has_errors.then(Vec::new),
            count: 0,
        });

        for window in cursor {
            if self.monitor.is_cancelled() {
                info!("cancelled at frame boundary in {} pass", detector.name);
                return Ok(false);
            }
            let offset = window.grid_offset(&effective_shape, grid_dims);
            let frames = window.grid_frames(grid_dims);
            let mut current = self.input.read_window(&pair, &window)?;

            if let Some(calibration) = &calibration {
                let rows = calibration.window(offset, frames)?;
                current = normalisation.apply(&current, &rows, detector.rank)?;
                if let Some(out) = &outputs.normalisation {
                    let _guard = self.ctx.write_guard()?;
                    self.results.store.write_window(out, &window, &current)?;
                }
            }
            if let Some(subtraction) = &subtraction {
                current = subtraction.apply(&current)?;
                if let Some(out) = &outputs.background {
                    let _guard = self.ctx.write_guard()?;
                    self.results.store.write_window(out, &window, &current)?;
                }
            }
            if let Some(sector) = &sector {
                let profiles = sector.integrate(&current)?;
                let profile_window = profile_window(&window, grid_dims);
                if let (Some(out), Some(radial)) = (&outputs.radial, profiles.radial) {
                    let reshaped = reshape_profile(radial, &window, grid_dims)?;
                    let _guard = self.ctx.write_guard()?;
                    self.results
                        .store
                        .write_window(out, &with_bins(&profile_window, out)?, &reshaped)?;
                    current = reshaped;
                }
                if let (Some(out), Some(azimuthal)) = (&outputs.azimuthal, profiles.azimuthal) {
                    let reshaped = reshape_profile(azimuthal, &window, grid_dims)?;
                    let _guard = self.ctx.write_guard()?;
                    self.results
                        .store
                        .write_window(out, &with_bins(&profile_window, out)?, &reshaped)?;
                    if outputs.radial.is_none() {
                        current = reshaped;
                    }
                }
            }
            if let Some(out) = &outputs.invariant {
                let totals = Invariant.apply(&current, trailing_shape.len())?;
                let window = SliceWindow {
                    start: vec![offset],
                    stride: vec![1],
                    count: vec![1],
                    block: vec![frames],
                };
                let _guard = self.ctx.write_guard()?;
                self.results.store.write_window(out, &window, &totals)?;
            }
            if let Some(collector) = &mut collector {
                collector.push(&current, offset)?;
            }
            debug!(
                "{}: reduced frames {offset}..{}",
                detector.name,
                offset + frames
            );
        }

        self.finalize(detector, collector, sector.as_ref(), &trailing_shape)?;
        Ok(true)
    }

    fn load_calibration(&self) -> Result<CalibrationData> {
        let config = self.ctx.config();
        let name = config
            .calibration
            .as_ref()
            .ok_or_else(|| Error::Config("normalisation without a calibration name".to_string()))?;
        let path = format!("/entry1/{name}");
        let group = self.input.group(&path).map_err(|_| {
            Error::SkippableInput(format!(
                "{} has no {path} group",
                self.input.path().display()
            ))
        })?;
        let pair = match self.input.open_signal(&group) {
            Ok(pair) => pair,
            Err(Error::Hdf5(_)) => {
                return Err(Error::SkippableInput(format!("{path} has no data node")));
            }
            Err(e) => return Err(e),
        };
        let shape = pair.shape();
        let channels = *shape.last().ok_or_else(|| {
            Error::SkippableInput(format!("{path}/data is zero-dimensional"))
        })?;
        let rows: usize = shape[..shape.len() - 1].iter().product();

        let values = pair.data.read_raw::<f32>()?;
        let values = Array2::from_shape_vec((rows, channels), values)
            .map_err(|e| Error::Storage(e.to_string()))?;
        let errors = pair
            .errors
            .as_ref()
            .map(|e| -> Result<Array2<f64>> {
                let raw = e.read_raw::<f64>()?;
                Array2::from_shape_vec((rows, channels), raw)
                    .map_err(|e| Error::Storage(e.to_string()))
            })
            .transpose()?;
        Ok(CalibrationData::new(values, errors)?)
    }

    /// The averaged detector-shaped frame written by the background
    /// prepass.
    fn load_reduced_background(&self, detector: &str) -> Result<FrameBuffer> {
        let path = self.background.ok_or_else(|| {
            Error::Storage("background subtraction without a reduced background".to_string())
        })?;
        let store = ArrayStore::open(path)?;
        let group = store
            .group(&format!("/entry1/{detector}/{detector}_result"))
            .map_err(|_| {
                Error::Storage(format!(
                    "reduced background {} has no result for {detector}",
                    path.display()
                ))
            })?;
        let pair = store.open_signal(&group)?;
        let shape = pair.shape();
        let window = SliceWindow {
            start: vec![0; shape.len()],
            stride: vec![1; shape.len()],
            count: vec![1; shape.len()],
            block: shape.clone(),
        };
        store.read_window(&pair, &window)
    }

    fn create_outputs(
        &self,
        detector: &DetectorSpec,
        effective_shape: &[usize],
        grid_dims: usize,
        total_frames: usize,
        has_errors: bool,
        sector: Option<&SectorIntegration>,
    ) -> Result<OutputNodes> {
        let flags = self.flags;
        let store = &self.results.store;
        let det_group = store.group(&format!("/entry1/{}", detector.name))?;
        let frame_chunk: Vec<usize> = (0..effective_shape.len())
            .map(|d| if d < grid_dims { 1 } else { effective_shape[d] })
            .collect();

        let mut outputs = OutputNodes::default();
        if flags.normalisation {
            outputs.normalisation = Some(self.stage_output(
                &det_group,
                "Normalisation",
                "NORMALISATION",
                effective_shape,
                &frame_chunk,
                has_errors,
            )?);
        }
        if flags.background {
            outputs.background = Some(self.stage_output(
                &det_group,
                "BackgroundSubtraction",
                "BACKGROUND",
                effective_shape,
                &frame_chunk,
                has_errors,
            )?);
        }
        if let Some(sector) = sector {
            let group = store.create_group(&det_group, "SectorIntegration", "NXdata")?;
            set_attr_str(&group, "sas_type", "SECTOR")?;
            let geometry = sector.geometry();
            set_attr_f64(&group, "beam_center_x", geometry.centre[0])?;
            set_attr_f64(&group, "beam_center_y", geometry.centre[1])?;
            set_attr_f64(&group, "inner_radius", geometry.radii[0])?;
            set_attr_f64(&group, "outer_radius", geometry.radii[1])?;
            set_attr_f64(&group, "start_angle", geometry.angles[0])?;
            set_attr_f64(&group, "end_angle", geometry.angles[1])?;

            if let (Some(bins), Some(axis)) = (sector.radial_bins(), sector.radial_axis()) {
                let mut shape = effective_shape[..grid_dims].to_vec();
                shape.push(bins);
                let mut chunk = vec![1; grid_dims];
                chunk.push(bins);
                let data = store.create_dataset::<f32>(
                    &group, "data", &shape, Some(&chunk), true, None,
                )?;
                let errors = has_errors
                    .then(|| {
                        store.create_dataset::<f64>(&group, "errors", &shape, Some(&chunk), false, None)
                    })
                    .transpose()?;
                outputs.radial = Some(SignalPair { data, errors });
                self.write_q_axis(&group, axis)?;
            }
            if let (Some(bins), Some(axis)) = (sector.azimuthal_bins(), sector.azimuthal_axis()) {
                let mut shape = effective_shape[..grid_dims].to_vec();
                shape.push(bins);
                let mut chunk = vec![1; grid_dims];
                chunk.push(bins);
                let data = store.create_dataset::<f32>(
                    &group, "azimuth", &shape, Some(&chunk), false, None,
                )?;
                let errors = has_errors
                    .then(|| {
                        store.create_dataset::<f64>(
                            &group,
                            "azimuth_errors",
                            &shape,
                            Some(&chunk),
                            false,
                            None,
                        )
                    })
                    .transpose()?;
                outputs.azimuthal = Some(SignalPair { data, errors });
                let angle = store.create_dataset::<f64>(
                    &group,
                    "angle",
                    &[axis.len()],
                    None,
                    false,
                    Some("rad"),
                )?;
                angle.write(ArrayView1::from(axis))?;
            }
        }
        if flags.invariant {
            let group = store.create_group(&det_group, "Invariant", "NXdata")?;
            set_attr_str(&group, "sas_type", "INVARIANT")?;
            let data =
                store.create_dataset::<f32>(&group, "data", &[total_frames], None, true, None)?;
            outputs.invariant = Some(SignalPair { data, errors: None });
        }
        Ok(outputs)
    }

    fn stage_output(
        &self,
        det_group: &Group,
        name: &str,
        sas_type: &str,
        shape: &[usize],
        chunk: &[usize],
        has_errors: bool,
    ) -> Result<SignalPair> {
        let store = &self.results.store;
        let group = store.create_group(det_group, name, "NXdata")?;
        set_attr_str(&group, "sas_type", sas_type)?;
        let data = store.create_dataset::<f32>(&group, "data", shape, Some(chunk), true, None)?;
        let errors = has_errors
            .then(|| store.create_dataset::<f64>(&group, "errors", shape, Some(chunk), false, None))
            .transpose()?;
        Ok(SignalPair { data, errors })
    }

    /// Radial axis in q units when a calibration is configured, pixels
    /// otherwise.
    fn write_q_axis(&self, group: &Group, axis: &[f64]) -> Result<()> {
        let store = &self.results.store;
        match self.ctx.config().q_calibration {
            Some(qcal) => {
                let q: Vec<f64> = axis.iter().map(|&r| qcal.q_of(r)).collect();
                let dataset =
                    store.create_dataset::<f64>(group, "q", &[q.len()], None, false, Some("1/nm"))?;
                dataset.write(ArrayView1::from(q.as_slice()))?;
            }
            None => {
                let dataset = store.create_dataset::<f64>(
                    group,
                    "q",
                    &[axis.len()],
                    None,
                    false,
                    Some("pixel"),
                )?;
                dataset.write(ArrayView1::from(axis))?;
            }
        }
        Ok(())
    }

    fn q_axis_values(&self, sector: &SectorIntegration) -> Option<Vec<f64>> {
        let axis = sector.radial_axis()?;
        Some(match self.ctx.config().q_calibration {
            Some(qcal) => axis.iter().map(|&r| qcal.q_of(r)).collect(),
            None => axis.to_vec(),
        })
    }

    fn finalize(
        &self,
        detector: &DetectorSpec,
        collector: Option<AverageCollector>,
        sector: Option<&SectorIntegration>,
        trailing_shape: &[usize],
    ) -> Result<()> {
        let Some(collector) = collector else {
            return Ok(());
        };
        let Some(stacked) = collector.stack()? else {
            warn!("{}: no frames selected for averaging", detector.name);
            return Ok(());
        };
        let average = FrameAverage::new(self.ctx.config().average_mode, None);
        let averaged = average.apply(&stacked, trailing_shape.len())?;

        let store = &self.results.store;
        let result_name = format!("{}_result", detector.name);
        let mut shape = vec![1usize];
        shape.extend_from_slice(trailing_shape);

        {
            let _guard = self.ctx.write_guard()?;
            let det_group = store.group(&format!("/entry1/{}", detector.name))?;
            let group = store.create_group(&det_group, &result_name, "NXdata")?;
            set_attr_str(&group, "sas_type", "AVERAGE")?;
            let data = store.create_dataset::<f32>(&group, "data", &shape, None, true, None)?;
            let errors = averaged
                .has_errors()
                .then(|| store.create_dataset::<f64>(&group, "errors", &shape, None, false, None))
                .transpose()?;
            let out = SignalPair { data, errors };
            let window = SliceWindow {
                start: vec![0; shape.len()],
                stride: vec![1; shape.len()],
                count: vec![1; shape.len()],
                block: shape.clone(),
            };
            store.write_window(&out, &window, &averaged)?;
            if sector.is_some() {
                // Reuse the axis written with the sector profiles.
                store.link_hard(
                    &group,
                    &format!("/entry1/{}/SectorIntegration/q", detector.name),
                    "q",
                )?;
            }
        }

        if let Some(sector) = sector {
            self.write_plots(detector, &averaged, sector)?;
        }
        Ok(())
    }

    fn write_plots(
        &self,
        detector: &DetectorSpec,
        averaged: &FrameBuffer,
        sector: &SectorIntegration,
    ) -> Result<()> {
        let flags = self.flags;
        if flags.plots.is_empty() {
            return Ok(());
        }
        let Some(q) = self.q_axis_values(sector) else {
            return Ok(());
        };
        let store = &self.results.store;
        let det_group = store.group(&format!("/entry1/{}", detector.name))?;

        for &kind in flags.plots {
            let curve = transform_curve(kind, &q, None, averaged)?;
            let (axis_name, data_name) = kind.axis_names();
            let _guard = self.ctx.write_guard()?;
            let group = store.create_group(&det_group, kind.group_name(), "NXdata")?;
            set_attr_str(&group, "sas_type", kind.group_name())?;

            let axis =
                store.create_dataset::<f64>(&group, "variable", &[curve.axis.len()], None, false, None)?;
            crate::store::set_dataset_attr_str(&axis, "long_name", axis_name)?;
            axis.write(ArrayView1::from(curve.axis.as_slice()))?;

            let data = store.create_dataset::<f64>(
                &group,
                "data",
                curve.data.shape(),
                None,
                true,
                None,
            )?;
            crate::store::set_dataset_attr_str(&data, "long_name", data_name)?;
            data.write(&curve.data)?;
            if let Some(data_errors) = &curve.data_errors {
                let errors = store.create_dataset::<f64>(
                    &group,
                    "errors",
                    data_errors.shape(),
                    None,
                    false,
                    None,
                )?;
                errors.write(data_errors)?;
            }

            if kind == SaxsPlotKind::Guinier {
                self.fit_guinier(&group, &q, averaged)?;
            }
        }
        Ok(())
    }

    /// Fit the Guinier region of the averaged curve and store the fit
    /// parameters on the plot group; a failed search stores the NaN
    /// sentinel.
    fn fit_guinier(&self, group: &Group, q: &[f64], averaged: &FrameBuffer) -> Result<()> {
        let values = averaged
            .values()
            .as_slice()
            .ok_or_else(|| Error::Storage("averaged buffer is not contiguous".to_string()))?;
        let intensity: Vec<f64> = values.iter().map(|&v| f64::from(v)).collect();
        let fitter = GuinierFitter::default();
        let fit = match fitter.fit(q, &intensity) {
            Ok(fit) => fit,
            Err(e) => {
                warn!("Guinier fit not attempted: {e}");
                return Ok(());
            }
        };
        if !fit.is_converged() {
            warn!("Guinier fit did not converge");
        }
        set_attr_f64(group, "I0", fit.i0)?;
        set_attr_f64(group, "I0_stderr", fit.i0_stderr)?;
        set_attr_f64(group, "Rg", fit.rg)?;
        set_attr_f64(group, "Rg_stderr", fit.rg_stderr)?;
        set_attr_f64(group, "q_range_min", fit.q_range[0])?;
        set_attr_f64(group, "q_range_max", fit.q_range[1])?;
        Ok(())
    }
}

/// Reshape a `(frames, bins)` profile buffer to the grid blocks of its
/// source window plus a bin dimension.
fn reshape_profile(
    profile: FrameBuffer,
    window: &SliceWindow,
    grid_dims: usize,
) -> Result<FrameBuffer> {
    let bins = *profile.shape().last().ok_or_else(|| {
        Error::Storage("profile buffer is zero-dimensional".to_string())
    })?;
    let mut shape = window.block[..grid_dims].to_vec();
    shape.push(bins);
    let (values, errors) = profile.into_parts();
    let values = values
        .into_shape_with_order(IxDyn(&shape))
        .map_err(|e| Error::Storage(e.to_string()))?;
    match errors {
        Some(errors) => {
            let errors = errors
                .into_shape_with_order(IxDyn(&shape))
                .map_err(|e| Error::Storage(e.to_string()))?;
            Ok(FrameBuffer::with_errors(values, errors)?)
        }
        None => Ok(FrameBuffer::new(values)),
    }
}

/// Grid part of a data window, ready to gain a trailing bin dimension.
fn profile_window(window: &SliceWindow, grid_dims: usize) -> SliceWindow {
    SliceWindow {
        start: window.start[..grid_dims].to_vec(),
        stride: window.stride[..grid_dims].to_vec(),
        count: window.count[..grid_dims].to_vec(),
        block: window.block[..grid_dims].to_vec(),
    }
}

fn with_bins(grid_window: &SliceWindow, out: &SignalPair) -> Result<SliceWindow> {
    let bins = *out
        .shape()
        .last()
        .ok_or_else(|| Error::Storage("profile dataset is zero-dimensional".to_string()))?;
    let mut window = grid_window.clone();
    window.start.push(0);
    window.stride.push(1);
    window.count.push(1);
    window.block.push(bins);
    Ok(window)
}

/// Clip the first grid dimension so the pass covers exactly
/// `min(data_frames, calib_frames)` frames. Mismatched monitor and
/// detector scan lengths are common and must not abort the run.
fn clip_to_calibration(
    shape: &mut [usize],
    grid_dims: usize,
    calib_frames: usize,
) -> Result<()> {
    if grid_dims == 0 {
        return Ok(());
    }
    let data_frames: usize = shape[..grid_dims].iter().product();
    if calib_frames >= data_frames {
        return Ok(());
    }
    let others: usize = shape[1..grid_dims].iter().product();
    let clipped = calib_frames / others.max(1);
    if clipped == 0 {
        return Err(Error::SkippableInput(format!(
            "calibration scan of {calib_frames} frames is too short for grid shape {:?}",
            &shape[..grid_dims]
        )));
    }
    warn!(
        "clipping scan from {data_frames} to {} frames to match the calibration",
        clipped * others
    );
    shape[0] = clipped;
    Ok(())
}
