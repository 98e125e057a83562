//! End-to-end reduction runs over synthetic NeXus files.

use approx::assert_relative_eq;
use ndarray::{ArrayD, IxDyn};
use sasred_core::{
    DetectorSpec, FrameBuffer, PipelineConfig, QCalibration, SaxsPlotKind, SectorGeometry,
};
use sasred_io::{ArrayStore, ProgressMonitor, ReductionContext, ReductionStatus, SliceCursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn new_input(path: &Path) -> ArrayStore {
    let store = ArrayStore::create(path).unwrap();
    let root = store.group("/").unwrap();
    let entry = store.create_group(&root, "entry1", "NXentry").unwrap();
    store.write_string(&entry, "title", "synthetic scan").unwrap();
    store
}

fn write_node(store: &ArrayStore, name: &str, values: ArrayD<f32>) {
    let entry = store.group("/entry1").unwrap();
    let group = store.create_group(&entry, name, "NXdata").unwrap();
    store
        .create_dataset::<f32>(&group, "data", values.shape(), None, true, None)
        .unwrap();
    let pair = store.open_signal(&group).unwrap();
    let window = SliceCursor::new(values.shape(), 0, 1)
        .unwrap()
        .next()
        .unwrap();
    store
        .write_window(&pair, &window, &FrameBuffer::new(values))
        .unwrap();
}

/// One constant-valued image per frame along the first dimension.
fn frames(shape: &[usize], value_of: impl Fn(usize) -> f32) -> ArrayD<f32> {
    ArrayD::from_shape_fn(IxDyn(shape), |idx| value_of(idx[0]))
}

fn base_config(dir: &TempDir) -> PipelineConfig {
    PipelineConfig {
        detectors: vec![DetectorSpec::new("det", 2)],
        working_dir: dir.path().to_path_buf(),
        frame_batch: 2,
        enable_average: true,
        ..PipelineConfig::default()
    }
}

fn run(config: PipelineConfig, input: &Path) -> ReductionStatus {
    let mut ctx = ReductionContext::new(config);
    ctx.configure().unwrap();
    ctx.process(input, &ProgressMonitor::new()).unwrap()
}

fn results_of(status: &ReductionStatus) -> PathBuf {
    match status {
        ReductionStatus::Ok { results } => results.clone(),
        other => panic!("expected a results file, got {other:?}"),
    }
}

fn read_data(store: &ArrayStore, path: &str) -> Vec<f32> {
    store
        .group(path)
        .unwrap()
        .dataset("data")
        .unwrap()
        .read_raw::<f32>()
        .unwrap()
}

// Expected values throughout are derived analytically from the synthetic
// inputs built above; no recorded beamline fixture is bundled with the
// tests.
#[test]
fn normalisation_average_and_invariant() {
    let dir = TempDir::new().unwrap();
    let input_path = dir.path().join("scan.nxs");
    {
        let input = new_input(&input_path);
        #[allow(clippy::cast_precision_loss)]
        write_node(&input, "det", frames(&[6, 4, 4], |i| (i + 1) as f32));
        // Channel 0 is a decoy; channel 1 divides every frame by 2.
        write_node(
            &input,
            "scaler",
            ArrayD::from_shape_fn(IxDyn(&[6, 2]), |idx| if idx[1] == 0 { 99.0 } else { 2.0 }),
        );
    }

    let config = PipelineConfig {
        calibration: Some("scaler".to_string()),
        norm_channel: 1,
        enable_normalisation: true,
        enable_invariant: true,
        ..base_config(&dir)
    };
    let status = run(config, &input_path);
    let results = ArrayStore::open(results_of(&status)).unwrap();

    let normalised = read_data(&results, "/entry1/det/Normalisation");
    assert_eq!(normalised.len(), 6 * 16);
    assert_relative_eq!(normalised[0], 0.5);
    assert_relative_eq!(normalised[5 * 16], 3.0);

    // Mean of (i+1)/2 over six frames.
    let averaged = read_data(&results, "/entry1/det/det_result");
    assert_eq!(averaged.len(), 16);
    for v in averaged {
        assert_relative_eq!(v, 1.75);
    }

    // Sum of 16 pixels at (i+1)/2.
    let invariant = read_data(&results, "/entry1/det/Invariant");
    assert_eq!(invariant.len(), 6);
    assert_relative_eq!(invariant[0], 8.0);
    assert_relative_eq!(invariant[5], 48.0);
}

#[test]
fn scan_is_clipped_to_shorter_calibration() {
    let dir = TempDir::new().unwrap();
    let input_path = dir.path().join("scan.nxs");
    {
        let input = new_input(&input_path);
        #[allow(clippy::cast_precision_loss)]
        write_node(&input, "det", frames(&[24, 2, 2], |i| i as f32));
        write_node(&input, "scaler", ArrayD::from_elem(IxDyn(&[20, 1]), 1.0));
    }

    let config = PipelineConfig {
        calibration: Some("scaler".to_string()),
        norm_channel: 0,
        enable_normalisation: true,
        ..base_config(&dir)
    };
    let status = run(config, &input_path);
    let results = ArrayStore::open(results_of(&status)).unwrap();

    // Only min(24, 20) frames are reduced.
    let normalised = results
        .group("/entry1/det/Normalisation")
        .unwrap()
        .dataset("data")
        .unwrap();
    assert_eq!(normalised.shape(), vec![20, 2, 2]);

    // Mean of 0..20.
    let averaged = read_data(&results, "/entry1/det/det_result");
    for v in averaged {
        assert_relative_eq!(v, 9.5);
    }
}

#[test]
fn background_is_reduced_once_and_subtracted() {
    let dir = TempDir::new().unwrap();
    let background_path = dir.path().join("buffer.nxs");
    {
        let background = new_input(&background_path);
        // Two frames averaging to a flat 2.0 image.
        write_node(
            &background,
            "det",
            frames(&[2, 2, 2], |i| if i == 0 { 1.0 } else { 3.0 }),
        );
    }
    let input_path = dir.path().join("scan.nxs");
    {
        let input = new_input(&input_path);
        write_node(&input, "det", frames(&[1, 2, 2], |_| 10.0));
    }

    let config = PipelineConfig {
        background_path: Some(background_path),
        enable_background: true,
        ..base_config(&dir)
    };
    let status = run(config, &input_path);
    let results = ArrayStore::open(results_of(&status)).unwrap();

    let subtracted = read_data(&results, "/entry1/det/BackgroundSubtraction");
    for v in subtracted {
        assert_relative_eq!(v, 8.0);
    }
    let averaged = read_data(&results, "/entry1/det/det_result");
    for v in averaged {
        assert_relative_eq!(v, 8.0);
    }

    // The prepass left its own reduced file in the working directory.
    let reduced: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("background_buffer_"))
        .collect();
    assert_eq!(reduced.len(), 1);
}

#[test]
fn sector_profile_of_flat_image_is_flat() {
    let dir = TempDir::new().unwrap();
    let input_path = dir.path().join("scan.nxs");
    {
        let input = new_input(&input_path);
        write_node(&input, "det", frames(&[2, 32, 32], |_| 1.0));
    }

    let config = PipelineConfig {
        sector: Some(SectorGeometry {
            centre: [16.0, 16.0],
            radii: [4.0, 10.0],
            angles: [-std::f64::consts::PI, std::f64::consts::PI],
            fold_symmetry: false,
        }),
        q_calibration: Some(QCalibration {
            gradient: 0.05,
            intercept: 0.0,
        }),
        enable_sector: true,
        enable_radial: true,
        plots: vec![SaxsPlotKind::LogNorm],
        ..base_config(&dir)
    };
    let status = run(config, &input_path);
    let results = ArrayStore::open(results_of(&status)).unwrap();

    let sector_group = results.group("/entry1/det/SectorIntegration").unwrap();
    let profiles = sector_group.dataset("data").unwrap();
    assert_eq!(profiles.shape(), vec![2, 6]);
    for v in profiles.read_raw::<f32>().unwrap() {
        assert_relative_eq!(v, 1.0, epsilon = 1e-4);
    }
    let q = sector_group.dataset("q").unwrap().read_raw::<f64>().unwrap();
    assert_eq!(q.len(), 6);
    assert_relative_eq!(q[0], 4.5 * 0.05, epsilon = 1e-12);

    let averaged = read_data(&results, "/entry1/det/det_result");
    assert_eq!(averaged.len(), 6);
    for v in averaged {
        assert_relative_eq!(v, 1.0, epsilon = 1e-4);
    }

    // log10 of a flat unit profile.
    let plot = results
        .group("/entry1/det/LogNormPlot")
        .unwrap()
        .dataset("data")
        .unwrap()
        .read_raw::<f64>()
        .unwrap();
    for v in plot {
        assert_relative_eq!(v, 0.0, epsilon = 1e-4);
    }
}

#[test]
fn wrong_extension_is_skipped() {
    let dir = TempDir::new().unwrap();
    let status = run(base_config(&dir), &dir.path().join("scan.dat"));
    assert!(matches!(status, ReductionStatus::Skipped { .. }));
}

#[test]
fn missing_detector_node_skips_the_file() {
    let dir = TempDir::new().unwrap();
    let input_path = dir.path().join("scan.nxs");
    {
        let _input = new_input(&input_path);
    }
    let status = run(base_config(&dir), &input_path);
    assert!(matches!(status, ReductionStatus::Skipped { .. }));
}

#[test]
fn cancellation_is_observed_before_frames() {
    let dir = TempDir::new().unwrap();
    let input_path = dir.path().join("scan.nxs");
    {
        let input = new_input(&input_path);
        write_node(&input, "det", frames(&[4, 2, 2], |_| 1.0));
    }
    let mut ctx = ReductionContext::new(base_config(&dir));
    ctx.configure().unwrap();
    let monitor = ProgressMonitor::new();
    monitor.cancel();
    assert!(matches!(
        ctx.process(&input_path, &monitor).unwrap(),
        ReductionStatus::Cancelled
    ));
}

#[test]
fn concurrent_workers_share_one_context() {
    let dir = TempDir::new().unwrap();
    let inputs: Vec<PathBuf> = ["scan_a.nxs", "scan_b.nxs"]
        .iter()
        .map(|name| {
            let path = dir.path().join(name);
            let input = new_input(&path);
            write_node(&input, "det", frames(&[8, 4, 4], |_| 2.0));
            path
        })
        .collect();

    let mut ctx = ReductionContext::new(base_config(&dir));
    ctx.configure().unwrap();
    let ctx = Arc::new(ctx);
    let monitor = ProgressMonitor::new();

    std::thread::scope(|scope| {
        let handles: Vec<_> = inputs
            .iter()
            .map(|path| {
                let ctx = Arc::clone(&ctx);
                let monitor = &monitor;
                scope.spawn(move || ctx.process(path, monitor).unwrap())
            })
            .collect();
        for handle in handles {
            let status = handle.join().unwrap();
            let results = ArrayStore::open(results_of(&status)).unwrap();
            for v in read_data(&results, "/entry1/det/det_result") {
                assert_relative_eq!(v, 2.0);
            }
        }
    });
}

#[test]
fn destination_writes_never_overlap() {
    let dir = TempDir::new().unwrap();
    let inputs: Vec<PathBuf> = (0..4)
        .map(|n| {
            let path = dir.path().join(format!("scan_{n}.nxs"));
            let input = new_input(&path);
            write_node(&input, "det", frames(&[16, 8, 8], |_| 1.0));
            path
        })
        .collect();

    // Small batches keep many writers contending for the lock.
    let mut ctx = ReductionContext::new(PipelineConfig {
        frame_batch: 1,
        ..base_config(&dir)
    });
    ctx.configure().unwrap();
    let ctx = Arc::new(ctx);
    let monitor = ProgressMonitor::new();

    std::thread::scope(|scope| {
        let handles: Vec<_> = inputs
            .iter()
            .map(|path| {
                let ctx = Arc::clone(&ctx);
                let monitor = &monitor;
                scope.spawn(move || ctx.process(path, monitor).unwrap())
            })
            .collect();
        for handle in handles {
            assert!(matches!(handle.join().unwrap(), ReductionStatus::Ok { .. }));
        }
    });

    assert_eq!(ctx.write_overlaps(), 0);
}
