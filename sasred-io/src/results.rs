//! Results-file construction: naming, run metadata, raw-data links.

use crate::store::{ArrayStore, set_attr_str};
use crate::{Error, Result};
use hdf5::Group;
use log::warn;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Scalar run metadata copied verbatim from the input entry.
const METADATA_NODES: [&str; 4] = [
    "entry_identifier",
    "scan_command",
    "scan_identifier",
    "title",
];

/// An open results file with its `entry1` group.
pub struct ResultsFile {
    pub store: ArrayStore,
    pub entry: Group,
}

/// `<prefix>_<base>_<detectors>_<epoch-secs>.nxs` inside the working
/// directory.
///
/// # Errors
/// Returns `Error::Config` when the input path has no usable stem.
pub fn results_path(
    working_dir: &Path,
    input_path: &Path,
    detectors: &[String],
    prefix: &str,
) -> Result<PathBuf> {
    let base = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| {
            Error::Config(format!("input path {} has no file stem", input_path.display()))
        })?;
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    let name = format!("{prefix}_{base}_{}_{seconds}.nxs", detectors.join("_"));
    Ok(working_dir.join(name))
}

/// Create a results file with an `entry1` NXentry, copying run metadata
/// from the input and linking each detector's raw `data` (and the
/// calibration `data` when named) back to the input file.
///
/// # Errors
/// Returns `Error::Hdf5` on creation failure. Missing metadata or raw
/// nodes are logged, not fatal.
pub fn create_results_file(
    path: &Path,
    input: &ArrayStore,
    detectors: &[String],
    calibration: Option<&str>,
) -> Result<ResultsFile> {
    let store = ArrayStore::create(path)?;
    let root = store.group("/")?;
    let entry = store.create_group(&root, "entry1", "NXentry")?;

    if let Ok(input_entry) = input.group("/entry1") {
        for name in METADATA_NODES {
            match input.read_string(&input_entry, name) {
                Ok(Some(value)) => store.write_string(&entry, name, &value)?,
                Ok(None) => warn!("input has no {name} metadata"),
                Err(e) => warn!("could not copy {name}: {e}"),
            }
        }
    } else {
        warn!("input {} has no entry1 group", input.path().display());
    }

    for detector in detectors {
        let group = store.create_group(&entry, detector, "NXdata")?;
        set_attr_str(&group, "sas_type", "REDUCTION")?;
        set_attr_str(&group, "signal", "data")?;
        let raw_path = format!("/entry1/{detector}/data");
        if let Err(e) = store.link_external(&group, "data", input.path(), &raw_path) {
            warn!("could not link raw data for {detector}: {e}");
        }
    }
    if let Some(calibration) = calibration {
        let group = store.create_group(&entry, calibration, "NXmonitor")?;
        let raw_path = format!("/entry1/{calibration}/data");
        if let Err(e) = store.link_external(&group, "data", input.path(), &raw_path) {
            warn!("could not link calibration data: {e}");
        }
    }

    Ok(ResultsFile { store, entry })
}
