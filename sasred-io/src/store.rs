//! HDF5/NeXus array-store session: groups, chunked datasets, hyperslab
//! windows and link creation.

use crate::slice::SliceWindow;
use crate::{Error, Result};
use hdf5::types::{H5Type, VarLenUnicode};
use hdf5::{Dataset, File, Group};
use ndarray::{IxDyn, SliceInfo, SliceInfoElem};
use sasred_core::FrameBuffer;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A `data` dataset with its optional `errors` sibling.
///
/// The invariant that errors match the data shape is enforced once at
/// open time; every window read then yields a shape-consistent buffer.
pub struct SignalPair {
    pub data: Dataset,
    pub errors: Option<Dataset>,
}

impl SignalPair {
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        self.data.shape()
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.errors.is_some()
    }
}

/// An open hierarchical file with scoped creation and hyperslab I/O
/// helpers. Dropping the store closes every handle it produced.
pub struct ArrayStore {
    file: File,
    path: PathBuf,
}

impl ArrayStore {
    /// Create a new file, truncating any existing one.
    ///
    /// # Errors
    /// Returns `Error::Hdf5` when the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Open an existing file read-only.
    ///
    /// # Errors
    /// Returns `Error::Hdf5` when the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Open an existing file for read-write.
    ///
    /// # Errors
    /// Returns `Error::Hdf5` when the file cannot be opened.
    pub fn open_rw<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open_rw(&path)?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a group by absolute path within the file.
    ///
    /// # Errors
    /// Returns `Error::Hdf5` when the group does not exist.
    pub fn group(&self, path: &str) -> Result<Group> {
        Ok(self.file.group(path)?)
    }

    /// Create a named group tagged with its NeXus class attribute.
    ///
    /// # Errors
    /// Returns `Error::Hdf5` on creation failure.
    pub fn create_group(&self, parent: &Group, name: &str, nx_class: &str) -> Result<Group> {
        let group = parent.create_group(name)?;
        set_attr_str(&group, "NX_class", nx_class)?;
        Ok(group)
    }

    /// Create a chunked dataset, optionally marking it as the group signal
    /// and attaching a units attribute.
    ///
    /// # Errors
    /// Returns `Error::Hdf5` on creation failure.
    pub fn create_dataset<T: H5Type>(
        &self,
        parent: &Group,
        name: &str,
        shape: &[usize],
        chunk: Option<&[usize]>,
        signal: bool,
        units: Option<&str>,
    ) -> Result<Dataset> {
        let mut builder = parent.new_dataset::<T>().shape(shape);
        if let Some(chunk) = chunk {
            builder = builder.chunk(chunk.to_vec());
        }
        let dataset = builder.create(name)?;
        if signal {
            set_attr_str(parent, "signal", name)?;
        }
        if let Some(units) = units {
            set_dataset_attr_str(&dataset, "units", units)?;
        }
        Ok(dataset)
    }

    /// Open a group's `data` dataset and its `errors` sibling if present.
    ///
    /// # Errors
    /// Returns `Error::Storage` when the errors shape disagrees with the
    /// data shape, `Error::Hdf5` when `data` is missing.
    pub fn open_signal(&self, group: &Group) -> Result<SignalPair> {
        let data = group.dataset("data")?;
        let errors = match group.dataset("errors") {
            Ok(errors) => {
                if errors.shape() != data.shape() {
                    return Err(Error::Storage(format!(
                        "errors shape {:?} does not match data shape {:?} in {}",
                        errors.shape(),
                        data.shape(),
                        group.name()
                    )));
                }
                Some(errors)
            }
            Err(_) => None,
        };
        Ok(SignalPair { data, errors })
    }

    /// Read one hyperslab window into a freshly allocated buffer.
    ///
    /// # Errors
    /// Returns `Error::Storage` on an out-of-range window.
    pub fn read_window(&self, pair: &SignalPair, window: &SliceWindow) -> Result<FrameBuffer> {
        window.validate(&pair.shape())?;
        let values = pair
            .data
            .read_slice::<f32, _, IxDyn>(selection(window)?)?;
        match &pair.errors {
            Some(errors) => {
                let errors = errors.read_slice::<f64, _, IxDyn>(selection(window)?)?;
                Ok(FrameBuffer::with_errors(values, errors)?)
            }
            None => Ok(FrameBuffer::new(values)),
        }
    }

    /// Write one buffer back at the given window coordinates.
    ///
    /// Callers sharing a destination file must hold the run's write lock
    /// around this call.
    ///
    /// # Errors
    /// Returns `Error::Storage` on a window/buffer shape disagreement.
    pub fn write_window(
        &self,
        pair: &SignalPair,
        window: &SliceWindow,
        buffer: &FrameBuffer,
    ) -> Result<()> {
        window.validate(&pair.shape())?;
        if buffer.shape() != window.shape().as_slice() {
            return Err(Error::Storage(format!(
                "buffer shape {:?} does not match window shape {:?}",
                buffer.shape(),
                window.shape()
            )));
        }
        pair.data.write_slice(buffer.values(), selection(window)?)?;
        if let (Some(errors), Some(buffer_errors)) = (&pair.errors, buffer.errors()) {
            errors.write_slice(buffer_errors, selection(window)?)?;
        }
        Ok(())
    }

    /// Reference a node of another file from `parent` without copying.
    ///
    /// # Errors
    /// Returns `Error::Hdf5` on link creation failure.
    pub fn link_external(
        &self,
        parent: &Group,
        link_name: &str,
        target_file: &Path,
        target_path: &str,
    ) -> Result<()> {
        let target = target_file.to_string_lossy();
        parent.link_external(&target, target_path, link_name)?;
        Ok(())
    }

    /// Hard-link an already written node to a second name.
    ///
    /// # Errors
    /// Returns `Error::Hdf5` on link creation failure.
    pub fn link_hard(&self, parent: &Group, source_path: &str, link_name: &str) -> Result<()> {
        parent.link_hard(source_path, link_name)?;
        Ok(())
    }

    /// Write a scalar string dataset, replacing nothing.
    ///
    /// # Errors
    /// Returns `Error::Hdf5` on write failure.
    pub fn write_string(&self, parent: &Group, name: &str, value: &str) -> Result<()> {
        let value = to_var_len_unicode(value)?;
        parent
            .new_dataset::<VarLenUnicode>()
            .create(name)?
            .write_scalar(&value)?;
        Ok(())
    }

    /// Read a scalar string dataset, `None` when absent.
    ///
    /// # Errors
    /// Returns `Error::Hdf5` when the node exists but cannot be read.
    pub fn read_string(&self, parent: &Group, name: &str) -> Result<Option<String>> {
        match parent.dataset(name) {
            Ok(dataset) => {
                let value: VarLenUnicode = dataset.read_scalar()?;
                Ok(Some(value.to_string()))
            }
            Err(_) => Ok(None),
        }
    }
}

/// Contiguous hyperslab selection for a cursor window.
fn selection(window: &SliceWindow) -> Result<SliceInfo<Vec<SliceInfoElem>, IxDyn, IxDyn>> {
    let elems: Vec<SliceInfoElem> = window
        .start
        .iter()
        .zip(&window.block)
        .map(|(&start, &block)| {
            #[allow(clippy::cast_possible_wrap)]
            SliceInfoElem::Slice {
                start: start as isize,
                end: Some((start + block) as isize),
                step: 1,
            }
        })
        .collect();
    SliceInfo::try_from(elems).map_err(|e| Error::Storage(format!("invalid window selection: {e}")))
}

/// Set a string attribute on a group.
///
/// # Errors
/// Returns `Error::Hdf5` on attribute creation failure.
pub fn set_attr_str(group: &Group, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    group
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

/// Set a string attribute on a dataset.
///
/// # Errors
/// Returns `Error::Hdf5` on attribute creation failure.
pub fn set_dataset_attr_str(dataset: &Dataset, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    dataset
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

/// Set a scalar f64 attribute on a group.
///
/// # Errors
/// Returns `Error::Hdf5` on attribute creation failure.
pub fn set_attr_f64(group: &Group, name: &str, value: f64) -> Result<()> {
    group
        .new_attr::<f64>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value)
        .map_err(|e| Error::Storage(format!("invalid utf-8 attribute: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::SliceCursor;
    use approx::assert_relative_eq;
    use ndarray::ArrayD;
    use tempfile::TempDir;

    fn new_store(dir: &TempDir, name: &str) -> ArrayStore {
        ArrayStore::create(dir.path().join(name)).unwrap()
    }

    #[test]
    fn window_roundtrip_preserves_values_and_errors() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir, "roundtrip.nxs");
        let root = store.group("/").unwrap();
        let entry = store.create_group(&root, "entry1", "NXentry").unwrap();
        let det = store.create_group(&entry, "det", "NXdata").unwrap();

        let shape = [4usize, 3, 3];
        store
            .create_dataset::<f32>(&det, "data", &shape, Some(&[1, 3, 3]), true, Some("counts"))
            .unwrap();
        store
            .create_dataset::<f64>(&det, "errors", &shape, Some(&[1, 3, 3]), false, None)
            .unwrap();
        let pair = store.open_signal(&det).unwrap();

        for window in SliceCursor::new(&shape, 1, 2).unwrap() {
            let wshape = window.shape();
            let n: usize = wshape.iter().product();
            #[allow(clippy::cast_precision_loss)]
            let values = ArrayD::from_shape_vec(
                IxDyn(&wshape),
                (0..n).map(|i| (i + window.start[0]) as f32).collect(),
            )
            .unwrap();
            let errors = ArrayD::from_elem(IxDyn(&wshape), 0.25f64);
            let buffer = FrameBuffer::with_errors(values, errors).unwrap();
            store.write_window(&pair, &window, &buffer).unwrap();
        }

        let full = SliceCursor::new(&shape, 0, 1).unwrap().next().unwrap();
        let read = store.read_window(&pair, &full).unwrap();
        assert_eq!(read.shape(), &shape);
        assert_relative_eq!(read.values()[[0, 0, 1]], 1.0);
        assert_relative_eq!(read.errors().unwrap()[[3, 2, 2]], 0.25);
    }

    #[test]
    fn mismatched_errors_shape_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir, "mismatch.nxs");
        let root = store.group("/").unwrap();
        let det = store.create_group(&root, "det", "NXdata").unwrap();
        store
            .create_dataset::<f32>(&det, "data", &[2, 4], None, true, None)
            .unwrap();
        store
            .create_dataset::<f64>(&det, "errors", &[2, 5], None, false, None)
            .unwrap();
        assert!(matches!(
            store.open_signal(&det),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn out_of_range_window_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir, "range.nxs");
        let root = store.group("/").unwrap();
        let det = store.create_group(&root, "det", "NXdata").unwrap();
        store
            .create_dataset::<f32>(&det, "data", &[2, 4], None, true, None)
            .unwrap();
        let pair = store.open_signal(&det).unwrap();
        let window = SliceWindow {
            start: vec![1, 0],
            stride: vec![1, 1],
            count: vec![1, 1],
            block: vec![2, 4],
        };
        assert!(store.read_window(&pair, &window).is_err());
    }

    #[test]
    fn external_link_resolves_source_data() {
        let dir = TempDir::new().unwrap();
        let source = new_store(&dir, "source.nxs");
        let root = source.group("/").unwrap();
        let det = source.create_group(&root, "det", "NXdata").unwrap();
        source
            .create_dataset::<f32>(&det, "data", &[2], None, true, None)
            .unwrap();
        let pair = source.open_signal(&det).unwrap();
        let window = SliceCursor::new(&[2], 0, 1).unwrap().next().unwrap();
        let buffer = FrameBuffer::new(ArrayD::from_shape_vec(IxDyn(&[2]), vec![1.0, 2.0]).unwrap());
        source.write_window(&pair, &window, &buffer).unwrap();
        drop(pair);
        drop(source);

        let results = new_store(&dir, "results.nxs");
        let root = results.group("/").unwrap();
        let group = results.create_group(&root, "linked", "NXdata").unwrap();
        results
            .link_external(&group, "data", &dir.path().join("source.nxs"), "/det/data")
            .unwrap();

        let linked = results.group("/linked").unwrap();
        let read = linked.dataset("data").unwrap().read_raw::<f32>().unwrap();
        assert_eq!(read, vec![1.0, 2.0]);
    }

    #[test]
    fn string_metadata_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = new_store(&dir, "meta.nxs");
        let root = store.group("/").unwrap();
        let entry = store.create_group(&root, "entry1", "NXentry").unwrap();
        store.write_string(&entry, "title", "latex spheres").unwrap();
        assert_eq!(
            store.read_string(&entry, "title").unwrap().as_deref(),
            Some("latex spheres")
        );
        assert!(store.read_string(&entry, "missing").unwrap().is_none());
    }
}
