//! sasred-io: NeXus/HDF5 access and the reduction pipeline coordinator.
//!
//! [`ArrayStore`] wraps one open file with group, dataset and hyperslab
//! helpers; [`SliceCursor`] enumerates the windows a reduction pass reads;
//! [`ReductionContext`] drives the stage chain over whole input files and
//! writes linked NeXus results files.

pub mod error;
pub mod reduction;
pub mod results;
pub mod slice;
pub mod store;

pub use error::{Error, Result};
pub use reduction::{ProgressMonitor, ReductionContext, ReductionStatus};
pub use results::{create_results_file, results_path, ResultsFile};
pub use slice::{SliceCursor, SliceWindow};
pub use store::{set_attr_f64, set_attr_str, set_dataset_attr_str, ArrayStore, SignalPair};
