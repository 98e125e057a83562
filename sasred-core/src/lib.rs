//! sasred-core: Core types for SAXS/WAXS data reduction.
//!
//! This crate provides the data model shared by the reduction stages and
//! the I/O layer: the paired value/error frame buffer, the immutable
//! pipeline configuration, and grid frame selection parsing.
//!

pub mod config;
pub mod error;
pub mod frame;
pub mod selection;

pub use config::{
    AverageMode, DetectorSpec, PipelineConfig, QCalibration, SaxsPlotKind, SectorGeometry,
};
pub use error::{Error, Result};
pub use frame::FrameBuffer;
pub use selection::parse_selection;
