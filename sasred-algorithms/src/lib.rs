//! sasred-algorithms: Reduction stages and curve fitting.
//!
//! Every stage is a pure transform from one [`FrameBuffer`] to a fresh one,
//! with first-order Gaussian error propagation documented per stage. The
//! Guinier fitter locates the linear low-q region of a reduced curve with a
//! derivative-free population search.
//!

pub mod average;
pub mod background;
pub mod guinier;
pub mod invariant;
pub mod normalisation;
pub mod plots;
pub mod regression;
pub mod sector;

pub use average::FrameAverage;
pub use background::BackgroundSubtraction;
pub use guinier::{GuinierFitResult, GuinierFitter};
pub use invariant::Invariant;
pub use normalisation::{CalibrationData, Normalisation};
pub use plots::{transform_curve, PlotCurve, PlotTransforms};
pub use regression::{LinearFit, SimpleRegression};
pub use sector::{SectorIntegration, SectorProfiles};

pub use sasred_core::FrameBuffer;
