//! Paired value/error frame buffer, the unit of data between stages.

use crate::{Error, Result};
use ndarray::{ArrayD, IxDyn};

/// A block of detector frames with an optional paired error array.
///
/// Values are stored as `f32`, errors as `f64` standard errors of the same
/// shape. Stages consume a buffer and produce a fresh one; a buffer is never
/// mutated across a stage boundary.
#[derive(Clone, Debug)]
pub struct FrameBuffer {
    values: ArrayD<f32>,
    errors: Option<ArrayD<f64>>,
}

impl FrameBuffer {
    /// Create a buffer without errors.
    #[must_use]
    pub fn new(values: ArrayD<f32>) -> Self {
        Self {
            values,
            errors: None,
        }
    }

    /// Create a buffer with a paired error array.
    ///
    /// # Errors
    /// Returns `Error::ShapeMismatch` if the error shape differs from the
    /// value shape.
    pub fn with_errors(values: ArrayD<f32>, errors: ArrayD<f64>) -> Result<Self> {
        if values.shape() != errors.shape() {
            return Err(Error::ShapeMismatch(format!(
                "errors shape {:?} does not match data shape {:?}",
                errors.shape(),
                values.shape()
            )));
        }
        Ok(Self {
            values,
            errors: Some(errors),
        })
    }

    /// Zero-filled buffer of the given shape, with errors if requested.
    #[must_use]
    pub fn zeros(shape: &[usize], with_errors: bool) -> Self {
        let values = ArrayD::zeros(IxDyn(shape));
        let errors = with_errors.then(|| ArrayD::zeros(IxDyn(shape)));
        Self { values, errors }
    }

    #[must_use]
    pub fn values(&self) -> &ArrayD<f32> {
        &self.values
    }

    #[must_use]
    pub fn errors(&self) -> Option<&ArrayD<f64>> {
        self.errors.as_ref()
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.errors.is_some()
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of frames: product of the leading (grid) dimensions.
    ///
    /// `detector_rank` is the count of trailing image dimensions.
    #[must_use]
    pub fn frame_count(&self, detector_rank: usize) -> usize {
        let shape = self.shape();
        if detector_rank >= shape.len() {
            return 1;
        }
        shape[..shape.len() - detector_rank].iter().product()
    }

    /// Elements per frame: product of the trailing image dimensions.
    #[must_use]
    pub fn frame_size(&self, detector_rank: usize) -> usize {
        let shape = self.shape();
        let split = shape.len().saturating_sub(detector_rank);
        shape[split..].iter().product()
    }

    /// Trailing image shape.
    #[must_use]
    pub fn frame_shape(&self, detector_rank: usize) -> &[usize] {
        let shape = self.shape();
        let split = shape.len().saturating_sub(detector_rank);
        &shape[split..]
    }

    /// Decompose into value and error arrays.
    #[must_use]
    pub fn into_parts(self) -> (ArrayD<f32>, Option<ArrayD<f64>>) {
        (self.values, self.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_shape_must_match() {
        let values = ArrayD::zeros(IxDyn(&[2, 3]));
        let errors = ArrayD::zeros(IxDyn(&[2, 4]));
        assert!(FrameBuffer::with_errors(values, errors).is_err());
    }

    #[test]
    fn frame_count_and_size() {
        let buffer = FrameBuffer::zeros(&[4, 2, 16, 16], false);
        assert_eq!(buffer.frame_count(2), 8);
        assert_eq!(buffer.frame_size(2), 256);
        assert_eq!(buffer.frame_shape(2), &[16, 16]);
    }

    #[test]
    fn scalar_frame_degenerates_to_one() {
        let buffer = FrameBuffer::zeros(&[16, 16], false);
        assert_eq!(buffer.frame_count(2), 1);
    }
}
