//! Scattering invariant: total intensity per frame.

use ndarray::{ArrayD, IxDyn};
use sasred_core::{Error, FrameBuffer, Result};

/// Reduce each frame to the scalar sum of its intensities.
///
/// The output carries no error array; the summed intensity is reported as a
/// bare figure of merit per frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct Invariant;

impl Invariant {
    /// # Errors
    /// Returns `Error::InvalidInput` on a non-contiguous buffer.
    pub fn apply(&self, buffer: &FrameBuffer, detector_rank: usize) -> Result<FrameBuffer> {
        let frames = buffer.frame_count(detector_rank);
        let frame_size = buffer.frame_size(detector_rank);
        let values = buffer
            .values()
            .as_slice()
            .ok_or_else(|| Error::InvalidInput("frame buffer is not contiguous".to_string()))?;

        let mut totals = vec![0.0f32; frames];
        for (frame, total) in totals.iter_mut().enumerate() {
            let sum: f64 = values[frame * frame_size..(frame + 1) * frame_size]
                .iter()
                .map(|v| f64::from(*v))
                .sum();
            #[allow(clippy::cast_possible_truncation)]
            {
                *total = sum as f32;
            }
        }

        let values = ArrayD::from_shape_vec(IxDyn(&[frames]), totals)
            .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
        Ok(FrameBuffer::new(values))
    }
}
