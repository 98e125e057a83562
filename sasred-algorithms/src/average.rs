//! Frame averaging over leading grid dimensions.

use ndarray::{ArrayD, IxDyn};
use sasred_core::{AverageMode, Error, FrameBuffer, Result};

/// Average selected frames down to a single frame, `[1, trailing...]`.
///
/// Plain mode: `value' = sum(v)/n`, `err'^2 = sum(err^2)/n^2`.
/// Weighted mode uses inverse-variance weights `w = 1/err^2`, so
/// `value' = sum(w v)/sum(w)` and `err' = 1/sqrt(sum(w))`; frames without
/// errors fall back to plain averaging.
#[derive(Clone, Debug)]
pub struct FrameAverage {
    mode: AverageMode,
    /// Flattened frame indices to include, or every frame when `None`.
    selection: Option<Vec<usize>>,
}

impl FrameAverage {
    #[must_use]
    pub fn new(mode: AverageMode, selection: Option<Vec<usize>>) -> Self {
        Self { mode, selection }
    }

    /// # Errors
    /// Returns `Error::InvalidSelection` when a selected index is out of
    /// range and `Error::InvalidInput` when no frame survives selection.
    pub fn apply(&self, buffer: &FrameBuffer, detector_rank: usize) -> Result<FrameBuffer> {
        let frames = buffer.frame_count(detector_rank);
        let frame_size = buffer.frame_size(detector_rank);
        let selected: Vec<usize> = match &self.selection {
            Some(indices) => {
                if let Some(&bad) = indices.iter().find(|&&i| i >= frames) {
                    return Err(Error::InvalidSelection {
                        selection: format!("{bad}"),
                        reason: format!("frame index out of range for {frames} frames"),
                    });
                }
                indices.clone()
            }
            None => (0..frames).collect(),
        };
        if selected.is_empty() {
            return Err(Error::InvalidInput(
                "no frames selected for averaging".to_string(),
            ));
        }

        let values = buffer
            .values()
            .as_slice()
            .ok_or_else(|| Error::InvalidInput("frame buffer is not contiguous".to_string()))?;
        let errors = buffer
            .errors()
            .map(|e| {
                e.as_slice().ok_or_else(|| {
                    Error::InvalidInput("error buffer is not contiguous".to_string())
                })
            })
            .transpose()?;

        let weighted = self.mode == AverageMode::Weighted && errors.is_some();
        #[allow(clippy::cast_precision_loss)]
        let n = selected.len() as f64;

        let mut sum = vec![0.0f64; frame_size];
        let mut var = vec![0.0f64; frame_size];
        let mut weight = vec![0.0f64; frame_size];
        for &frame in &selected {
            let base = frame * frame_size;
            for i in 0..frame_size {
                let v = f64::from(values[base + i]);
                if weighted {
                    let e = errors.map_or(0.0, |err| err[base + i]);
                    let w = if e > 0.0 { 1.0 / (e * e) } else { 1.0 };
                    sum[i] += w * v;
                    weight[i] += w;
                } else {
                    sum[i] += v;
                    if let Some(err) = errors {
                        let e = err[base + i];
                        var[i] += e * e;
                    }
                }
            }
        }

        let mut out_values = vec![0.0f32; frame_size];
        let mut out_errors = errors.map(|_| vec![0.0f64; frame_size]);
        for i in 0..frame_size {
            #[allow(clippy::cast_possible_truncation)]
            if weighted {
                out_values[i] = (sum[i] / weight[i]) as f32;
                if let Some(out) = out_errors.as_mut() {
                    out[i] = 1.0 / weight[i].sqrt();
                }
            } else {
                out_values[i] = (sum[i] / n) as f32;
                if let Some(out) = out_errors.as_mut() {
                    out[i] = var[i].sqrt() / n;
                }
            }
        }

        let mut out_shape = vec![1usize];
        out_shape.extend_from_slice(buffer.frame_shape(detector_rank));
        let shape = IxDyn(&out_shape);
        let values = ArrayD::from_shape_vec(shape.clone(), out_values)
            .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
        match out_errors {
            Some(err) => {
                let errors = ArrayD::from_shape_vec(shape, err)
                    .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
                FrameBuffer::with_errors(values, errors)
            }
            None => Ok(FrameBuffer::new(values)),
        }
    }
}
