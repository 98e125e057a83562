//! Background subtraction with trailing-shape rank matching.

use log::warn;
use ndarray::{ArrayD, IxDyn};
use sasred_core::{Error, FrameBuffer, Result};

/// Background subtraction stage.
///
/// `value' = value - background`, `err'^2 = err^2 + bg_err^2`.
///
/// The background does not have to match the data rank: shapes are aligned
/// by equality from the innermost dimension outward, and the background is
/// repeated over the data's leading dimensions. A background with leading
/// dimensions of its own is first averaged down to the common trailing
/// shape.
#[derive(Clone, Debug)]
pub struct BackgroundSubtraction {
    background: FrameBuffer,
}

impl BackgroundSubtraction {
    #[must_use]
    pub fn new(background: FrameBuffer) -> Self {
        Self { background }
    }

    #[must_use]
    pub fn background(&self) -> &FrameBuffer {
        &self.background
    }

    /// # Errors
    /// Returns `Error::ShapeMismatch` when no trailing shape is shared.
    pub fn apply(&self, buffer: &FrameBuffer) -> Result<FrameBuffer> {
        let data_shape = buffer.shape().to_vec();
        let (bg_values, bg_errors) = self.matched_background(&data_shape)?;
        let bg_len = bg_values.len();

        let values = contiguous(buffer.values())?;
        let mut out_values = vec![0.0f32; values.len()];
        for (i, v) in values.iter().enumerate() {
            out_values[i] = v - bg_values[i % bg_len];
        }

        let out_errors = match (buffer.errors(), &bg_errors) {
            (Some(errors), bg_err) => {
                let errors = errors.as_slice().ok_or_else(|| {
                    Error::InvalidInput("error buffer is not contiguous".to_string())
                })?;
                let mut out = vec![0.0f64; errors.len()];
                for (i, e) in errors.iter().enumerate() {
                    let b = bg_err.as_ref().map_or(0.0, |be| be[i % bg_len]);
                    out[i] = (e * e + b * b).sqrt();
                }
                Some(out)
            }
            (None, _) => None,
        };

        let shape = IxDyn(&data_shape);
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

    /// Flattened background aligned to the data's trailing shape.
    fn matched_background(&self, data_shape: &[usize]) -> Result<(Vec<f32>, Option<Vec<f64>>)> {
        let bg_shape = self.background.shape();
        let suffix = common_suffix(data_shape, bg_shape);
        if suffix == 0 {
            return Err(Error::ShapeMismatch(format!(
                "background shape {bg_shape:?} shares no trailing dimensions with data {data_shape:?}"
            )));
        }
        let tile: usize = bg_shape[bg_shape.len() - suffix..].iter().product();

        let bg_values = contiguous(self.background.values())?;
        let bg_errors = self
            .background
            .errors()
            .map(|e| {
                e.as_slice().ok_or_else(|| {
                    Error::InvalidInput("background error buffer is not contiguous".to_string())
                })
            })
            .transpose()?;

        let data_len: usize = data_shape.iter().product();
        if bg_values.len() == tile {
            if data_len % tile != 0 {
                return Err(Error::ShapeMismatch(format!(
                    "background size {tile} does not divide data size {data_len}"
                )));
            }
            return Ok((bg_values.to_vec(), bg_errors.map(<[f64]>::to_vec)));
        }

        // Extra leading background frames: average them down to one tile.
        warn!(
            "averaging background of shape {bg_shape:?} to trailing shape {:?}",
            &bg_shape[bg_shape.len() - suffix..]
        );
        if bg_values.len() % tile != 0 {
            return Err(Error::ShapeMismatch(format!(
                "background size {} is not a multiple of its trailing shape ({tile})",
                bg_values.len()
            )));
        }
        #[allow(clippy::cast_precision_loss)]
        let n = (bg_values.len() / tile) as f64;
        let mut avg = vec![0.0f32; tile];
        for (i, v) in bg_values.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            {
                avg[i % tile] += (f64::from(*v) / n) as f32;
            }
        }
        let avg_err = bg_errors.map(|errors| {
            let mut out = vec![0.0f64; tile];
            for (i, e) in errors.iter().enumerate() {
                out[i % tile] += e * e;
            }
            for e in &mut out {
                *e = e.sqrt() / n;
            }
            out
        });
        if data_len % tile != 0 {
            return Err(Error::ShapeMismatch(format!(
                "background size {tile} does not divide data size {data_len}"
            )));
        }
        Ok((avg, avg_err))
    }
}

fn contiguous(array: &ArrayD<f32>) -> Result<&[f32]> {
    array
        .as_slice()
        .ok_or_else(|| Error::InvalidInput("frame buffer is not contiguous".to_string()))
}

/// Length of the longest common shape suffix.
fn common_suffix(a: &[usize], b: &[usize]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}
