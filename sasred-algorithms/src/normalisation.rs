//! Monitor-channel normalisation.

use log::debug;
use ndarray::{Array2, ArrayD, IxDyn};
use sasred_core::{Error, FrameBuffer, Result};

/// Per-frame calibration readings, `(frames, channels)`.
///
/// Leading grid dimensions of the source dataset are flattened row-major
/// into the frame axis, matching the order frames are visited by the slice
/// cursor.
#[derive(Clone, Debug)]
pub struct CalibrationData {
    values: Array2<f32>,
    errors: Option<Array2<f64>>,
}

impl CalibrationData {
    /// # Errors
    /// Returns `Error::ShapeMismatch` if error and value shapes differ.
    pub fn new(values: Array2<f32>, errors: Option<Array2<f64>>) -> Result<Self> {
        if let Some(errors) = &errors {
            if errors.shape() != values.shape() {
                return Err(Error::ShapeMismatch(format!(
                    "calibration errors shape {:?} does not match values {:?}",
                    errors.shape(),
                    values.shape()
                )));
            }
        }
        Ok(Self { values, errors })
    }

    #[must_use]
    pub fn frames(&self) -> usize {
        self.values.nrows()
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.values.ncols()
    }

    /// Rows `[start, start + count)` as a fresh `CalibrationData`.
    ///
    /// # Errors
    /// Returns `Error::InvalidInput` if the row range overruns the data.
    pub fn window(&self, start: usize, count: usize) -> Result<Self> {
        if start + count > self.frames() {
            return Err(Error::InvalidInput(format!(
                "calibration window {}..{} out of range for {} frames",
                start,
                start + count,
                self.frames()
            )));
        }
        let values = self.values.slice(ndarray::s![start..start + count, ..]).to_owned();
        let errors = self
            .errors
            .as_ref()
            .map(|e| e.slice(ndarray::s![start..start + count, ..]).to_owned());
        Ok(Self { values, errors })
    }

    fn reading(&self, frame: usize, channel: usize) -> (f64, f64) {
        let value = f64::from(self.values[[frame, channel]]);
        let error = self.errors.as_ref().map_or(0.0, |e| e[[frame, channel]]);
        (value, error)
    }
}

/// Normalisation stage.
///
/// `value' = scale * value / calib[channel]`, with
/// `err'^2 = (scale/calib)^2 * err^2 + value'^2 * (calib_err/calib)^2`.
/// A zero calibration reading is treated as 1 so a dropped monitor frame
/// does not wipe out the detector frame.
#[derive(Clone, Debug)]
pub struct Normalisation {
    pub channel: usize,
    pub scale: f64,
}

impl Normalisation {
    #[must_use]
    pub fn new(channel: usize, scale: f64) -> Self {
        Self { channel, scale }
    }

    /// Apply to a buffer whose flattened frame order is aligned with the
    /// calibration rows.
    ///
    /// # Errors
    /// Returns an error if the channel is missing or the calibration covers
    /// fewer frames than the buffer; frame-count clipping against a shorter
    /// monitor scan is the coordinator's responsibility.
    pub fn apply(
        &self,
        buffer: &FrameBuffer,
        calibration: &CalibrationData,
        detector_rank: usize,
    ) -> Result<FrameBuffer> {
        if self.channel >= calibration.channels() {
            return Err(Error::InvalidInput(format!(
                "calibration channel {} out of range for {} channels",
                self.channel,
                calibration.channels()
            )));
        }
        let frames = buffer.frame_count(detector_rank);
        if calibration.frames() < frames {
            return Err(Error::InvalidInput(format!(
                "calibration has {} frames, buffer has {frames}",
                calibration.frames()
            )));
        }
        let frame_size = buffer.frame_size(detector_rank);

        let values = buffer.values().as_slice().ok_or_else(|| {
            Error::InvalidInput("frame buffer is not contiguous".to_string())
        })?;
        let errors = buffer.errors().map(|e| {
            e.as_slice()
                .ok_or_else(|| Error::InvalidInput("error buffer is not contiguous".to_string()))
        });
        let errors = errors.transpose()?;

        let mut out_values = vec![0.0f32; values.len()];
        let mut out_errors = errors.map(|_| vec![0.0f64; values.len()]);

        for frame in 0..frames {
            let (mut cal, cal_err) = calibration.reading(frame, self.channel);
            if cal == 0.0 {
                debug!("zero calibration reading at frame {frame}, using 1.0");
                cal = 1.0;
            }
            let k = self.scale / cal;
            let rel_cal = cal_err / cal;
            let range = frame * frame_size..(frame + 1) * frame_size;
            for i in range {
                let v = f64::from(values[i]);
                #[allow(clippy::cast_possible_truncation)]
                {
                    out_values[i] = (k * v) as f32;
                }
                if let (Some(out), Some(err)) = (out_errors.as_mut(), errors) {
                    let e = err[i];
                    out[i] = ((k * e).powi(2) + (k * v * rel_cal).powi(2)).sqrt();
                }
            }
        }

        let shape = IxDyn(buffer.shape());
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    fn buffer(values: &[f32], errors: Option<&[f64]>, shape: &[usize]) -> FrameBuffer {
        let v = ArrayD::from_shape_vec(IxDyn(shape), values.to_vec()).unwrap();
        match errors {
            Some(e) => FrameBuffer::with_errors(
                v,
                ArrayD::from_shape_vec(IxDyn(shape), e.to_vec()).unwrap(),
            )
            .unwrap(),
            None => FrameBuffer::new(v),
        }
    }

    #[test]
    fn divides_by_calibration_channel() {
        let data = buffer(&[10.0, 10.0], Some(&[1.0, 1.0]), &[1, 2]);
        let calib =
            CalibrationData::new(arr2(&[[0.0f32, 2.0]]), None).unwrap();
        let stage = Normalisation::new(1, 1.0);
        let out = stage.apply(&data, &calib, 1).unwrap();
        assert_relative_eq!(out.values()[[0, 0]], 5.0);
        assert_relative_eq!(out.errors().unwrap()[[0, 1]], 0.5);
    }

    #[test]
    fn zero_reading_is_treated_as_unity() {
        let data = buffer(&[8.0], None, &[1, 1]);
        let calib = CalibrationData::new(arr2(&[[0.0f32]]), None).unwrap();
        let stage = Normalisation::new(0, 1.0);
        let out = stage.apply(&data, &calib, 1).unwrap();
        assert_relative_eq!(out.values()[[0, 0]], 8.0);
    }

    #[test]
    fn calibration_error_contributes() {
        // value'=5, rel calib error 0.1 -> err' = sqrt(0.5^2 + 0.5^2)
        let data = buffer(&[10.0], Some(&[1.0]), &[1, 1]);
        let calib = CalibrationData::new(
            arr2(&[[2.0f32]]),
            Some(arr2(&[[0.2f64]])),
        )
        .unwrap();
        let stage = Normalisation::new(0, 1.0);
        let out = stage.apply(&data, &calib, 1).unwrap();
        let expected = (0.25f64 + 0.25).sqrt();
        assert_relative_eq!(out.errors().unwrap()[[0, 0]], expected, epsilon = 1e-12);
    }

    #[test]
    fn short_calibration_is_rejected() {
        let data = buffer(&[1.0, 2.0], None, &[2, 1]);
        let calib = CalibrationData::new(arr2(&[[1.0f32]]), None).unwrap();
        let stage = Normalisation::new(0, 1.0);
        assert!(stage.apply(&data, &calib, 1).is_err());
    }
}
