//! Scattering-law plot transforms of a reduced `(q, I)` curve.

use ndarray::{ArrayD, Dimension};
use sasred_core::{Error, FrameBuffer, Result, SaxsPlotKind};

/// A transformed curve: per-bin axis plus per-frame data of the same
/// bin count.
#[derive(Clone, Debug)]
pub struct PlotCurve {
    pub kind: SaxsPlotKind,
    /// Transformed axis, one value per bin.
    pub axis: Vec<f64>,
    /// Propagated axis errors, present when q errors were supplied.
    pub axis_errors: Option<Vec<f64>>,
    /// Transformed intensities, same shape as the input values.
    pub data: ArrayD<f64>,
    pub data_errors: Option<ArrayD<f64>>,
}

/// The per-kind `{axis, axis_error, data, data_error}` transform table.
///
/// Undefined results (logarithms of non-positive intensities, reciprocals
/// of zero) come out as NaN and are left for the plotting client to elide,
/// matching the convention of the upstream analysis tools.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlotTransforms;

impl PlotTransforms {
    fn axis(kind: SaxsPlotKind, q: f64) -> f64 {
        match kind {
            SaxsPlotKind::LogNorm | SaxsPlotKind::Porod | SaxsPlotKind::Kratky => q,
            SaxsPlotKind::LogLog => q.log10(),
            SaxsPlotKind::Guinier | SaxsPlotKind::Zimm | SaxsPlotKind::DebyeBueche => q * q,
        }
    }

    fn axis_error(kind: SaxsPlotKind, q: f64, q_err: f64) -> f64 {
        match kind {
            SaxsPlotKind::LogNorm | SaxsPlotKind::Porod | SaxsPlotKind::Kratky => q_err,
            SaxsPlotKind::LogLog => q_err / q,
            SaxsPlotKind::Guinier | SaxsPlotKind::Zimm | SaxsPlotKind::DebyeBueche => {
                2.0 * q * q_err
            }
        }
    }

    fn data(kind: SaxsPlotKind, q: f64, i: f64) -> f64 {
        match kind {
            SaxsPlotKind::LogNorm | SaxsPlotKind::LogLog => i.log10(),
            SaxsPlotKind::Guinier => i.ln(),
            SaxsPlotKind::Porod => q.powi(4) * i,
            SaxsPlotKind::Kratky => q * q * i,
            SaxsPlotKind::Zimm => 1.0 / i,
            SaxsPlotKind::DebyeBueche => i.powf(-0.5),
        }
    }

    fn data_error(kind: SaxsPlotKind, q: f64, q_err: f64, i: f64, i_err: f64) -> f64 {
        match kind {
            SaxsPlotKind::LogNorm | SaxsPlotKind::LogLog | SaxsPlotKind::Guinier => i_err / i,
            SaxsPlotKind::Porod => {
                ((4.0 * q.powi(3) * i * q_err).powi(2) + (q.powi(4) * i_err).powi(2)).sqrt()
            }
            SaxsPlotKind::Kratky => {
                ((2.0 * q * i * q_err).powi(2) + (q * q * i_err).powi(2)).sqrt()
            }
            SaxsPlotKind::Zimm => i_err / (i * i),
            SaxsPlotKind::DebyeBueche => 0.5 * i.powf(-1.5) * i_err,
        }
    }
}

/// Transform a reduced curve into the coordinates of one plot kind.
///
/// `buffer` is `(frames, bins)` intensities; `q` and `q_errors` run over the
/// bins.
///
/// # Errors
/// Returns `Error::ShapeMismatch` when the axis length disagrees with the
/// trailing dimension of the data.
pub fn transform_curve(
    kind: SaxsPlotKind,
    q: &[f64],
    q_errors: Option<&[f64]>,
    buffer: &FrameBuffer,
) -> Result<PlotCurve> {
    let bins = *buffer.shape().last().unwrap_or(&0);
    if bins != q.len() {
        return Err(Error::ShapeMismatch(format!(
            "axis has {} bins, data trailing dimension is {bins}",
            q.len()
        )));
    }
    if let Some(q_errors) = q_errors {
        if q_errors.len() != q.len() {
            return Err(Error::ShapeMismatch(format!(
                "axis errors have {} bins, axis has {}",
                q_errors.len(),
                q.len()
            )));
        }
    }

    let axis: Vec<f64> = q.iter().map(|&q| PlotTransforms::axis(kind, q)).collect();
    let axis_errors = q_errors.map(|errs| {
        q.iter()
            .zip(errs)
            .map(|(&q, &e)| PlotTransforms::axis_error(kind, q, e))
            .collect()
    });

    let data = ArrayD::from_shape_fn(buffer.values().raw_dim(), |idx| {
        let bin = idx[idx.ndim() - 1];
        PlotTransforms::data(kind, q[bin], f64::from(buffer.values()[&idx]))
    });
    let data_errors = buffer.errors().map(|errors| {
        ArrayD::from_shape_fn(errors.raw_dim(), |idx| {
            let bin = idx[idx.ndim() - 1];
            let q_err = q_errors.map_or(0.0, |e| e[bin]);
            PlotTransforms::data_error(
                kind,
                q[bin],
                q_err,
                f64::from(buffer.values()[&idx]),
                errors[&idx],
            )
        })
    });

    Ok(PlotCurve {
        kind,
        axis,
        axis_errors,
        data,
        data_errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{ArrayD, IxDyn};

    fn curve(values: &[f32], errors: Option<&[f64]>, bins: usize) -> FrameBuffer {
        let shape = IxDyn(&[1, bins]);
        let v = ArrayD::from_shape_vec(shape.clone(), values.to_vec()).unwrap();
        match errors {
            Some(e) => {
                FrameBuffer::with_errors(v, ArrayD::from_shape_vec(shape, e.to_vec()).unwrap())
                    .unwrap()
            }
            None => FrameBuffer::new(v),
        }
    }

    #[test]
    fn guinier_transform_squares_axis_and_logs_data() {
        let data = curve(&[std::f64::consts::E as f32], Some(&[0.5]), 1);
        let out = transform_curve(SaxsPlotKind::Guinier, &[2.0], Some(&[0.1]), &data).unwrap();
        assert_relative_eq!(out.axis[0], 4.0);
        assert_relative_eq!(out.axis_errors.as_ref().unwrap()[0], 0.4);
        assert_relative_eq!(out.data[[0, 0]], 1.0, epsilon = 1e-6);
        // err / value
        assert_relative_eq!(
            out.data_errors.as_ref().unwrap()[[0, 0]],
            0.5 / std::f64::consts::E,
            epsilon = 1e-6
        );
    }

    #[test]
    fn porod_transform_scales_by_q4() {
        let data = curve(&[2.0], Some(&[0.0]), 1);
        let out = transform_curve(SaxsPlotKind::Porod, &[3.0], None, &data).unwrap();
        assert_relative_eq!(out.axis[0], 3.0);
        assert_relative_eq!(out.data[[0, 0]], 162.0);
    }

    #[test]
    fn non_positive_intensity_becomes_nan() {
        let data = curve(&[-1.0], None, 1);
        let out = transform_curve(SaxsPlotKind::LogNorm, &[1.0], None, &data).unwrap();
        assert!(out.data[[0, 0]].is_nan());
    }

    #[test]
    fn axis_length_mismatch_is_rejected() {
        let data = curve(&[1.0, 2.0], None, 2);
        assert!(transform_curve(SaxsPlotKind::Kratky, &[1.0], None, &data).is_err());
    }
}
