//! Guinier region location and fit.
//!
//! The Guinier approximation `I(q) = I0 * exp(-q^2 Rg^2 / 3)` is linear in
//! `(q^2, ln I)` coordinates at low q. The fitter searches for the interval
//! of the transformed curve whose regression correlation is closest to -1
//! using a derivative-free population search, then reports `I0` and `Rg`
//! with standard errors propagated from the regression.

use crate::regression::SimpleRegression;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use sasred_core::{Error, Result};

/// Fit of the Guinier region of one reduced curve.
///
/// A fit that failed to converge carries NaN in every field so it can be
/// stored alongside successful fits without a separate presence flag.
#[derive(Clone, Copy, Debug)]
pub struct GuinierFitResult {
    /// Forward-scattering intensity `I(0)`.
    pub i0: f64,
    pub i0_stderr: f64,
    /// Radius of gyration.
    pub rg: f64,
    pub rg_stderr: f64,
    /// Fitted interval endpoints on the q axis.
    pub q_range: [f64; 2],
    /// Correlation coefficient of the fitted interval.
    pub r: f64,
}

impl GuinierFitResult {
    /// The NaN sentinel reported when the search does not converge.
    #[must_use]
    pub fn not_converged() -> Self {
        Self {
            i0: f64::NAN,
            i0_stderr: f64::NAN,
            rg: f64::NAN,
            rg_stderr: f64::NAN,
            q_range: [f64::NAN, f64::NAN],
            r: f64::NAN,
        }
    }

    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.rg.is_finite()
    }
}

/// Population-based search for the Guinier interval.
///
/// Candidate intervals `[lo, hi]` on the `q^2` axis are scored by
/// `-ln(1 + r)` of the straight-line fit over the enclosed points,
/// which rewards correlations approaching -1. Infeasible intervals
/// (fewer than `min_points` points, or a degenerate fit) score negative
/// infinity. Each generation resamples around the elite mean with the
/// elite spread as the new step size.
#[derive(Clone, Debug)]
pub struct GuinierFitter {
    /// Smallest number of points an interval may contain.
    pub min_points: usize,
    /// Candidates per generation.
    pub population: usize,
    pub max_iterations: usize,
    /// Relative convergence tolerance on the interval endpoints.
    pub objective_tol: f64,
    /// Absolute convergence tolerance on the interval endpoints.
    pub point_tol: f64,
    /// Fixed RNG seed; entropy-seeded when absent.
    pub seed: Option<u64>,
}

impl Default for GuinierFitter {
    fn default() -> Self {
        Self {
            min_points: 50,
            population: 64,
            max_iterations: 200,
            objective_tol: 1e-6,
            point_tol: 1e-8,
            seed: None,
        }
    }
}

struct GuinierObjective<'a> {
    x: &'a [f64],
    y: &'a [f64],
    min_points: usize,
}

impl GuinierObjective<'_> {
    /// Regression over points with `lo <= x < hi`.
    fn regress(&self, lo: f64, hi: f64) -> Option<SimpleRegression> {
        let start = self.x.partition_point(|&v| v < lo);
        let end = self.x.partition_point(|&v| v < hi);
        if end.saturating_sub(start) < self.min_points {
            return None;
        }
        let mut reg = SimpleRegression::new();
        for i in start..end {
            reg.add(self.x[i], self.y[i]);
        }
        Some(reg)
    }

    fn score(&self, lo: f64, hi: f64) -> f64 {
        let Some(reg) = self.regress(lo, hi) else {
            return f64::NEG_INFINITY;
        };
        let Ok(fit) = reg.fit() else {
            return f64::NEG_INFINITY;
        };
        if fit.slope.is_nan() || fit.intercept.is_nan() || fit.r.is_nan() {
            return f64::NEG_INFINITY;
        }
        -(1.0 + fit.r).ln()
    }
}

impl GuinierFitter {
    /// Fit the Guinier region of a `(q, I)` curve.
    ///
    /// Points with non-positive or non-finite intensity are dropped before
    /// the search; q values must be ascending.
    ///
    /// # Errors
    /// Returns `Error::InvalidInput` when fewer than `min_points + 1`
    /// usable points remain. A search that exhausts its budget without a
    /// feasible interval is not an error: it yields the NaN sentinel.
    pub fn fit(&self, q: &[f64], intensity: &[f64]) -> Result<GuinierFitResult> {
        if q.len() != intensity.len() {
            return Err(Error::ShapeMismatch(format!(
                "axis has {} points, intensity has {}",
                q.len(),
                intensity.len()
            )));
        }
        let mut x = Vec::with_capacity(q.len());
        let mut y = Vec::with_capacity(q.len());
        for (&qv, &iv) in q.iter().zip(intensity) {
            if qv.is_finite() && iv.is_finite() && iv > 0.0 {
                x.push(qv * qv);
                y.push(iv.ln());
            }
        }
        if x.len() <= self.min_points {
            return Err(Error::InvalidInput(format!(
                "Guinier fit needs more than {} usable points, got {}",
                self.min_points,
                x.len()
            )));
        }

        let objective = GuinierObjective {
            x: &x,
            y: &y,
            min_points: self.min_points,
        };
        let x0 = x[0];
        let lower = [x0, x0];
        let upper = [x[1], x[x.len() - 1]];
        let mut mean = [x0, x[self.min_points]];
        let mut sigma = [(x[1] - x0) * 0.1, x[x.len() - 1] * 0.1];

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let elite_count = (self.population / 4).max(2);
        let mut best_point = mean;
        let mut best_score = objective.score(mean[0], mean[1]);

        for iteration in 0..self.max_iterations {
            let mut scored: Vec<([f64; 2], f64)> = (0..self.population)
                .map(|_| {
                    let mut candidate = [0.0f64; 2];
                    for axis in 0..2 {
                        let step: f64 = rng.sample(StandardNormal);
                        candidate[axis] =
                            (mean[axis] + sigma[axis] * step).clamp(lower[axis], upper[axis]);
                    }
                    let score = objective.score(candidate[0], candidate[1]);
                    (candidate, score)
                })
                .collect();
            scored.sort_by(|a, b| b.1.total_cmp(&a.1));
            scored.truncate(elite_count);

            if scored[0].1 > best_score {
                best_score = scored[0].1;
                best_point = scored[0].0;
            }

            let previous = mean;
            #[allow(clippy::cast_precision_loss)]
            let n = scored.len() as f64;
            for axis in 0..2 {
                let m = scored.iter().map(|(p, _)| p[axis]).sum::<f64>() / n;
                let var = scored
                    .iter()
                    .map(|(p, _)| (p[axis] - m).powi(2))
                    .sum::<f64>()
                    / n;
                mean[axis] = m;
                // Keep a floor on the step so a collapsed population can
                // still escape an infeasible region.
                sigma[axis] = var.sqrt().max(self.point_tol);
            }

            let shift = (0..2)
                .map(|axis| (mean[axis] - previous[axis]).abs())
                .fold(0.0f64, f64::max);
            let scale = mean[0].abs().max(mean[1].abs());
            if best_score > f64::NEG_INFINITY
                && shift <= self.point_tol.max(self.objective_tol * scale)
            {
                debug!("Guinier search converged after {} generations", iteration + 1);
                break;
            }
        }

        if best_score == f64::NEG_INFINITY {
            return Ok(GuinierFitResult::not_converged());
        }
        let Some(reg) = objective.regress(best_point[0], best_point[1]) else {
            return Ok(GuinierFitResult::not_converged());
        };
        let fit = reg.fit()?;

        let i0 = fit.intercept.exp();
        let rg = (-3.0 * fit.slope).sqrt();
        let rg_stderr = if rg > 0.0 {
            3.0 / (2.0 * rg) * fit.slope_stderr
        } else {
            f64::NAN
        };
        Ok(GuinierFitResult {
            i0,
            i0_stderr: i0 * fit.intercept_stderr,
            rg,
            rg_stderr,
            q_range: [best_point[0].max(0.0).sqrt(), best_point[1].max(0.0).sqrt()],
            r: fit.r,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn guinier_curve(i0: f64, rg: f64, n: usize, q_max: f64) -> (Vec<f64>, Vec<f64>) {
        let q: Vec<f64> = (1..=n)
            .map(|i| q_max * f64::from(u32::try_from(i).unwrap()) / f64::from(u32::try_from(n).unwrap()))
            .collect();
        let i = q
            .iter()
            .map(|&q| i0 * (-q * q * rg * rg / 3.0).exp())
            .collect();
        (q, i)
    }

    #[test]
    fn recovers_parameters_of_ideal_curve() {
        let (q, i) = guinier_curve(120.0, 25.0, 400, 0.05);
        let fitter = GuinierFitter {
            seed: Some(42),
            ..GuinierFitter::default()
        };
        let fit = fitter.fit(&q, &i).unwrap();
        assert!(fit.is_converged());
        assert_relative_eq!(fit.rg, 25.0, epsilon = 1.0);
        assert_relative_eq!(fit.i0, 120.0, max_relative = 0.05);
        assert!(fit.r < -0.99);
    }

    #[test]
    fn too_few_points_is_an_error() {
        let (q, i) = guinier_curve(1.0, 10.0, 30, 0.1);
        assert!(GuinierFitter::default().fit(&q, &i).is_err());
    }

    #[test]
    fn non_positive_intensities_are_dropped() {
        let (q, mut i) = guinier_curve(50.0, 15.0, 300, 0.08);
        i[10] = -1.0;
        i[20] = 0.0;
        let fitter = GuinierFitter {
            seed: Some(7),
            ..GuinierFitter::default()
        };
        let fit = fitter.fit(&q, &i).unwrap();
        assert!(fit.is_converged());
        assert_relative_eq!(fit.rg, 15.0, epsilon = 1.0);
    }

    #[test]
    fn sentinel_result_is_all_nan() {
        let sentinel = GuinierFitResult::not_converged();
        assert!(!sentinel.is_converged());
        assert!(sentinel.i0.is_nan());
        assert!(sentinel.q_range[0].is_nan());
    }
}
