//! Incremental ordinary least squares over `(x, y)` pairs.

use sasred_core::{Error, Result};

/// Fitted line with standard errors on both parameters.
#[derive(Clone, Copy, Debug)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub slope_stderr: f64,
    pub intercept_stderr: f64,
    /// Pearson correlation coefficient of the fitted points.
    pub r: f64,
}

/// Sums-based simple linear regression.
///
/// Points are added one at a time so callers can fit a window of a curve
/// without materialising it.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleRegression {
    n: usize,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
}

impl SimpleRegression {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, x: f64, y: f64) {
        self.n += 1;
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xx += x * x;
        self.sum_yy += y * y;
        self.sum_xy += x * y;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.n
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// # Errors
    /// Returns `Error::InvalidInput` with fewer than three points or a
    /// degenerate x spread.
    pub fn fit(&self) -> Result<LinearFit> {
        if self.n < 3 {
            return Err(Error::InvalidInput(format!(
                "regression needs at least 3 points, got {}",
                self.n
            )));
        }
        #[allow(clippy::cast_precision_loss)]
        let n = self.n as f64;
        let mean_x = self.sum_x / n;
        let mean_y = self.sum_y / n;
        let ss_xx = self.sum_xx - n * mean_x * mean_x;
        let ss_yy = self.sum_yy - n * mean_y * mean_y;
        let ss_xy = self.sum_xy - n * mean_x * mean_y;
        if ss_xx <= 0.0 {
            return Err(Error::InvalidInput(
                "regression x values are degenerate".to_string(),
            ));
        }

        let slope = ss_xy / ss_xx;
        let intercept = mean_y - slope * mean_x;
        // Residual mean square with n - 2 degrees of freedom.
        let mse = ((ss_yy - slope * ss_xy) / (n - 2.0)).max(0.0);
        let slope_stderr = (mse / ss_xx).sqrt();
        let intercept_stderr = (mse * (1.0 / n + mean_x * mean_x / ss_xx)).sqrt();
        let r = if ss_yy > 0.0 {
            ss_xy / (ss_xx * ss_yy).sqrt()
        } else {
            0.0
        };

        Ok(LinearFit {
            slope,
            intercept,
            slope_stderr,
            intercept_stderr,
            r,
        })
    }
}
