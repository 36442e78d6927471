/// PSF estimation: Levenberg-Marquardt fits of an elliptical Gaussian to
/// bright sources, combined into a single `GaussianPsf`
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use std::f64::consts::PI;

use crate::error::{KronError, Result};
use crate::geometry::{EllipseAxes, Point2};
use crate::image::MaskedImage;
use crate::psf::{GaussianPsf, GAUSSIAN_FWHM_FACTOR};
use crate::record::SourceRecord;

/// Elliptical Gaussian on a constant background.
/// parameters: [A, B, x0, y0, sigma_x, sigma_y, theta]
pub struct GaussianProfile;

impl GaussianProfile {
    pub const N_PARAMS: usize = 7;

    pub fn value(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        let a = params[0]; // Amplitude
        let b = params[1]; // Background
        let (xp, yp) = rotated(x, y, params);
        let sigma_x = params[4];
        let sigma_y = params[5];

        let arg = -(xp * xp / (2.0 * sigma_x * sigma_x) + yp * yp / (2.0 * sigma_y * sigma_y));
        b + a * arg.exp()
    }

    pub fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]) {
        let a = params[0];
        let sigma_x = params[4];
        let sigma_y = params[5];
        let (sin_t, cos_t) = params[6].sin_cos();
        let (xp, yp) = rotated(x, y, params);

        let sx2 = sigma_x * sigma_x;
        let sy2 = sigma_y * sigma_y;
        let exp_arg = (-(xp * xp / (2.0 * sx2) + yp * yp / (2.0 * sy2))).exp();

        // d/dA
        grad[0] = exp_arg;

        // d/dB
        grad[1] = 1.0;

        // d/dx0
        grad[2] = a * exp_arg * (xp * cos_t / sx2 - yp * sin_t / sy2);

        // d/dy0
        grad[3] = a * exp_arg * (xp * sin_t / sx2 + yp * cos_t / sy2);

        // d/dsigma_x
        grad[4] = a * exp_arg * xp * xp / (sx2 * sigma_x);

        // d/dsigma_y
        grad[5] = a * exp_arg * yp * yp / (sy2 * sigma_y);

        // d/dtheta
        grad[6] = a * exp_arg * xp * yp * (1.0 / sx2 - 1.0 / sy2);
    }
}

fn rotated(x: f64, y: f64, params: &[f64]) -> (f64, f64) {
    let (sin_t, cos_t) = params[6].sin_cos();
    let dx = x - params[2];
    let dy = y - params[3];
    (dx * cos_t + dy * sin_t, -dx * sin_t + dy * cos_t)
}

/// Simple Levenberg-Marquardt optimizer with box constraints
pub struct LevenbergMarquardt {
    max_iterations: usize,
    tolerance: f64,
    lambda: f64,
    lambda_factor: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            lambda: 0.01,
            lambda_factor: 10.0,
        }
    }
}

impl LevenbergMarquardt {
    pub fn fit(
        &mut self,
        profile: &GaussianProfile,
        positions: &[(f64, f64)],
        values: &[f64],
        initial_params: &[f64],
        lower_bounds: &[f64],
        upper_bounds: &[f64],
    ) -> Result<Vec<f64>> {
        let n_params = initial_params.len();
        let n_points = positions.len();

        if n_points < n_params {
            return Err(KronError::Psf(format!(
                "Not enough data points for fitting: {} < {}",
                n_points, n_params
            )));
        }

        let sum_sq = |params: &[f64]| -> f64 {
            positions
                .iter()
                .zip(values)
                .map(|(&(x, y), observed)| (observed - profile.value(x, y, params)).powi(2))
                .sum()
        };

        let mut params = initial_params.to_vec();
        let mut best_params = params.clone();
        let mut best_error = f64::MAX;

        let mut jacobian = DMatrix::<f64>::zeros(n_points, n_params);
        let mut residuals = DVector::<f64>::zeros(n_points);
        let mut gradient = vec![0.0; n_params];

        for _iter in 0..self.max_iterations {
            let mut current_error = 0.0;
            for (i, (&(x, y), observed)) in positions.iter().zip(values).enumerate() {
                let residual = observed - profile.value(x, y, &params);
                residuals[i] = residual;
                current_error += residual * residual;

                profile.gradient(x, y, &params, &mut gradient);
                for (j, &grad) in gradient.iter().enumerate() {
                    jacobian[(i, j)] = grad;
                }
            }

            if current_error < best_error {
                best_error = current_error;
                best_params = params.clone();
            }

            if current_error < self.tolerance {
                break;
            }

            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let jtr = &jt * &residuals;

            loop {
                let mut h = jtj.clone();
                for i in 0..n_params {
                    h[(i, i)] += self.lambda * (1.0 + jtj[(i, i)]);
                }

                if let Some(delta) = h.lu().solve(&jtr) {
                    let new_params: Vec<f64> = (0..n_params)
                        .map(|i| (params[i] + delta[i]).clamp(lower_bounds[i], upper_bounds[i]))
                        .collect();

                    if sum_sq(&new_params) < current_error {
                        params = new_params;
                        self.lambda /= self.lambda_factor;
                        break;
                    }
                }

                // Rejected step or singular matrix
                self.lambda *= self.lambda_factor;
                if self.lambda > 1e10 {
                    return Ok(best_params);
                }
            }
        }

        Ok(best_params)
    }
}

/// Result of fitting one source
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct FittedPsf {
    pub amplitude: f64,
    pub background: f64,
    pub center: Point2,
    pub axes: EllipseAxes,
    /// R-squared goodness of fit
    pub r_squared: f64,
    pub rmse: f64,
}

impl FittedPsf {
    pub fn fwhm(&self) -> f64 {
        0.5 * (self.axes.a + self.axes.b) * GAUSSIAN_FWHM_FACTOR
    }
}

pub struct PsfFitter {
    /// Half-size of the fitting box
    half_size: i32,
    /// Fits worse than this are discarded when estimating a PSF
    min_r_squared: f64,
}

impl Default for PsfFitter {
    fn default() -> Self {
        Self {
            half_size: 10,
            min_r_squared: 0.8,
        }
    }
}

impl PsfFitter {
    pub fn new(half_size: i32, min_r_squared: f64) -> Self {
        Self {
            half_size,
            min_r_squared,
        }
    }

    /// Fit an elliptical Gaussian to the pixels around `center`
    pub fn fit_source(&self, image: &MaskedImage, center: Point2) -> Result<FittedPsf> {
        let cx = center.x.round() as i32;
        let cy = center.y.round() as i32;

        let mut positions = Vec::new();
        let mut values = Vec::new();
        for y in cy - self.half_size..=cy + self.half_size {
            for x in cx - self.half_size..=cx + self.half_size {
                if let Some(value) = image.get(x, y).filter(|v| v.is_finite()) {
                    positions.push((x as f64 - center.x, y as f64 - center.y));
                    values.push(value);
                }
            }
        }
        if positions.len() < 10 {
            return Err(KronError::Psf(format!(
                "Too few pixels to fit PSF at ({:.3}, {:.3})",
                center.x, center.y
            )));
        }

        let peak = values.iter().copied().fold(f64::MIN, f64::max);
        let background = median(&values);
        let box_size = (2 * self.half_size + 1) as f64;

        // Initial parameters: [A, B, x0, y0, sigma_x, sigma_y, theta]
        let initial_params = [
            (peak - background).max(f64::EPSILON),
            background,
            0.0,
            0.0,
            box_size / 8.0,
            box_size / 8.0,
            0.0,
        ];

        let offset_limit = box_size / 8.0;
        let sigma_max = box_size / 2.0;
        let lower_bounds = [
            0.0,
            background.min(0.0) - (peak - background).abs(),
            -offset_limit,
            -offset_limit,
            0.1,
            0.1,
            -PI / 2.0,
        ];
        let upper_bounds = [
            2.0 * (peak - background).abs().max(f64::EPSILON),
            peak,
            offset_limit,
            offset_limit,
            sigma_max,
            sigma_max,
            PI / 2.0,
        ];

        let mut optimizer = LevenbergMarquardt::default();
        let profile = GaussianProfile;
        let fitted = optimizer.fit(
            &profile,
            &positions,
            &values,
            &initial_params,
            &lower_bounds,
            &upper_bounds,
        )?;

        let mean_value = values.iter().sum::<f64>() / values.len() as f64;
        let mut sum_squared_residuals = 0.0;
        let mut sum_squared_total = 0.0;
        for (&(x, y), observed) in positions.iter().zip(&values) {
            sum_squared_residuals += (observed - profile.value(x, y, &fitted)).powi(2);
            sum_squared_total += (observed - mean_value).powi(2);
        }
        let r_squared = if sum_squared_total > 0.0 {
            1.0 - sum_squared_residuals / sum_squared_total
        } else {
            0.0
        };

        Ok(FittedPsf {
            amplitude: fitted[0],
            background: fitted[1],
            center: Point2::new(center.x + fitted[2], center.y + fitted[3]),
            axes: EllipseAxes::new(fitted[4].abs(), fitted[5].abs(), fitted[6]),
            r_squared,
            rmse: (sum_squared_residuals / positions.len() as f64).sqrt(),
        })
    }

    /// Fit up to `max_sources` of the brightest sources and combine the good
    /// fits into one PSF: median axes, position angle of the best fit.
    pub fn estimate(
        &self,
        image: &MaskedImage,
        sources: &[SourceRecord],
        max_sources: usize,
    ) -> Result<GaussianPsf> {
        let mut ranked: Vec<(f64, Point2)> = sources
            .iter()
            .filter_map(|s| {
                let peak = image.get(s.centroid.x.round() as i32, s.centroid.y.round() as i32)?;
                peak.is_finite().then_some((peak, s.centroid))
            })
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
        ranked.truncate(max_sources);

        let fits: Vec<FittedPsf> = ranked
            .par_iter()
            .filter_map(|&(_, center)| self.fit_source(image, center).ok())
            .filter(|fit| fit.r_squared >= self.min_r_squared)
            .collect();

        if fits.is_empty() {
            return Err(KronError::Psf(format!(
                "No usable PSF fits among {} sources",
                ranked.len()
            )));
        }

        let a = median(&fits.iter().map(|f| f.axes.a).collect::<Vec<_>>());
        let b = median(&fits.iter().map(|f| f.axes.b).collect::<Vec<_>>());
        let theta = fits
            .iter()
            .max_by(|x, y| x.r_squared.total_cmp(&y.r_squared))
            .map_or(0.0, |f| f.axes.theta);
        tracing::info!(
            "Estimated PSF from {} sources: sigma {:.3} x {:.3}, theta {:.1} deg",
            fits.len(),
            a,
            b,
            theta.to_degrees()
        );
        GaussianPsf::elliptical(EllipseAxes::new(a, b, theta))
    }
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    if n == 0 {
        f64::NAN
    } else if n % 2 == 0 {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    } else {
        sorted[n / 2]
    }
}
