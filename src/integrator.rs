/// Sub-pixel flux integration for small elliptical apertures
use crate::error::{KronError, Result};
use crate::geometry::Ellipse;
use crate::image::MaskedImage;

/// Flux and its variance inside an aperture
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApertureFlux {
    pub flux: f64,
    pub variance: f64,
}

/// A precise flux integrator for apertures too small for whole-pixel sums.
///
/// Implementations must fail with [`KronError::Length`] when the aperture
/// reaches past the image.
pub trait ApertureIntegrator: Send + Sync {
    fn integrate(&self, image: &MaskedImage, aperture: &Ellipse) -> Result<ApertureFlux>;
}

/// Weights each pixel by the fraction of it covered by the aperture,
/// estimated on an `oversample x oversample` grid of sub-pixels.
#[derive(Debug, Clone, Copy)]
pub struct SubpixelIntegrator {
    pub oversample: usize,
}

impl Default for SubpixelIntegrator {
    fn default() -> Self {
        Self { oversample: 8 }
    }
}

impl SubpixelIntegrator {
    /// Fraction of pixel (x, y) inside the aperture
    pub fn coverage(&self, aperture: &Ellipse, x: i32, y: i32) -> f64 {
        let n = self.oversample.max(1);
        let step = 1.0 / n as f64;
        let mut inside = 0usize;
        for j in 0..n {
            let sy = y as f64 - 0.5 + (j as f64 + 0.5) * step;
            for i in 0..n {
                let sx = x as f64 - 0.5 + (i as f64 + 0.5) * step;
                if aperture.contains(sx, sy) {
                    inside += 1;
                }
            }
        }
        inside as f64 / (n * n) as f64
    }
}

impl ApertureIntegrator for SubpixelIntegrator {
    fn integrate(&self, image: &MaskedImage, aperture: &Ellipse) -> Result<ApertureFlux> {
        let bbox = aperture.pixel_bbox();
        if !image.bbox().contains(&bbox) {
            return Err(KronError::Length {
                aperture: *aperture,
                image: image.bbox(),
            });
        }
        if !aperture.axes.is_valid() {
            return Ok(ApertureFlux {
                flux: 0.0,
                variance: 0.0,
            });
        }

        let mut flux = 0.0;
        let mut variance = 0.0;
        for y in bbox.y_min..=bbox.y_max {
            for x in bbox.x_min..=bbox.x_max {
                let w = self.coverage(aperture, x, y);
                if w == 0.0 {
                    continue;
                }
                if let Some((value, var)) = image.pixel(x, y) {
                    flux += w * value;
                    variance += w * w * var;
                }
            }
        }
        Ok(ApertureFlux { flux, variance })
    }
}
