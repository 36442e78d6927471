/// Point spread function models and the Kron quantities derived from them
use std::f64::consts::PI;

use crate::error::{KronError, Result};
use crate::geometry::{Ellipse, EllipseAxes, Point2};
use crate::image::MaskedImage;
use crate::integrator::ApertureIntegrator;
use crate::photometry::photometer;

/// Margin added around a rendered PSF before integrating it
const PSF_IMAGE_PAD: usize = 5;

/// FWHM of a Gaussian in units of sigma
pub const GAUSSIAN_FWHM_FACTOR: f64 = 2.354_820_045_030_949;

pub trait Psf: Send + Sync + std::fmt::Debug {
    /// Shape of the equivalent Gaussian at `position` (axes in units of sigma)
    fn compute_shape(&self, position: Point2) -> EllipseAxes;

    /// Rendered PSF stamp for `position`, with local origin (0, 0) and the PSF
    /// centered on pixel `(int(0.5 * (w - 1)), int(0.5 * (h - 1)))`
    fn compute_image(&self, position: Point2) -> Result<MaskedImage>;
}

/// A spatially constant elliptical Gaussian
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct GaussianPsf {
    axes: EllipseAxes,
}

impl GaussianPsf {
    /// Circular Gaussian of width `sigma`
    pub fn new(sigma: f64) -> Result<Self> {
        Self::elliptical(EllipseAxes::circle(sigma))
    }

    pub fn from_fwhm(fwhm: f64) -> Result<Self> {
        Self::new(fwhm / GAUSSIAN_FWHM_FACTOR)
    }

    pub fn elliptical(axes: EllipseAxes) -> Result<Self> {
        if !axes.is_valid() {
            return Err(KronError::Psf(format!(
                "invalid Gaussian PSF axes: a={}, b={}",
                axes.a, axes.b
            )));
        }
        Ok(Self { axes })
    }

    pub fn axes(&self) -> EllipseAxes {
        self.axes
    }

    /// Mean of the two axes, as FWHM
    pub fn fwhm(&self) -> f64 {
        0.5 * (self.axes.a + self.axes.b) * GAUSSIAN_FWHM_FACTOR
    }

    /// Half-width of the rendered stamp
    fn stamp_half_width(&self) -> usize {
        (5.0 * self.axes.a).ceil() as usize
    }

    fn value(&self, dx: f64, dy: f64) -> f64 {
        let (sin_t, cos_t) = self.axes.theta.sin_cos();
        let u = dx * cos_t + dy * sin_t;
        let v = -dx * sin_t + dy * cos_t;
        let (sa, sb) = (self.axes.a, self.axes.b);
        (-(u * u / (2.0 * sa * sa) + v * v / (2.0 * sb * sb))).exp()
    }
}

impl Psf for GaussianPsf {
    fn compute_shape(&self, _position: Point2) -> EllipseAxes {
        self.axes
    }

    fn compute_image(&self, _position: Point2) -> Result<MaskedImage> {
        let half = self.stamp_half_width();
        let size = 2 * half + 1;
        let mut image = vec![0.0; size * size];
        for (i, value) in image.iter_mut().enumerate() {
            let dx = (i % size) as f64 - half as f64;
            let dy = (i / size) as f64 - half as f64;
            *value = self.value(dx, dy);
        }

        let sum: f64 = image.iter().sum();
        if !(sum > 0.0) {
            return Err(KronError::Psf("PSF stamp has no flux".to_string()));
        }
        for value in &mut image {
            *value /= sum;
        }
        MaskedImage::from_planes(0, 0, size, size, image, vec![0.0; size * size])
    }
}

/// Kron radius a Gaussian PSF (optionally convolved with a smoothing Gaussian)
/// would have.
///
/// For a Gaussian N(0, sigma^2) the Kron radius is sqrt(pi/2)*sigma.
pub fn psf_kron_radius(psf: &dyn Psf, center: Point2, smoothing_sigma: f64) -> f64 {
    let radius = psf.compute_shape(center).determinant_radius();
    (PI / 2.0).sqrt() * radius.hypot(smoothing_sigma.max(0.0))
}

/// Flux of the (unit-normalised) PSF inside a circular aperture of radius `r_k`.
///
/// Returns 1.0 when there is no PSF.
pub fn psf_flux_factor(
    psf: Option<&dyn Psf>,
    center: Point2,
    r_k: f64,
    max_sinc_radius: f64,
    integrator: &dyn ApertureIntegrator,
) -> Result<f64> {
    let Some(psf) = psf else {
        return Ok(1.0);
    };

    let stamp = psf
        .compute_image(center)
        .map_err(|e| e.context(format!("Computing PSF at ({:.3}, {:.3})", center.x, center.y)))?;

    let width = stamp.width() + 2 * PSF_IMAGE_PAD;
    let height = stamp.height() + 2 * PSF_IMAGE_PAD;
    let mut padded = MaskedImage::new(width, height);
    let mut middle = stamp;
    middle.set_origin(PSF_IMAGE_PAD as i32, PSF_IMAGE_PAD as i32);
    padded.paste(&middle);

    // Center of a 21x21 image is (10.0, 10.0)
    let x_cen = (0.5 * (width as f64 - 1.0)) as i32;
    let y_cen = (0.5 * (height as f64 - 1.0)) as i32;
    let aperture = Ellipse::new(
        EllipseAxes::circle(r_k),
        Point2::new(x_cen as f64, y_cen as f64),
    );
    Ok(photometer(&padded, &aperture, max_sinc_radius, integrator)?.flux)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::SubpixelIntegrator;

    #[test]
    fn test_gaussian_stamp() {
        let psf = GaussianPsf::new(2.0).unwrap();
        let stamp = psf.compute_image(Point2::new(100.0, 50.0)).unwrap();
        assert_eq!(stamp.width(), 21);
        assert_eq!(stamp.height(), 21);
        let sum: f64 = stamp.image().iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);

        // Peak at the center
        let peak = stamp.get(10, 10).unwrap();
        assert!(stamp.image().iter().all(|&v| v <= peak));
    }

    #[test]
    fn test_invalid_psf() {
        assert!(GaussianPsf::new(0.0).is_err());
        assert!(matches!(GaussianPsf::new(f64::NAN), Err(KronError::Psf(_))));
    }

    #[test]
    fn test_psf_kron_radius() {
        let psf = GaussianPsf::new(2.0).unwrap();
        let center = Point2::new(10.0, 10.0);
        let expected = (PI / 2.0).sqrt() * 2.0;
        assert!((psf_kron_radius(&psf, center, -1.0) - expected).abs() < 1e-12);
        assert!((psf_kron_radius(&psf, center, 0.0) - expected).abs() < 1e-12);

        // Smoothing adds in quadrature
        let smoothed = psf_kron_radius(&psf, center, 1.5);
        assert!((smoothed - (PI / 2.0).sqrt() * 2.5).abs() < 1e-12);

        let elongated = GaussianPsf::elliptical(EllipseAxes::new(4.0, 1.0, 0.3)).unwrap();
        assert!((psf_kron_radius(&elongated, center, 0.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_psf_flux_factor() {
        let integrator = SubpixelIntegrator::default();
        let center = Point2::new(30.0, 40.0);
        assert_eq!(psf_flux_factor(None, center, 3.0, 10.0, &integrator).unwrap(), 1.0);

        let sigma = 2.0;
        let psf = GaussianPsf::new(sigma).unwrap();
        let r_k = psf_kron_radius(&psf, center, 0.0);
        let factor = psf_flux_factor(Some(&psf), center, r_k, 10.0, &integrator).unwrap();
        // Enclosed fraction of a Gaussian within sqrt(pi/2) sigma
        let expected = 1.0 - (-PI / 4.0).exp();
        assert!((factor - expected).abs() < 0.02, "factor {factor} vs {expected}");

        // A large aperture captures everything, whichever integrator is used
        let all = psf_flux_factor(Some(&psf), center, 12.0, 10.0, &integrator).unwrap();
        assert!((all - 1.0).abs() < 1e-6);
    }
}
