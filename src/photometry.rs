/// Aperture photometry: whole-pixel sums for large apertures, sub-pixel
/// integration for small ones
use tracing::debug;

use crate::error::Result;
use crate::footprint::Footprint;
use crate::geometry::Ellipse;
use crate::image::MaskedImage;
use crate::integrator::ApertureIntegrator;

/// Flux and its standard deviation
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct FluxMeasurement {
    pub flux: f64,
    pub flux_sigma: f64,
}

/// Sum of image and variance over the part of a footprint inside the image
pub fn footprint_flux(image: &MaskedImage, footprint: &Footprint) -> (f64, f64) {
    let mut sum = 0.0;
    let mut sum_var = 0.0;
    footprint.for_each_pixel(image, |_, _, value, variance| {
        sum += value;
        sum_var += variance;
    });
    (sum, sum_var)
}

/// Photometer an image with a particular aperture.
///
/// Apertures whose semi-minor axis exceeds `max_sinc_radius` are summed over
/// whole pixels (clipped to the image); smaller ones go to `integrator`, whose
/// edge failures are re-raised with the aperture attached.
pub fn photometer(
    image: &MaskedImage,
    aperture: &Ellipse,
    max_sinc_radius: f64,
    integrator: &dyn ApertureIntegrator,
) -> Result<FluxMeasurement> {
    if aperture.axes.b > max_sinc_radius {
        let footprint = Footprint::from_ellipse_in(aperture, &image.bbox());
        let (flux, variance) = footprint_flux(image, &footprint);
        debug!(
            pixels = footprint.area(),
            flux, "Summed flux over aperture footprint"
        );
        return Ok(FluxMeasurement {
            flux,
            flux_sigma: variance.sqrt(),
        });
    }

    integrator
        .integrate(image, aperture)
        .map(|result| FluxMeasurement {
            flux: result.flux,
            flux_sigma: result.variance.sqrt(),
        })
        .map_err(|e| {
            if e.is_edge() {
                e.context(format!("Measuring Kron flux for object {}", aperture))
            } else {
                e
            }
        })
}
