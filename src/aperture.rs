/// The Kron aperture and the iterative solver that determines it
use tracing::debug;

use crate::config::KronFluxConfig;
use crate::convolve::GaussianKernel;
use crate::error::{KronError, Result};
use crate::footprint::Footprint;
use crate::geometry::{AffineTransform, Ellipse, EllipseAxes, Point2};
use crate::image::MaskedImage;
use crate::integrator::ApertureIntegrator;
use crate::moments::{estimate_mean_radius, RadialMoment};
use crate::photometry::{photometer, FluxMeasurement};
use crate::record::SourceRecord;

/// How far, in pixels, an ellipse may extend past the image and still leave
/// its pixel-centre footprint inside
const EDGE_SLACK: i32 = 2;

/// An elliptical aperture whose determinant radius is the Kron radius
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KronAperture {
    center: Point2,
    axes: EllipseAxes,
}

impl KronAperture {
    pub fn new(center: Point2, axes: EllipseAxes) -> Self {
        Self { center, axes }
    }

    /// The aperture already recorded for a source: its centroid and shape
    pub fn from_source(source: &SourceRecord) -> Result<Self> {
        let axes = checked_shape(source)?;
        Ok(Self::new(source.centroid, axes))
    }

    /// A reference source's aperture, scaled to `radius` and carried into
    /// another frame by `ref_to_meas`
    pub fn from_reference(
        reference: &SourceRecord,
        ref_to_meas: &AffineTransform,
        radius: f64,
    ) -> Result<Self> {
        let shape = checked_shape(reference)?;
        let axes = shape
            .with_determinant_radius(radius)
            .transform(ref_to_meas.linear());
        Ok(Self::new(ref_to_meas.apply(reference.centroid), axes))
    }

    pub fn center(&self) -> Point2 {
        self.center
    }

    pub fn axes(&self) -> EllipseAxes {
        self.axes
    }

    /// Kron radius of the aperture
    pub fn radius(&self) -> f64 {
        self.axes.determinant_radius()
    }

    pub fn ellipse(&self) -> Ellipse {
        Ellipse::new(self.axes, self.center)
    }

    /// Uniformly rescale the axes, keeping the axis ratio and angle
    pub fn scale(&mut self, factor: f64) {
        self.axes.scale(factor);
    }

    pub fn transform(&self, transform: &AffineTransform) -> Self {
        Self::new(
            transform.apply(self.center),
            self.axes.transform(transform.linear()),
        )
    }

    /// Estimate the Kron aperture of the object at `center`, starting from `axes`.
    ///
    /// Each iteration grows the current ellipse by `n_sigma_for_radius`,
    /// measures the first elliptical moment inside it (on a smoothed copy of the
    /// image if `smoothing_sigma > 0`) and adopts the result if it exceeds the
    /// previous estimate. `radius_for_radius` is set to the grown radius of the
    /// last footprint used, even if the solver then fails.
    pub fn determine(
        image: &MaskedImage,
        axes: EllipseAxes,
        center: Point2,
        config: &KronFluxConfig,
        radius_for_radius: &mut f64,
    ) -> Result<Self> {
        let kernel = GaussianKernel::new(config.smoothing_sigma);

        let mut axes = axes;
        let mut radius0 = axes.determinant_radius();
        for i in 0..config.n_iter_for_radius {
            let grown = axes.scaled(config.n_sigma_for_radius);
            *radius_for_radius = grown.determinant_radius();

            let moment = match ellipse_moment(image, &Ellipse::new(grown, center), &kernel) {
                Ok(moment) => moment,
                Err(e) if e.is_edge() => {
                    if i == 0 {
                        return Err(e.context("Determining Kron aperture"));
                    }
                    debug!(
                        iteration = i,
                        radius = radius0,
                        "Footprint reached the image edge; keeping previous radius"
                    );
                    break;
                }
                Err(e) => return Err(e),
            };

            if !moment.is_good() {
                return Err(KronError::BadKronIntegral);
            }

            // <r> is measured along the major axis; convert to a determinant radius
            let radius = moment.mean_radius() * grown.axis_ratio().sqrt();
            debug!(
                iteration = i,
                radius_for_radius = *radius_for_radius,
                radius,
                previous = radius0,
                "Kron radius iteration"
            );
            if radius <= radius0 {
                break;
            }
            radius0 = radius;
            axes = axes.with_determinant_radius(radius);
        }

        Ok(Self::new(center, axes.with_determinant_radius(radius0)))
    }

    /// Photometer the image inside the aperture scaled by `n_radius_for_flux`
    pub fn measure(
        &self,
        image: &MaskedImage,
        n_radius_for_flux: f64,
        max_sinc_radius: f64,
        integrator: &dyn ApertureIntegrator,
    ) -> Result<FluxMeasurement> {
        let ellipse = Ellipse::new(self.axes.scaled(n_radius_for_flux), self.center);
        photometer(image, &ellipse, max_sinc_radius, integrator)
    }
}

fn checked_shape(source: &SourceRecord) -> Result<EllipseAxes> {
    source.valid_shape().ok_or_else(|| {
        let (a, b) = source.shape.map_or((f64::NAN, f64::NAN), |s| (s.a, s.b));
        KronError::InvalidShape { a, b }
    })
}

/// First moment inside `ellipse`. Ellipses reaching well past the image fail
/// with `OutOfRange` before any pixels are visited.
fn ellipse_moment(image: &MaskedImage, ellipse: &Ellipse, kernel: &GaussianKernel) -> Result<RadialMoment> {
    let bbox = image.bbox();
    let (dx, dy) = ellipse.half_extent();
    let Point2 { x, y } = ellipse.center;
    let inside = x - dx >= (bbox.x_min - EDGE_SLACK) as f64
        && x + dx <= (bbox.x_max + EDGE_SLACK) as f64
        && y - dy >= (bbox.y_min - EDGE_SLACK) as f64
        && y + dy <= (bbox.y_max + EDGE_SLACK) as f64;
    if !inside {
        return Err(KronError::OutOfRange {
            footprint: ellipse.pixel_bbox(),
            image: bbox,
        });
    }
    let footprint = Footprint::from_ellipse(ellipse);
    radial_moment(image, &footprint, ellipse.center, &ellipse.axes, kernel)
}

/// First moment over `footprint`, smoothing the region it covers first when
/// `kernel` isn't the identity
fn radial_moment(
    image: &MaskedImage,
    footprint: &Footprint,
    center: Point2,
    axes: &EllipseAxes,
    kernel: &GaussianKernel,
) -> Result<RadialMoment> {
    let ab = axes.a / axes.b;
    if kernel.is_identity() || footprint.is_empty() {
        return estimate_mean_radius(image, footprint, center, ab, axes.theta);
    }

    // The smallest box needed to convolve the footprint, as far as the image allows
    let bbox = kernel.grow_bbox(&footprint.bbox()).clipped(&image.bbox());
    let smoothed = kernel.convolve(&image.subimage(&bbox)?);
    estimate_mean_radius(&smoothed, footprint, center, ab, axes.theta)
}
