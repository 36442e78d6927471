/// First elliptical moment of a source's light
use crate::error::{KronError, Result};
use crate::footprint::Footprint;
use crate::geometry::Point2;
use crate::image::MaskedImage;

/// <r> for a single square pixel about its own center
const PIXEL_MEAN_RADIUS: f64 = 0.38259771140356325;

/// Accumulated sums of I and r*I over a footprint
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RadialMoment {
    pub sum: f64,
    pub sum_r: f64,
}

impl RadialMoment {
    /// Flux-weighted mean elliptical radius, measured along the major axis
    pub fn mean_radius(&self) -> f64 {
        self.sum_r / self.sum
    }

    /// Can the measurement be trusted?
    pub fn is_good(&self) -> bool {
        self.sum > 0.0 && self.sum_r > 0.0
    }
}

/// Elliptical radius of pixel (x, y), the length of the major axis of the
/// ellipse of the given shape passing through the pixel center.
///
/// `ab` is the axis ratio a/b and `theta` the major axis angle from x.
pub fn elliptical_radius(x: i32, y: i32, center: Point2, ab: f64, theta: f64) -> f64 {
    let (sin_t, cos_t) = theta.sin_cos();
    let dx = x as f64 - center.x;
    let dy = y as f64 - center.y;
    let du = dx * cos_t + dy * sin_t;
    let dv = -dx * sin_t + dy * cos_t;

    let r = du.hypot(dv * ab);
    let dist = dx.hypot(dy);
    if dist < 0.5 {
        // Central pixel: interpolate between <r> for a source centered in the pixel
        // and at its corner, then add in quadrature
        r.hypot(PIXEL_MEAN_RADIUS * (1.0 + dist / std::f64::consts::SQRT_2))
    } else {
        r
    }
}

/// Accumulate the first elliptical moment over `footprint`.
///
/// Fails with [`KronError::OutOfRange`] if the footprint reaches past `image`.
pub fn estimate_mean_radius(
    image: &MaskedImage,
    footprint: &Footprint,
    center: Point2,
    ab: f64,
    theta: f64,
) -> Result<RadialMoment> {
    if footprint.is_empty() {
        return Ok(RadialMoment::default());
    }
    let bbox = footprint.bbox();
    if !image.bbox().contains(&bbox) {
        return Err(KronError::OutOfRange {
            footprint: bbox,
            image: image.bbox(),
        });
    }

    let mut moment = RadialMoment::default();
    footprint.for_each_pixel(image, |x, y, value, _| {
        let r = elliptical_radius(x, y, center, ab, theta);
        moment.sum += value;
        moment.sum_r += r * value;
    });
    Ok(moment)
}
