/// Input sources and per-source Kron measurement results
use serde::{Deserialize, Deserializer, Serialize};

use crate::footprint::Footprint;
use crate::geometry::{EllipseAxes, Point2};

/// A detected source: what we read before measuring
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub id: u64,
    pub centroid: Point2,
    /// Shape from an earlier moments measurement, if it succeeded
    pub shape: Option<EllipseAxes>,
    /// Detection footprint
    pub footprint: Option<Footprint>,
}

impl SourceRecord {
    pub fn new(id: u64, centroid: Point2) -> Self {
        Self {
            id,
            centroid,
            shape: None,
            footprint: None,
        }
    }

    pub fn with_shape(mut self, shape: EllipseAxes) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn with_footprint(mut self, footprint: Footprint) -> Self {
        self.footprint = Some(footprint);
        self
    }

    /// The recorded shape, if present with finite positive axes
    pub fn valid_shape(&self) -> Option<EllipseAxes> {
        self.shape.filter(EllipseAxes::is_valid)
    }

    pub fn shape_is_valid(&self) -> bool {
        self.valid_shape().is_some()
    }
}

/// Quality flags attached to a Kron measurement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KronFlags {
    /// General failure; set unless the measurement ran to completion
    pub failure: bool,
    /// The aperture or its smoothing margin hit the edge of the image
    pub edge: bool,
    /// The Kron radius couldn't be measured and a fallback was used
    pub bad_radius: bool,
    /// The measured radius was raised to the minimum or PSF radius
    pub small_radius: bool,
    pub used_minimum_radius: bool,
    pub used_psf_radius: bool,
    /// The source shape was unusable and the PSF shape was used instead
    pub bad_shape: bool,
}

/// Result fields written by a Kron measurement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KronRecord {
    pub id: u64,
    #[serde(deserialize_with = "null_as_nan")]
    pub flux: f64,
    #[serde(deserialize_with = "null_as_nan")]
    pub flux_err: f64,
    /// Kron radius (determinant radius of the aperture before `n_radius_for_flux`)
    #[serde(deserialize_with = "null_as_nan")]
    pub radius: f64,
    /// Radius of the footprint used to estimate the Kron radius
    #[serde(deserialize_with = "null_as_nan")]
    pub radius_for_radius: f64,
    /// Kron radius of the PSF, or -1 if there was none
    #[serde(deserialize_with = "null_as_nan")]
    pub psf_radius: f64,
    #[serde(flatten)]
    pub flags: KronFlags,
}

/// Unmeasured values are written as JSON null; read them back as NaN
fn null_as_nan<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

impl KronRecord {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            flux: f64::NAN,
            flux_err: f64::NAN,
            radius: f64::NAN,
            radius_for_radius: f64::NAN,
            psf_radius: f64::NAN,
            flags: KronFlags::default(),
        }
    }

    /// Flux is usable
    pub fn is_measured(&self) -> bool {
        !self.flags.failure && self.flux.is_finite()
    }
}
