/// Kron flux measurement: aperture selection policy, flags and the
/// per-catalog drivers
use std::f64::consts::SQRT_2;

use rayon::prelude::*;

use crate::aperture::KronAperture;
use crate::config::KronFluxConfig;
use crate::error::{KronError, Result};
use crate::footprint::Footprint;
use crate::geometry::{AffineTransform, EllipseAxes, Point2};
use crate::image::MaskedImage;
use crate::integrator::{ApertureIntegrator, SubpixelIntegrator};
use crate::psf::{psf_flux_factor, psf_kron_radius, Psf};
use crate::record::{KronFlags, KronRecord, SourceRecord};

/// An image together with the PSF model that applies to it, if any
#[derive(Debug)]
pub struct Exposure {
    image: MaskedImage,
    psf: Option<Box<dyn Psf>>,
}

impl Exposure {
    pub fn new(image: MaskedImage) -> Self {
        Self { image, psf: None }
    }

    pub fn with_psf(mut self, psf: impl Psf + 'static) -> Self {
        self.psf = Some(Box::new(psf));
        self
    }

    pub fn image(&self) -> &MaskedImage {
        &self.image
    }

    pub fn psf(&self) -> Option<&dyn Psf> {
        self.psf.as_deref()
    }
}

/// Outcome of measuring one source of a catalog
#[derive(Debug, Clone)]
pub struct SourceMeasurement {
    pub record: KronRecord,
    /// Kron aperture the flux was measured in, if the measurement got that far
    pub aperture: Option<KronAperture>,
    pub error: Option<KronError>,
}

impl SourceMeasurement {
    fn new(record: KronRecord, result: Result<KronAperture>, what: &str) -> Self {
        match result {
            Ok(aperture) => Self {
                record,
                aperture: Some(aperture),
                error: None,
            },
            Err(e) => {
                tracing::warn!("{}: {}", what, e);
                Self {
                    record,
                    aperture: None,
                    error: Some(e),
                }
            }
        }
    }
}

/// The Kron flux algorithm, configured once and applied source by source
pub struct KronFlux {
    config: KronFluxConfig,
    integrator: Box<dyn ApertureIntegrator>,
}

impl KronFlux {
    /// Fails with [`KronError::Config`] if the configuration doesn't validate
    pub fn new(config: KronFluxConfig) -> Result<Self> {
        Self::with_integrator(config, SubpixelIntegrator::default())
    }

    pub fn with_integrator(
        config: KronFluxConfig,
        integrator: impl ApertureIntegrator + 'static,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            integrator: Box::new(integrator),
        })
    }

    pub fn config(&self) -> &KronFluxConfig {
        &self.config
    }

    /// Measure the Kron flux of `source`, centered at `center`.
    ///
    /// The failure flag is set on entry and only cleared when the
    /// measurement completes without a fundamental problem. Errors are
    /// fatal for this source; the flags in `record` say why.
    pub fn measure(
        &self,
        exposure: &Exposure,
        source: &SourceRecord,
        center: Point2,
        record: &mut KronRecord,
    ) -> Result<()> {
        self.measure_aperture(exposure, source, center, record).map(|_| ())
    }

    /// [`measure`](Self::measure), also returning the Kron aperture the flux
    /// was measured in (before scaling by `n_radius_for_flux`)
    pub fn measure_aperture(
        &self,
        exposure: &Exposure,
        source: &SourceRecord,
        center: Point2,
        record: &mut KronRecord,
    ) -> Result<KronAperture> {
        self.measure_source(exposure, source, center, record)
            .map_err(|e| e.context(source_context(source.id, center)))
    }

    fn measure_source(
        &self,
        exposure: &Exposure,
        source: &SourceRecord,
        center: Point2,
        record: &mut KronRecord,
    ) -> Result<KronAperture> {
        let ctrl = &self.config;
        record.flags = KronFlags {
            failure: true, // bad unless we get all the way to success at the end
            ..Default::default()
        };

        // Did we hit a condition that fundamentally prevented measuring the Kron flux?
        // Hitting the edge or a bad input shape count; low signal-to-noise doesn't.
        let mut bad = false;

        let psf = exposure.psf();
        let r_k_psf = psf.map_or(-1.0, |psf| psf_kron_radius(psf, center, ctrl.smoothing_sigma));

        let mut axes = match source.valid_shape() {
            Some(shape) => shape,
            None => {
                bad = true;
                let psf = psf.ok_or(KronError::BadShapeNoPsf)?;
                record.flags.bad_shape = true;
                psf.compute_shape(center)
            }
        };

        if ctrl.use_footprint_radius {
            if let Some(footprint_axes) = source.footprint.as_ref().and_then(Footprint::shape) {
                // For a disk of radius R, <r^2> = R^2/2
                let foot_radius = footprint_axes.scaled(SQRT_2).determinant_radius();
                let radius0 = axes.determinant_radius();
                if foot_radius > radius0 * ctrl.n_sigma_for_radius {
                    // we'll scale it back up by n_sigma_for_radius
                    axes = axes.with_determinant_radius(foot_radius / ctrl.n_sigma_for_radius);
                }
            }
        }

        let mut radius_for_radius = f64::NAN;
        let (mut aperture, rad) = if ctrl.fixed {
            let aperture = KronAperture::from_source(source)?;
            (aperture, aperture.radius())
        } else {
            match KronAperture::determine(exposure.image(), axes, center, ctrl, &mut radius_for_radius) {
                Ok(aperture) => (aperture, aperture.radius()),
                Err(e) if e.is_edge() => {
                    // no reasonable fallback or recovery possible
                    record.flags.edge = true;
                    record.flags.failure = true;
                    return Err(e);
                }
                Err(e) if e.is_bad_integral() => {
                    // Only low S/N, so not bad
                    self.fallback_radius(source.id, center, axes, r_k_psf, e, record)?
                }
                Err(e) => {
                    bad = true;
                    self.fallback_radius(source.id, center, axes, r_k_psf, e, record)?
                }
            }
        };

        // The Kron radius may not be smaller than the minimum radius, or failing that the PSF's
        let mut new_radius = rad;
        if ctrl.enforce_minimum_radius {
            if ctrl.minimum_radius > 0.0 {
                if rad < ctrl.minimum_radius {
                    new_radius = ctrl.minimum_radius;
                    record.flags.used_minimum_radius = true;
                }
            } else if psf.is_none() {
                return Err(KronError::NoMinimumRadiusNoPsf);
            } else if rad < r_k_psf {
                new_radius = r_k_psf;
                record.flags.used_psf_radius = true;
            }
            if new_radius != rad {
                aperture.scale(new_radius / rad);
                record.flags.small_radius = true;
            }
        }

        self.apply_aperture(exposure.image(), &aperture, new_radius, source.id, record)?;
        record.radius_for_radius = radius_for_radius;
        record.psf_radius = r_k_psf;
        record.flags.failure = bad;
        Ok(aperture)
    }

    /// Measure with the aperture of a reference source, carried into this
    /// exposure's frame by `ref_to_meas`. No solver, fallback or floor.
    pub fn measure_forced(
        &self,
        exposure: &Exposure,
        center: Point2,
        reference: &SourceRecord,
        reference_record: &KronRecord,
        ref_to_meas: &AffineTransform,
        record: &mut KronRecord,
    ) -> Result<()> {
        self.forced_aperture(exposure, center, reference, reference_record, ref_to_meas, record)
            .map(|_| ())
    }

    fn forced_aperture(
        &self,
        exposure: &Exposure,
        center: Point2,
        reference: &SourceRecord,
        reference_record: &KronRecord,
        ref_to_meas: &AffineTransform,
        record: &mut KronRecord,
    ) -> Result<KronAperture> {
        record.flags.failure = true;
        let aperture = KronAperture::from_reference(reference, ref_to_meas, reference_record.radius)
            .and_then(|aperture| {
                self.apply_aperture(exposure.image(), &aperture, aperture.radius(), reference.id, record)?;
                Ok(aperture)
            })
            .map_err(|e| e.context(source_context(reference.id, center)))?;
        if let Some(psf) = exposure.psf() {
            record.psf_radius = psf_kron_radius(psf, center, self.config.smoothing_sigma);
        }
        record.flags.failure = false;
        Ok(aperture)
    }

    /// Fraction of the PSF's flux inside its own Kron radius at `center`;
    /// 1.0 without a PSF
    pub fn psf_flux_factor(&self, exposure: &Exposure, center: Point2) -> Result<f64> {
        let Some(psf) = exposure.psf() else {
            return Ok(1.0);
        };
        let r_k = psf_kron_radius(psf, center, self.config.smoothing_sigma);
        psf_flux_factor(
            Some(psf),
            center,
            r_k,
            self.config.max_sinc_radius,
            self.integrator.as_ref(),
        )
    }

    /// Measure every source at its centroid, in parallel. A failure only
    /// affects its own source.
    pub fn measure_catalog(&self, exposure: &Exposure, sources: &[SourceRecord]) -> Vec<SourceMeasurement> {
        let results: Vec<SourceMeasurement> = sources
            .par_iter()
            .map(|source| {
                let mut record = KronRecord::new(source.id);
                let result = self.measure_aperture(exposure, source, source.centroid, &mut record);
                SourceMeasurement::new(record, result, "Kron measurement failed")
            })
            .collect();
        log_summary(&results);
        results
    }

    /// Forced measurement of every reference source, in parallel
    pub fn measure_forced_catalog(
        &self,
        exposure: &Exposure,
        references: &[(SourceRecord, KronRecord)],
        ref_to_meas: &AffineTransform,
    ) -> Vec<SourceMeasurement> {
        let results: Vec<SourceMeasurement> = references
            .par_iter()
            .map(|(reference, reference_record)| {
                let mut record = KronRecord::new(reference.id);
                let center = ref_to_meas.apply(reference.centroid);
                let result = self.forced_aperture(
                    exposure,
                    center,
                    reference,
                    reference_record,
                    ref_to_meas,
                    &mut record,
                );
                SourceMeasurement::new(record, result, "Forced Kron measurement failed")
            })
            .collect();
        log_summary(&results);
        results
    }

    /// Replace a Kron radius we couldn't measure with the minimum radius, or
    /// failing that the PSF's Kron radius
    fn fallback_radius(
        &self,
        id: u64,
        center: Point2,
        axes: EllipseAxes,
        r_k_psf: f64,
        err: KronError,
        record: &mut KronRecord,
    ) -> Result<(KronAperture, f64)> {
        record.flags.bad_radius = true;
        let new_radius = if self.config.minimum_radius > 0.0 {
            record.flags.used_minimum_radius = true;
            self.config.minimum_radius
        } else if r_k_psf > 0.0 {
            record.flags.used_psf_radius = true;
            r_k_psf
        } else {
            return Err(err.context("Bad Kron aperture, no minimum radius specified, and no PSF"));
        };
        tracing::warn!(
            "Source {}: {}; using fallback Kron radius {:.3}",
            id,
            err,
            new_radius
        );
        Ok((
            KronAperture::new(center, axes.with_determinant_radius(new_radius)),
            new_radius,
        ))
    }

    fn apply_aperture(
        &self,
        image: &MaskedImage,
        aperture: &KronAperture,
        rad: f64,
        id: u64,
        record: &mut KronRecord,
    ) -> Result<()> {
        if !(rad >= f64::EPSILON) {
            record.flags.bad_radius = true;
            return Err(KronError::DegenerateRadius { id });
        }

        let result = match aperture.measure(
            image,
            self.config.n_radius_for_flux,
            self.config.max_sinc_radius,
            self.integrator.as_ref(),
        ) {
            Ok(result) => result,
            Err(e) => {
                if e.is_edge() {
                    // We hit the edge of the image; there's no reasonable fallback or recovery
                    record.flags.failure = true;
                    record.flags.edge = true;
                }
                return Err(e);
            }
        };

        record.flux = result.flux;
        record.flux_err = result.flux_sigma;
        record.radius = rad;
        Ok(())
    }
}

/// Identity and position of a source, for error messages
fn source_context(id: u64, center: Point2) -> String {
    format!("source {} at ({:.3}, {:.3})", id, center.x, center.y)
}

fn log_summary(results: &[SourceMeasurement]) {
    let failed = results.iter().filter(|m| m.error.is_some()).count();
    let flagged = results
        .iter()
        .filter(|m| m.error.is_none() && m.record.flags.failure)
        .count();
    tracing::info!(
        "Measured {} sources: {} failed, {} flagged",
        results.len(),
        failed,
        flagged
    );
}
