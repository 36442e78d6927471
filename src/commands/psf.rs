use anyhow::{bail, Result};

use kron_photometry::psf::{psf_kron_radius, Psf};
use kron_photometry::{Exposure, KronFlux, Point2, SourceRecord};

use super::{build_psf, load_config, load_image, load_sources};
use crate::cli::{ImageOptions, PsfOptions};

/// Print the PSF's shape, Kron radius and the fraction of its flux inside the
/// Kron aperture at (x, y)
pub fn report_psf(
    fits_path: &str,
    x: f64,
    y: f64,
    sources_path: Option<&str>,
    config_path: Option<&str>,
    psf_options: &PsfOptions,
    image_options: &ImageOptions,
) -> Result<()> {
    let config = load_config(config_path)?;
    let image = load_image(fits_path, image_options)?;
    let sources: Option<Vec<SourceRecord>> = match sources_path {
        Some(path) => Some(load_sources(path)?.iter().map(|s| s.to_record()).collect()),
        None => None,
    };

    let Some(psf) = build_psf(psf_options, &image, sources.as_deref())? else {
        bail!("No PSF given: use --psf-sigma, --psf-fwhm or --fit-psf");
    };

    let center = Point2::new(x, y);
    let shape = psf.compute_shape(center);
    let kron_radius = psf_kron_radius(&psf, center, config.smoothing_sigma);
    let smoothing = config.smoothing_sigma;
    let fwhm = psf.fwhm();
    let exposure = Exposure::new(image).with_psf(psf);
    let flux_factor = KronFlux::new(config)?.psf_flux_factor(&exposure, center)?;

    println!("PSF at ({:.2}, {:.2})", x, y);
    println!(
        "  Sigma: {:.3} x {:.3}, theta {:.1} deg",
        shape.a,
        shape.b,
        shape.theta.to_degrees()
    );
    println!("  FWHM: {:.3}", fwhm);
    if smoothing > 0.0 {
        println!("  Smoothing sigma: {:.3}", smoothing);
    }
    println!("  Kron radius: {:.3}", kron_radius);
    println!("  Flux fraction in Kron aperture: {:.4}", flux_factor);

    Ok(())
}
