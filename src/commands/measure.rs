use anyhow::Result;
use std::time::Instant;

use kron_photometry::{Exposure, KronFlux, Point2, SourceRecord};

use super::{build_psf, load_config, load_image, load_sources, write_results, ResultRow};
use crate::cli::{ImageOptions, PsfOptions};

/// Measure Kron fluxes for every source in `sources_path`
pub fn measure_sources(
    fits_path: &str,
    sources_path: &str,
    config_path: Option<&str>,
    psf_options: &PsfOptions,
    image_options: &ImageOptions,
    format: &str,
    output: Option<&str>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let image = load_image(fits_path, image_options)?;
    let inputs = load_sources(sources_path)?;
    let sources: Vec<SourceRecord> = inputs.iter().map(|s| s.to_record()).collect();
    tracing::info!("Measuring {} sources", sources.len());

    let psf = build_psf(psf_options, &image, Some(&sources))?;
    let mut exposure = Exposure::new(image);
    if let Some(psf) = psf {
        tracing::info!("Using Gaussian PSF with FWHM {:.3}", psf.fwhm());
        exposure = exposure.with_psf(psf);
    }

    let start = Instant::now();
    let measurements = KronFlux::new(config)?.measure_catalog(&exposure, &sources);
    tracing::debug!("Measured catalog in {:.2?}", start.elapsed());

    let rows: Vec<ResultRow> = inputs
        .iter()
        .zip(measurements)
        .map(|(input, m)| ResultRow::new(input, Point2::new(input.x, input.y), m))
        .collect();
    write_results(&rows, format, output)
}
