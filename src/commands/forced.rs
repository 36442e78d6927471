use anyhow::{bail, Result};

use kron_photometry::{AffineTransform, Exposure, KronFlux, KronRecord, Point2, SourceRecord};

use super::{build_psf, load_config, load_image, load_results, write_results, ResultRow};
use crate::cli::{ImageOptions, PsfOptions};

/// Forced Kron photometry: reuse the apertures in `reference_path`, mapped
/// onto the image by `transform`
#[allow(clippy::too_many_arguments)]
pub fn measure_forced(
    fits_path: &str,
    reference_path: &str,
    transform: Option<&[f64]>,
    config_path: Option<&str>,
    psf_options: &PsfOptions,
    image_options: &ImageOptions,
    format: &str,
    output: Option<&str>,
) -> Result<()> {
    let ref_to_meas = parse_transform(transform)?;
    let config = load_config(config_path)?;
    let image = load_image(fits_path, image_options)?;
    let reference_rows = load_results(reference_path)?;

    let references: Vec<(SourceRecord, KronRecord)> = reference_rows
        .iter()
        .map(|row| (row.to_source().to_record(), row.kron))
        .collect();
    tracing::info!("Forced measurement of {} reference sources", references.len());

    let psf_sources: Vec<SourceRecord> = references
        .iter()
        .map(|(source, _)| SourceRecord::new(source.id, ref_to_meas.apply(source.centroid)))
        .collect();
    let psf = build_psf(psf_options, &image, Some(&psf_sources))?;
    let mut exposure = Exposure::new(image);
    if let Some(psf) = psf {
        exposure = exposure.with_psf(psf);
    }

    let measurements =
        KronFlux::new(config)?.measure_forced_catalog(&exposure, &references, &ref_to_meas);

    let rows: Vec<ResultRow> = reference_rows
        .iter()
        .zip(measurements)
        .map(|(row, m)| {
            let mut source = row.to_source();
            source.shape = row.shape.map(|s| s.transform(ref_to_meas.linear()));
            let center = ref_to_meas.apply(Point2::new(row.x, row.y));
            ResultRow::new(&source, center, m)
        })
        .collect();
    write_results(&rows, format, output)
}

fn parse_transform(values: Option<&[f64]>) -> Result<AffineTransform> {
    match values {
        None => Ok(AffineTransform::identity()),
        Some(&[a, b, c, d, tx, ty]) => {
            if (a * d - b * c).abs() < f64::EPSILON {
                bail!("Transform is singular: {:?}", [a, b, c, d]);
            }
            Ok(AffineTransform::new([a, b, c, d, tx, ty]))
        }
        Some(v) => bail!("Transform needs 6 values, got {}", v.len()),
    }
}
