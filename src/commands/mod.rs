pub mod annotate;
pub mod forced;
pub mod measure;
pub mod psf;

pub use annotate::annotate_apertures;
pub use forced::measure_forced;
pub use measure::measure_sources;
pub use psf::report_psf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use kron_photometry::psf_fitting::PsfFitter;
use kron_photometry::{
    EllipseAxes, Footprint, GaussianPsf, KronFluxConfig, KronRecord, MaskedImage, Point2,
    SourceMeasurement, SourceRecord,
};

use crate::cli::{ImageOptions, PsfOptions};

/// A source as read from the `--sources` file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInput {
    pub id: u64,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub shape: Option<EllipseAxes>,
    /// Radius of a circular detection footprint
    #[serde(default)]
    pub footprint_radius: Option<f64>,
}

impl SourceInput {
    pub fn to_record(&self) -> SourceRecord {
        let center = Point2::new(self.x, self.y);
        let mut record = SourceRecord::new(self.id, center);
        record.shape = self.shape;
        if let Some(radius) = self.footprint_radius.filter(|r| *r > 0.0) {
            record.footprint = Some(Footprint::circle(center, radius));
        }
        record
    }
}

/// One line of output: where we measured, the shape we started from and the
/// Kron measurement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub id: u64,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub shape: Option<EllipseAxes>,
    #[serde(default)]
    pub footprint_radius: Option<f64>,
    pub kron: KronRecord,
    /// Axes of the Kron aperture (one Kron radius) the flux was measured in
    #[serde(default)]
    pub aperture: Option<EllipseAxes>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ResultRow {
    pub fn new(source: &SourceInput, center: Point2, measurement: SourceMeasurement) -> Self {
        Self {
            id: source.id,
            x: center.x,
            y: center.y,
            shape: source.shape,
            footprint_radius: source.footprint_radius,
            kron: measurement.record,
            aperture: measurement.aperture.map(|a| a.axes()),
            error: measurement.error.map(|e| e.to_string()),
        }
    }

    /// The row as a source for forced measurement
    pub fn to_source(&self) -> SourceInput {
        SourceInput {
            id: self.id,
            x: self.x,
            y: self.y,
            shape: self.shape,
            footprint_radius: self.footprint_radius,
        }
    }
}

/// Load a FITS image, estimate its variance and subtract the median background
pub fn load_image(fits_path: &str, options: &ImageOptions) -> Result<MaskedImage> {
    let mut image = MaskedImage::from_fits(Path::new(fits_path), options.gain)?;
    let stats = image.statistics();
    tracing::info!(
        "Loaded {}: {}x{}, median {:.2}, noise {:.3}",
        fits_path,
        image.width(),
        image.height(),
        stats.median,
        stats.noise_sigma()
    );
    if !options.keep_background && stats.median.is_finite() {
        image.subtract_background(stats.median);
    }
    Ok(image)
}

pub fn load_config(path: Option<&str>) -> Result<KronFluxConfig> {
    let config = match path {
        Some(p) => KronFluxConfig::from_file(Path::new(p))?,
        None => KronFluxConfig::default(),
    };
    tracing::debug!("Kron configuration: {:?}", config);
    Ok(config)
}

pub fn load_sources(path: &str) -> Result<Vec<SourceInput>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read sources file: {}", path))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse sources file: {}", path))
}

pub fn load_results(path: &str) -> Result<Vec<ResultRow>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read results file: {}", path))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse results file: {}", path))
}

/// Build the PSF model requested on the command line, if any
pub fn build_psf(
    options: &PsfOptions,
    image: &MaskedImage,
    sources: Option<&[SourceRecord]>,
) -> Result<Option<GaussianPsf>> {
    if let Some(sigma) = options.psf_sigma {
        return Ok(Some(GaussianPsf::new(sigma)?));
    }
    if let Some(fwhm) = options.psf_fwhm {
        return Ok(Some(GaussianPsf::from_fwhm(fwhm)?));
    }
    if options.fit_psf {
        let Some(sources) = sources else {
            bail!("--fit-psf needs a source list to fit");
        };
        let psf = PsfFitter::default().estimate(image, sources, options.psf_sources)?;
        return Ok(Some(psf));
    }
    Ok(None)
}

pub fn write_results(rows: &[ResultRow], format: &str, output: Option<&str>) -> Result<()> {
    let mut writer: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create output file: {}", path))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    };

    match format.to_lowercase().as_str() {
        "json" => output_json(rows, &mut writer)?,
        "csv" => output_csv(rows, &mut writer)?,
        "table" => output_table(rows, &mut writer)?,
        _ => bail!("Unknown format: {}. Use 'table', 'json' or 'csv'", format),
    }
    writer.flush()?;

    if let Some(path) = output {
        tracing::info!("Wrote {} results to {}", rows.len(), path);
    }
    Ok(())
}

fn output_table(rows: &[ResultRow], out: &mut dyn Write) -> Result<()> {
    writeln!(
        out,
        "{:<8} {:>9} {:>9} {:>14} {:>12} {:>8} {:>8} {:<24}",
        "ID", "X", "Y", "Flux", "Flux Err", "Radius", "PSF R", "Flags"
    )?;
    writeln!(out, "{:-<98}", "")?;

    for row in rows {
        writeln!(
            out,
            "{:<8} {:>9.2} {:>9.2} {:>14} {:>12} {:>8} {:>8} {:<24}",
            row.id,
            row.x,
            row.y,
            format_value(row.kron.flux, 2),
            format_value(row.kron.flux_err, 2),
            format_value(row.kron.radius, 3),
            format_value(row.kron.psf_radius, 3),
            flag_summary(&row.kron)
        )?;
    }

    let measured = rows.iter().filter(|r| r.kron.is_measured()).count();
    writeln!(out, "\nTotal: {} sources, {} measured", rows.len(), measured)?;
    Ok(())
}

fn output_json(rows: &[ResultRow], out: &mut dyn Write) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, rows)?;
    writeln!(out)?;
    Ok(())
}

fn output_csv(rows: &[ResultRow], out: &mut dyn Write) -> Result<()> {
    writeln!(
        out,
        "id,x,y,flux,flux_err,radius,radius_for_radius,psf_radius,failure,edge,bad_radius,small_radius,used_minimum_radius,used_psf_radius,bad_shape,error"
    )?;

    for row in rows {
        let k = &row.kron;
        let f = &k.flags;
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},\"{}\"",
            row.id,
            row.x,
            row.y,
            csv_value(k.flux),
            csv_value(k.flux_err),
            csv_value(k.radius),
            csv_value(k.radius_for_radius),
            csv_value(k.psf_radius),
            f.failure,
            f.edge,
            f.bad_radius,
            f.small_radius,
            f.used_minimum_radius,
            f.used_psf_radius,
            f.bad_shape,
            row.error.as_deref().unwrap_or("").replace('"', "\"\"")
        )?;
    }
    Ok(())
}

fn format_value(value: f64, precision: usize) -> String {
    if value.is_finite() {
        format!("{:.*}", precision, value)
    } else {
        "-".to_string()
    }
}

fn csv_value(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        String::new()
    }
}

/// Short comma-separated names of the flags that are set
pub fn flag_summary(record: &KronRecord) -> String {
    let f = &record.flags;
    let names = [
        (f.failure, "fail"),
        (f.edge, "edge"),
        (f.bad_radius, "bad_radius"),
        (f.small_radius, "small"),
        (f.used_minimum_radius, "min_r"),
        (f.used_psf_radius, "psf_r"),
        (f.bad_shape, "bad_shape"),
    ];
    names
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> ResultRow {
        let mut kron = KronRecord::new(7);
        kron.flux = 1234.5;
        kron.flux_err = 12.0;
        kron.radius = 3.25;
        kron.radius_for_radius = 3.0;
        kron.psf_radius = 2.5;
        kron.flags.small_radius = true;
        kron.flags.used_psf_radius = true;
        ResultRow {
            id: 7,
            x: 10.5,
            y: 20.25,
            shape: Some(EllipseAxes::new(3.0, 2.0, 0.5)),
            footprint_radius: Some(6.0),
            kron,
            aperture: Some(EllipseAxes::new(4.0, 2.64, 0.5)),
            error: None,
        }
    }

    #[test]
    fn test_source_input_parsing() {
        let text = r#"[
            {"id": 1, "x": 10.0, "y": 12.5},
            {"id": 2, "x": 30.0, "y": 40.0, "shape": {"a": 3.0, "b": 2.0, "theta": 0.1}, "footprint_radius": 5.0}
        ]"#;
        let sources: Vec<SourceInput> = serde_json::from_str(text).unwrap();
        assert_eq!(sources.len(), 2);

        let first = sources[0].to_record();
        assert!(first.shape.is_none());
        assert!(first.footprint.is_none());

        let second = sources[1].to_record();
        assert!(second.shape_is_valid());
        let footprint = second.footprint.unwrap();
        assert!(footprint.bbox().contains_point(30, 40));
        assert!(!footprint.bbox().contains_point(36, 40));
    }

    #[test]
    fn test_json_results_round_trip_unmeasured() {
        let mut failed = sample_row();
        failed.id = 8;
        failed.kron = KronRecord::new(8);
        failed.kron.flags.failure = true;
        failed.kron.flags.edge = true;
        failed.aperture = None;
        failed.error = Some("edge".to_string());

        let mut buffer = Vec::new();
        output_json(&[sample_row(), failed], &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("null"));

        let rows: Vec<ResultRow> = serde_json::from_str(&text).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kron, sample_row().kron);
        assert_eq!(rows[0].aperture, sample_row().aperture);
        assert!(rows[1].aperture.is_none());
        assert!(rows[1].kron.flux.is_nan());
        assert!(rows[1].kron.flags.edge);
        assert_eq!(rows[1].error.as_deref(), Some("edge"));
    }

    #[test]
    fn test_csv_output() {
        let mut buffer = Vec::new();
        output_csv(&[sample_row()], &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            "7,10.5,20.25,1234.5,12,3.25,3,2.5,false,false,false,true,false,true,false,\"\""
        );
    }

    #[test]
    fn test_table_marks_flags() {
        let mut buffer = Vec::new();
        output_table(&[sample_row()], &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("small,psf_r"));
        assert!(text.contains("Total: 1 sources, 1 measured"));
    }

    #[test]
    fn test_build_psf_from_options() {
        let image = MaskedImage::new(4, 4);
        let options = PsfOptions {
            psf_sigma: None,
            psf_fwhm: Some(4.0),
            fit_psf: false,
            psf_sources: 20,
        };
        let psf = build_psf(&options, &image, None).unwrap().unwrap();
        assert!((psf.fwhm() - 4.0).abs() < 1e-9);

        let options = PsfOptions {
            psf_sigma: None,
            psf_fwhm: None,
            fit_psf: true,
            psf_sources: 20,
        };
        assert!(build_psf(&options, &image, None).is_err());
    }
}
