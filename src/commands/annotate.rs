use anyhow::{Context, Result};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ColorType, ImageBuffer, ImageEncoder, Rgb};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use kron_photometry::mtf_stretch::{stretch_to_u8, StretchParameters};
use kron_photometry::{EllipseAxes, MaskedImage};

use super::{load_results, ResultRow};

/// Segments used to draw each ellipse
const ELLIPSE_SEGMENTS: usize = 64;

/// Convert a color name to RGB values
fn parse_color(color_name: &str) -> Rgb<u8> {
    match color_name.to_lowercase().as_str() {
        "red" => Rgb([255, 0, 0]),
        "green" => Rgb([0, 255, 0]),
        "blue" => Rgb([0, 0, 255]),
        "yellow" => Rgb([255, 255, 0]),
        "cyan" => Rgb([0, 255, 255]),
        "magenta" => Rgb([255, 0, 255]),
        "white" => Rgb([255, 255, 255]),
        _ => Rgb([255, 0, 0]), // Default to red
    }
}

/// The flux aperture of a result row scaled to `n_radius` Kron radii. Rows
/// written without the measured aperture fall back to the source shape, or a
/// circle if it had none.
fn flux_aperture(row: &ResultRow, n_radius: f64) -> Option<EllipseAxes> {
    let radius = row.kron.radius;
    if !(radius > 0.0 && radius.is_finite()) {
        return None;
    }
    let shape = row
        .aperture
        .filter(EllipseAxes::is_valid)
        .or_else(|| row.shape.filter(EllipseAxes::is_valid))
        .unwrap_or_else(|| EllipseAxes::circle(1.0));
    Some(shape.with_determinant_radius(n_radius * radius))
}

/// Points around the ellipse centred at (x, y)
fn ellipse_outline(x: f64, y: f64, axes: &EllipseAxes) -> Vec<(f32, f32)> {
    let (sin_t, cos_t) = axes.theta.sin_cos();
    (0..=ELLIPSE_SEGMENTS)
        .map(|i| {
            let phi = 2.0 * std::f64::consts::PI * i as f64 / ELLIPSE_SEGMENTS as f64;
            let (u, v) = (axes.a * phi.cos(), axes.b * phi.sin());
            ((x + u * cos_t - v * sin_t) as f32, (y + u * sin_t + v * cos_t) as f32)
        })
        .collect()
}

/// Draw the Kron apertures from a results file on an MTF-stretched copy of
/// the image
#[allow(clippy::too_many_arguments)]
pub fn annotate_apertures(
    fits_path: &str,
    results_path: &str,
    output: Option<String>,
    n_radius: f64,
    midtone_factor: f64,
    shadow_clipping: f64,
    annotation_color: &str,
    flagged_color: &str,
) -> Result<()> {
    let fits = MaskedImage::from_fits(Path::new(fits_path), None)?;
    let (width, height) = (fits.width(), fits.height());
    tracing::debug!("Image dimensions: {}x{}", width, height);

    let rows = load_results(results_path)?;
    let stats = fits.statistics();

    let stretch_params = StretchParameters {
        factor: midtone_factor,
        black_clipping: shadow_clipping,
    };
    let stretched = stretch_to_u8(fits.image(), &stats, &stretch_params);
    tracing::debug!(
        "Applied MTF stretch with factor {} and shadow clipping {}",
        midtone_factor,
        shadow_clipping
    );

    let mut rgb_image = ImageBuffer::<Rgb<u8>, Vec<u8>>::new(width as u32, height as u32);
    for (x, y, pixel) in rgb_image.enumerate_pixels_mut() {
        let value = stretched[y as usize * width + x as usize];
        *pixel = Rgb([value, value, value]);
    }

    let good = parse_color(annotation_color);
    let flagged = parse_color(flagged_color);

    let mut drawn = 0;
    for row in &rows {
        let color = if row.kron.is_measured() && row.error.is_none() {
            good
        } else {
            flagged
        };
        match flux_aperture(row, n_radius) {
            Some(axes) => {
                let outline = ellipse_outline(row.x, row.y, &axes);
                for segment in outline.windows(2) {
                    draw_line_segment_mut(&mut rgb_image, segment[0], segment[1], color);
                }
                drawn += 1;
            }
            None => {
                // No radius to draw; mark the position
                draw_filled_circle_mut(&mut rgb_image, (row.x as i32, row.y as i32), 2, flagged);
            }
        }
    }

    let output_path = output.unwrap_or_else(|| {
        let base = fits_path.trim_end_matches(".fits").trim_end_matches(".fit");
        format!("{}_kron.png", base)
    });

    let file = File::create(&output_path)
        .with_context(|| format!("Failed to create output file: {}", output_path))?;
    let writer = BufWriter::new(file);
    let encoder = PngEncoder::new_with_quality(writer, CompressionType::Best, FilterType::Adaptive);
    encoder
        .write_image(
            &rgb_image,
            width as u32,
            height as u32,
            ColorType::Rgb8.into(),
        )
        .with_context(|| format!("Failed to write PNG image to {}", output_path))?;

    println!("Created annotated image: {}", output_path);
    println!("Drew {} apertures for {} sources", drawn, rows.len());
    Ok(())
}
