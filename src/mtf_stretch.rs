/// Midtone Transfer Function (MTF) stretching for display.
/// Based on N.I.N.A.'s image stretching algorithm
use crate::image::ImageStatistics;

/// MTF stretch settings (N.I.N.A. defaults: factor 0.15, black clipping -2.8)
#[derive(Debug, Clone, Copy)]
pub struct StretchParameters {
    /// Target histogram median position
    pub factor: f64,
    /// Shadow clipping in MAD units
    pub black_clipping: f64,
}

impl Default for StretchParameters {
    fn default() -> Self {
        Self {
            factor: 0.15,
            black_clipping: -2.8,
        }
    }
}

/// Stretch floating point pixels to 8 bits. Non-finite pixels map to black.
pub fn stretch_to_u8(data: &[f64], statistics: &ImageStatistics, params: &StretchParameters) -> Vec<u8> {
    let range = statistics.max - statistics.min;
    if !(range > 0.0) {
        return vec![0; data.len()];
    }
    let normalize = |v: f64| ((v - statistics.min) / range).clamp(0.0, 1.0);

    let normalized_median = normalize(statistics.median);
    let normalized_sigma = statistics.noise_sigma() / range;

    let (shadows, midtones, highlights) = if normalized_median > 0.5 {
        // Image is inverted or overexposed
        let shadows = 0.0;
        let highlights = normalized_median - params.black_clipping * normalized_sigma;
        let midtones = midtones_transfer_function(params.factor, 1.0 - (highlights - normalized_median));
        (shadows, midtones, highlights)
    } else {
        let shadows = normalized_median + params.black_clipping * normalized_sigma;
        let midtones = midtones_transfer_function(params.factor, normalized_median - shadows);
        (shadows, midtones, 1.0)
    };

    data.iter()
        .map(|&v| {
            if !v.is_finite() {
                return 0;
            }
            let input = (1.0 - highlights + normalize(v) - shadows).clamp(0.0, 1.0);
            (midtones_transfer_function(midtones, input) * 255.0).round() as u8
        })
        .collect()
}

/// Midtones Transfer Function (MTF)
fn midtones_transfer_function(midtone_balance: f64, x: f64) -> f64 {
    if x > 0.0 {
        if x < 1.0 {
            return (midtone_balance - 1.0) * x / ((2.0 * midtone_balance - 1.0) * x - midtone_balance);
        }
        return 1.0;
    }
    0.0
}
