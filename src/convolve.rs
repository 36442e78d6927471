/// Separable Gaussian smoothing of masked images
use crate::geometry::BBox;
use crate::image::MaskedImage;

/// Normalised separable Gaussian kernel of size `2 * int(2 * sigma) + 1`.
///
/// A non-positive sigma gives the 1x1 identity kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianKernel {
    sigma: f64,
    weights: Vec<f64>,
}

impl GaussianKernel {
    pub fn new(sigma: f64) -> Self {
        if !(sigma > 0.0) {
            return Self {
                sigma,
                weights: vec![1.0],
            };
        }
        let half = (2.0 * sigma) as usize;
        let size = 2 * half + 1;
        let mut weights = vec![0.0; size];
        let mut sum = 0.0;
        for (i, w) in weights.iter_mut().enumerate() {
            let x = i as f64 - half as f64;
            *w = (-x * x / (2.0 * sigma * sigma)).exp();
            sum += *w;
        }

        // Normalize
        for w in &mut weights {
            *w /= sum;
        }

        Self { sigma, weights }
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn size(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Number of pixels the kernel reaches on either side of its center
    pub fn half_width(&self) -> i32 {
        (self.weights.len() / 2) as i32
    }

    pub fn is_identity(&self) -> bool {
        self.weights.len() == 1
    }

    /// The smallest box from which every pixel of `bbox` can be convolved
    pub fn grow_bbox(&self, bbox: &BBox) -> BBox {
        bbox.grown(self.half_width(), self.half_width())
    }

    /// Convolve image and variance (with the squared kernel).
    ///
    /// Pixels closer than `half_width` to the border can't be computed; they are
    /// set to NaN with infinite variance rather than copied from the input.
    pub fn convolve(&self, input: &MaskedImage) -> MaskedImage {
        if self.is_identity() {
            return input.clone();
        }
        let width = input.width();
        let height = input.height();
        let half = self.half_width() as usize;
        let weights2: Vec<f64> = self.weights.iter().map(|w| w * w).collect();

        let image = convolve_plane(input.image(), width, height, &self.weights, half);
        let variance = convolve_plane(input.variance(), width, height, &weights2, half);
        let (image, variance): (Vec<f64>, Vec<f64>) = image
            .into_iter()
            .zip(variance)
            .enumerate()
            .map(|(i, (v, var))| {
                let (x, y) = (i % width, i / width);
                let interior = x >= half
                    && y >= half
                    && x + half < width
                    && y + half < height;
                if interior {
                    (v, var)
                } else {
                    (f64::NAN, f64::INFINITY)
                }
            })
            .unzip();

        input.with_planes(image, variance)
    }
}

fn convolve_plane(data: &[f64], width: usize, height: usize, kernel: &[f64], half: usize) -> Vec<f64> {
    let temp = convolve_horizontal(data, width, height, kernel, half);
    convolve_vertical(&temp, width, height, kernel, half)
}

fn convolve_horizontal(data: &[f64], width: usize, height: usize, kernel: &[f64], half: usize) -> Vec<f64> {
    let mut result = vec![0.0; width * height];
    if width < kernel.len() {
        return result;
    }
    for y in 0..height {
        let row = &data[y * width..(y + 1) * width];
        for x in half..width - half {
            result[y * width + x] = kernel
                .iter()
                .zip(&row[x - half..=x + half])
                .map(|(k, v)| k * v)
                .sum();
        }
    }
    result
}

fn convolve_vertical(data: &[f64], width: usize, height: usize, kernel: &[f64], half: usize) -> Vec<f64> {
    let mut result = vec![0.0; width * height];
    if height < kernel.len() {
        return result;
    }
    for y in half..height - half {
        for x in 0..width {
            let mut sum = 0.0;
            for (i, &k) in kernel.iter().enumerate() {
                sum += data[(y + i - half) * width + x] * k;
            }
            result[y * width + x] = sum;
        }
    }
    result
}
