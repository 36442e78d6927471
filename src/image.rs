use anyhow::{Context, Result};
use bumpalo::Bump;
use fitrs::{Fits, FitsData, FitsDataArray};
use std::path::Path;

use crate::error::KronError;
use crate::geometry::BBox;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ImageStatistics {
    pub width: usize,
    pub height: usize,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub mad: f64,
}

impl ImageStatistics {
    /// Robust background sigma from the MAD
    pub fn noise_sigma(&self) -> f64 {
        1.4826 * self.mad
    }
}

/// Image and variance planes sharing a pixel grid.
///
/// Pixel (0, 0) of the planes sits at parent coordinates `(x0, y0)`; all
/// public accessors take parent coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedImage {
    x0: i32,
    y0: i32,
    width: usize,
    height: usize,
    image: Vec<f64>,
    variance: Vec<f64>,
}

impl MaskedImage {
    /// A zero-filled image
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            x0: 0,
            y0: 0,
            width,
            height,
            image: vec![0.0; width * height],
            variance: vec![0.0; width * height],
        }
    }

    pub fn from_planes(
        x0: i32,
        y0: i32,
        width: usize,
        height: usize,
        image: Vec<f64>,
        variance: Vec<f64>,
    ) -> crate::error::Result<Self> {
        if image.len() != width * height || variance.len() != width * height {
            return Err(KronError::Image(format!(
                "plane sizes {} and {} don't match {}x{}",
                image.len(),
                variance.len(),
                width,
                height
            )));
        }
        Ok(Self {
            x0,
            y0,
            width,
            height,
            image,
            variance,
        })
    }

    /// Same geometry as `self` with new pixel planes
    pub(crate) fn with_planes(&self, image: Vec<f64>, variance: Vec<f64>) -> MaskedImage {
        debug_assert_eq!(image.len(), self.image.len());
        debug_assert_eq!(variance.len(), self.variance.len());
        MaskedImage {
            x0: self.x0,
            y0: self.y0,
            width: self.width,
            height: self.height,
            image,
            variance,
        }
    }

    /// Load the primary HDU of a FITS file, applying BZERO/BSCALE.
    ///
    /// The variance plane is the background variance estimated from the MAD,
    /// plus `max(I - median, 0) / gain` when a gain is given.
    pub fn from_fits(path: &Path, gain: Option<f64>) -> Result<Self> {
        let fits = Fits::open(path)
            .with_context(|| format!("Failed to open FITS file: {}", path.display()))?;

        let hdu = fits
            .get(0)
            .ok_or_else(|| anyhow::anyhow!("No primary HDU found in FITS file"))?;

        let header_int = |key: &str| -> Result<i64> {
            match hdu.value(key) {
                Some(fitrs::HeaderValue::IntegerNumber(n)) => Ok(*n as i64),
                Some(_) => Err(anyhow::anyhow!("{} is not an integer", key)),
                None => Err(anyhow::anyhow!("Missing {} header", key)),
            }
        };
        let header_real = |key: &str, default: f64| -> f64 {
            match hdu.value(key) {
                Some(fitrs::HeaderValue::IntegerNumber(n)) => *n as f64,
                Some(fitrs::HeaderValue::RealFloatingNumber(f)) => *f,
                _ => default,
            }
        };

        let naxis = header_int("NAXIS")?;
        if naxis < 2 {
            return Err(anyhow::anyhow!(
                "FITS file does not contain 2D image data (NAXIS={})",
                naxis
            ));
        }
        let width = header_int("NAXIS1")? as usize;
        let height = header_int("NAXIS2")? as usize;
        let bzero = header_real("BZERO", 0.0);
        let bscale = header_real("BSCALE", 1.0);

        let pixels: Vec<f64> = match hdu.read_data() {
            FitsData::Characters(_) => {
                return Err(anyhow::anyhow!(
                    "FITS file contains character data, not image data"
                ));
            }
            FitsData::IntegersI32(FitsDataArray { data, .. }) => data
                .iter()
                .map(|x| x.map_or(f64::NAN, |v| bzero + bscale * v as f64))
                .collect(),
            FitsData::IntegersU32(FitsDataArray { data, .. }) => data
                .iter()
                .map(|x| x.map_or(f64::NAN, |v| bzero + bscale * v as f64))
                .collect(),
            FitsData::FloatingPoint32(FitsDataArray { data, .. }) => data
                .iter()
                .map(|&v| bzero + bscale * v as f64)
                .collect(),
            FitsData::FloatingPoint64(FitsDataArray { data, .. }) => {
                data.iter().map(|&v| bzero + bscale * v).collect()
            }
        };

        // Only the first plane of a cube is used
        if pixels.len() < width * height {
            return Err(anyhow::anyhow!(
                "Data size mismatch: expected {} pixels, got {}",
                width * height,
                pixels.len()
            ));
        }
        let mut image = Self {
            x0: 0,
            y0: 0,
            width,
            height,
            image: pixels[..width * height].to_vec(),
            variance: vec![0.0; width * height],
        };
        image.estimate_variance(gain);
        Ok(image)
    }

    /// Fill the variance plane from the image's own background noise
    pub fn estimate_variance(&mut self, gain: Option<f64>) {
        let stats = self.statistics();
        let background_var = stats.noise_sigma().powi(2);
        for (var, &value) in self.variance.iter_mut().zip(self.image.iter()) {
            let shot = match gain {
                Some(g) if g > 0.0 => (value - stats.median).max(0.0) / g,
                _ => 0.0,
            };
            *var = background_var + shot;
        }
    }

    /// Subtract a constant background level from the image plane
    pub fn subtract_background(&mut self, level: f64) {
        for v in self.image.iter_mut() {
            *v -= level;
        }
    }

    pub fn x0(&self) -> i32 {
        self.x0
    }

    pub fn y0(&self) -> i32 {
        self.y0
    }

    /// Move the image to a new parent origin without touching the pixels
    pub fn set_origin(&mut self, x0: i32, y0: i32) {
        self.x0 = x0;
        self.y0 = y0;
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn bbox(&self) -> BBox {
        BBox::from_origin(self.x0, self.y0, self.width, self.height)
    }

    pub fn image(&self) -> &[f64] {
        &self.image
    }

    pub fn variance(&self) -> &[f64] {
        &self.variance
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if !self.bbox().contains_point(x, y) {
            return None;
        }
        Some((y - self.y0) as usize * self.width + (x - self.x0) as usize)
    }

    /// Image value at parent coordinates
    pub fn get(&self, x: i32, y: i32) -> Option<f64> {
        self.index(x, y).map(|i| self.image[i])
    }

    /// Variance value at parent coordinates
    pub fn get_variance(&self, x: i32, y: i32) -> Option<f64> {
        self.index(x, y).map(|i| self.variance[i])
    }

    /// Image and variance at parent coordinates
    #[inline]
    pub fn pixel(&self, x: i32, y: i32) -> Option<(f64, f64)> {
        self.index(x, y).map(|i| (self.image[i], self.variance[i]))
    }

    /// Set a pixel; out-of-bounds writes are ignored
    pub fn set(&mut self, x: i32, y: i32, value: f64, variance: f64) {
        if let Some(i) = self.index(x, y) {
            self.image[i] = value;
            self.variance[i] = variance;
        }
    }

    /// Add to the image plane; out-of-bounds writes are ignored
    pub fn add(&mut self, x: i32, y: i32, value: f64) {
        if let Some(i) = self.index(x, y) {
            self.image[i] += value;
        }
    }

    /// Deep copy of the pixels inside `bbox` (parent coordinates)
    pub fn subimage(&self, bbox: &BBox) -> crate::error::Result<MaskedImage> {
        if bbox.is_empty() || !self.bbox().contains(bbox) {
            return Err(KronError::OutOfRange {
                footprint: *bbox,
                image: self.bbox(),
            });
        }
        let width = bbox.width();
        let height = bbox.height();
        let mut image = Vec::with_capacity(width * height);
        let mut variance = Vec::with_capacity(width * height);
        for y in bbox.y_min..=bbox.y_max {
            let start = (y - self.y0) as usize * self.width + (bbox.x_min - self.x0) as usize;
            image.extend_from_slice(&self.image[start..start + width]);
            variance.extend_from_slice(&self.variance[start..start + width]);
        }
        Ok(MaskedImage {
            x0: bbox.x_min,
            y0: bbox.y_min,
            width,
            height,
            image,
            variance,
        })
    }

    /// Copy `other` into this image at parent offset `(x0, y0)` of `other`
    pub fn paste(&mut self, other: &MaskedImage) {
        for y in other.bbox().y_min..=other.bbox().y_max {
            for x in other.bbox().x_min..=other.bbox().x_max {
                if let Some((v, var)) = other.pixel(x, y) {
                    self.set(x, y, v, var);
                }
            }
        }
    }

    /// Mean, median, standard deviation and MAD of the finite pixels
    pub fn statistics(&self) -> ImageStatistics {
        // Use arena for temporary allocation
        let arena = Bump::new();
        let mut sorted_data = bumpalo::vec![in &arena];
        sorted_data.extend(self.image.iter().copied().filter(|v| v.is_finite()));
        sorted_data.sort_by(f64::total_cmp);

        if sorted_data.is_empty() {
            return ImageStatistics {
                width: self.width,
                height: self.height,
                mean: f64::NAN,
                median: f64::NAN,
                std_dev: f64::NAN,
                min: f64::NAN,
                max: f64::NAN,
                mad: f64::NAN,
            };
        }

        let n = sorted_data.len();
        let mean = sorted_data.iter().sum::<f64>() / n as f64;
        let median = median_of_sorted(&sorted_data);
        let variance = if n > 1 {
            sorted_data.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        } else {
            0.0
        };

        let mut deviations = bumpalo::vec![in &arena];
        deviations.extend(sorted_data.iter().map(|&x| (x - median).abs()));
        deviations.sort_by(f64::total_cmp);
        let mad = median_of_sorted(&deviations);

        ImageStatistics {
            width: self.width,
            height: self.height,
            mean,
            median,
            std_dev: variance.sqrt(),
            min: sorted_data[0],
            max: sorted_data[n - 1],
            mad,
        }
    }
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}
