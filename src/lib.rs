pub mod aperture;
pub mod config;
pub mod convolve;
pub mod error;
pub mod footprint;
pub mod geometry;
pub mod image;
pub mod integrator;
pub mod kron;
pub mod moments;
pub mod mtf_stretch;
pub mod photometry;
pub mod psf;
pub mod psf_fitting;
pub mod record;

// Re-export commonly used items
pub use aperture::KronAperture;
pub use config::KronFluxConfig;
pub use error::{KronError, Result};
pub use footprint::Footprint;
pub use geometry::{AffineTransform, BBox, Ellipse, EllipseAxes, Point2};
pub use image::{ImageStatistics, MaskedImage};
pub use kron::{Exposure, KronFlux, SourceMeasurement};
pub use psf::{GaussianPsf, Psf};
pub use record::{KronFlags, KronRecord, SourceRecord};
