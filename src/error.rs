/// Errors raised while measuring Kron photometry
use crate::geometry::{BBox, Ellipse};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum KronError {
    /// The footprint (plus any smoothing margin) doesn't fit in the image
    #[error("footprint {footprint} doesn't fit in image {image}")]
    OutOfRange { footprint: BBox, image: BBox },

    /// The small-aperture integrator ran off the edge of the image
    #[error("aperture {aperture} extends past image {image}")]
    Length { aperture: Ellipse, image: BBox },

    #[error("bad integral defining Kron radius")]
    BadKronIntegral,

    #[error("invalid aperture shape: a={a}, b={b}")]
    InvalidShape { a: f64, b: f64 },

    #[error("bad shape and no PSF")]
    BadShapeNoPsf,

    #[error("no minimum radius and no PSF provided")]
    NoMinimumRadiusNoPsf,

    #[error("Kron radius is < epsilon for source {id}")]
    DegenerateRadius { id: u64 },

    #[error("PSF error: {0}")]
    Psf(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("image error: {0}")]
    Image(String),

    /// An error re-raised with extra diagnostic context
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<KronError>,
    },
}

impl KronError {
    /// Wrap the error with a line of context, keeping the inner error as the source.
    pub fn context(self, context: impl Into<String>) -> Self {
        KronError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context wrappers.
    pub fn root(&self) -> &KronError {
        let mut err = self;
        while let KronError::Context { source, .. } = err {
            err = source;
        }
        err
    }

    /// Did we hit the edge of the image?
    pub fn is_edge(&self) -> bool {
        matches!(
            self.root(),
            KronError::OutOfRange { .. } | KronError::Length { .. }
        )
    }

    pub fn is_bad_integral(&self) -> bool {
        matches!(self.root(), KronError::BadKronIntegral)
    }
}

pub type Result<T> = std::result::Result<T, KronError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_root() {
        let err = KronError::OutOfRange {
            footprint: BBox::new(-2, -2, 5, 5),
            image: BBox::new(0, 0, 9, 9),
        }
        .context("Determining Kron aperture")
        .context("source 7");

        assert!(err.is_edge());
        assert!(!err.is_bad_integral());
        assert!(matches!(err.root(), KronError::OutOfRange { .. }));

        let msg = err.to_string();
        assert!(msg.starts_with("source 7: Determining Kron aperture: footprint"));
    }

    #[test]
    fn test_bad_integral_is_not_edge() {
        let err = KronError::BadKronIntegral.context("source 1");
        assert!(err.is_bad_integral());
        assert!(!err.is_edge());
    }
}
