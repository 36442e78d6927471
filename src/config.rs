/// Control parameters for Kron photometry
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::KronError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KronFluxConfig {
    /// Use the aperture already recorded for the source rather than iterating
    pub fixed: bool,
    /// Multiplier of the source size used to build the moment footprint
    pub n_sigma_for_radius: f64,
    /// Number of solver iterations
    pub n_iter_for_radius: u32,
    /// Number of Kron radii used for the flux aperture
    pub n_radius_for_flux: f64,
    /// Largest semi-minor axis measured with the sub-pixel integrator
    pub max_sinc_radius: f64,
    /// Smallest acceptable Kron radius; <= 0 uses the PSF Kron radius instead
    pub minimum_radius: f64,
    pub enforce_minimum_radius: bool,
    /// Seed the starting radius from the detection footprint when it's larger
    pub use_footprint_radius: bool,
    /// Gaussian sigma to smooth with before measuring the radius; <= 0 disables
    pub smoothing_sigma: f64,
}

impl Default for KronFluxConfig {
    fn default() -> Self {
        Self {
            fixed: false,
            n_sigma_for_radius: 6.0,
            n_iter_for_radius: 1,
            n_radius_for_flux: 2.5,
            max_sinc_radius: 10.0,
            minimum_radius: 0.0,
            enforce_minimum_radius: true,
            use_footprint_radius: false,
            smoothing_sigma: -1.0,
        }
    }
}

impl KronFluxConfig {
    /// Load a JSON configuration; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the solver can't run with
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |message: String| Err(KronError::Config(message));
        if !(self.n_sigma_for_radius > 0.0) {
            return invalid(format!(
                "n_sigma_for_radius must be positive, got {}",
                self.n_sigma_for_radius
            ));
        }
        if self.n_iter_for_radius == 0 {
            return invalid("n_iter_for_radius must be at least 1".to_string());
        }
        if !(self.n_radius_for_flux > 0.0) {
            return invalid(format!(
                "n_radius_for_flux must be positive, got {}",
                self.n_radius_for_flux
            ));
        }
        if !(self.max_sinc_radius >= 0.0) {
            return invalid(format!(
                "max_sinc_radius must be non-negative, got {}",
                self.max_sinc_radius
            ));
        }
        if !self.minimum_radius.is_finite() || !self.smoothing_sigma.is_finite() {
            return invalid("minimum_radius and smoothing_sigma must be finite".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KronFluxConfig::default();
        assert!(!config.fixed);
        assert_eq!(config.n_sigma_for_radius, 6.0);
        assert_eq!(config.n_iter_for_radius, 1);
        assert_eq!(config.n_radius_for_flux, 2.5);
        assert_eq!(config.max_sinc_radius, 10.0);
        assert_eq!(config.minimum_radius, 0.0);
        assert!(config.enforce_minimum_radius);
        assert!(!config.use_footprint_radius);
        assert_eq!(config.smoothing_sigma, -1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config: KronFluxConfig =
            serde_json::from_str(r#"{"n_iter_for_radius": 3, "minimum_radius": 2.5}"#).unwrap();
        assert_eq!(config.n_iter_for_radius, 3);
        assert_eq!(config.minimum_radius, 2.5);
        assert_eq!(config.n_sigma_for_radius, 6.0);

        assert!(serde_json::from_str::<KronFluxConfig>(r#"{"n_iter": 3}"#).is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = KronFluxConfig {
            n_iter_for_radius: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err(),
            KronError::Config("n_iter_for_radius must be at least 1".to_string())
        );

        config.n_iter_for_radius = 2;
        config.n_radius_for_flux = 0.0;
        assert!(config.validate().is_err());

        config.n_radius_for_flux = 2.5;
        config.max_sinc_radius = -1.0;
        assert!(config.validate().is_err());

        config.max_sinc_radius = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("kron-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"smoothing_sigma": 1.5, "fixed": true}"#).unwrap();
        let config = KronFluxConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(config.fixed);
        assert_eq!(config.smoothing_sigma, 1.5);

        assert!(KronFluxConfig::from_file(Path::new("/nonexistent/kron.json")).is_err());
    }
}
