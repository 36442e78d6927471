use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kron-photometry")]
#[command(about = "Measure Kron fluxes of sources in FITS images", long_about = None)]
pub struct Cli {
    /// Log debug output (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Measure Kron fluxes for a catalog of sources
    Measure {
        /// FITS file to measure
        fits: String,

        /// JSON array of sources: {"id", "x", "y", "shape": {"a", "b", "theta"}, "footprint_radius"}
        #[arg(short, long)]
        sources: String,

        /// JSON file of algorithm settings (missing fields take defaults)
        #[arg(short, long)]
        config: Option<String>,

        #[command(flatten)]
        psf: PsfOptions,

        #[command(flatten)]
        image: ImageOptions,

        /// Output format (json, csv, table)
        #[arg(short, long, default_value = "table")]
        format: String,

        /// Write results here instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Forced Kron photometry using apertures measured on a reference image
    Forced {
        /// FITS file to measure
        fits: String,

        /// JSON results of `measure` on the reference image
        #[arg(short, long)]
        reference: String,

        /// Reference to measurement transform: a,b,c,d,tx,ty with
        /// x' = a x + b y + tx, y' = c x + d y + ty
        #[arg(long, value_delimiter = ',', num_args = 6, allow_hyphen_values = true)]
        transform: Option<Vec<f64>>,

        #[arg(short, long)]
        config: Option<String>,

        #[command(flatten)]
        psf: PsfOptions,

        #[command(flatten)]
        image: ImageOptions,

        /// Output format (json, csv, table)
        #[arg(short, long, default_value = "table")]
        format: String,

        #[arg(short, long)]
        output: Option<String>,
    },

    /// Report the PSF Kron radius and PSF flux factor at a position
    Psf {
        /// FITS file the PSF belongs to
        fits: String,

        /// Position to evaluate the PSF at
        #[arg(long)]
        x: f64,

        #[arg(long)]
        y: f64,

        /// Sources to fit when using --fit-psf
        #[arg(short, long)]
        sources: Option<String>,

        #[arg(short, long)]
        config: Option<String>,

        #[command(flatten)]
        psf: PsfOptions,

        #[command(flatten)]
        image: ImageOptions,
    },

    /// Draw Kron apertures from a results file on a stretched PNG
    Annotate {
        /// FITS file the results were measured on
        fits: String,

        /// JSON results of `measure` or `forced`
        #[arg(short, long)]
        results: String,

        /// Output PNG (default: <fits>_kron.png)
        #[arg(short, long)]
        output: Option<String>,

        /// Number of Kron radii to draw
        #[arg(long, default_value = "2.5")]
        n_radius: f64,

        /// MTF midtone factor (0.0-1.0)
        #[arg(long, default_value = "0.15")]
        midtone_factor: f64,

        /// Shadow clipping in MAD units
        #[arg(long, default_value = "-2.8", allow_hyphen_values = true)]
        shadow_clipping: f64,

        /// Color for good measurements (red, green, blue, yellow, cyan, magenta, white)
        #[arg(long, default_value = "green")]
        color: String,

        /// Color for flagged or failed measurements
        #[arg(long, default_value = "red")]
        flagged_color: String,
    },
}

#[derive(Parser, Debug, Clone)]
pub struct PsfOptions {
    /// Gaussian PSF sigma in pixels
    #[arg(long, conflicts_with_all = ["psf_fwhm", "fit_psf"])]
    pub psf_sigma: Option<f64>,

    /// Gaussian PSF FWHM in pixels
    #[arg(long, conflicts_with = "fit_psf")]
    pub psf_fwhm: Option<f64>,

    /// Estimate the PSF by fitting Gaussians to the brightest sources
    #[arg(long)]
    pub fit_psf: bool,

    /// Number of sources to fit with --fit-psf
    #[arg(long, default_value = "20")]
    pub psf_sources: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct ImageOptions {
    /// Detector gain (e-/ADU) for the Poisson part of the variance
    #[arg(long)]
    pub gain: Option<f64>,

    /// Don't subtract the median background before measuring
    #[arg(long)]
    pub keep_background: bool,
}
