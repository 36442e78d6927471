use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Measure {
            fits,
            sources,
            config,
            psf,
            image,
            format,
            output,
        } => {
            commands::measure_sources(
                &fits,
                &sources,
                config.as_deref(),
                &psf,
                &image,
                &format,
                output.as_deref(),
            )?;
        }
        Commands::Forced {
            fits,
            reference,
            transform,
            config,
            psf,
            image,
            format,
            output,
        } => {
            commands::measure_forced(
                &fits,
                &reference,
                transform.as_deref(),
                config.as_deref(),
                &psf,
                &image,
                &format,
                output.as_deref(),
            )?;
        }
        Commands::Psf {
            fits,
            x,
            y,
            sources,
            config,
            psf,
            image,
        } => {
            commands::report_psf(&fits, x, y, sources.as_deref(), config.as_deref(), &psf, &image)?;
        }
        Commands::Annotate {
            fits,
            results,
            output,
            n_radius,
            midtone_factor,
            shadow_clipping,
            color,
            flagged_color,
        } => {
            commands::annotate_apertures(
                &fits,
                &results,
                output,
                n_radius,
                midtone_factor,
                shadow_clipping,
                &color,
                &flagged_color,
            )?;
        }
    }

    Ok(())
}
