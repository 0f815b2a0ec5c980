mod run_estimate;
mod run_simulate;

use clap::{Parser, Subcommand};
use run_estimate::*;
use run_simulate::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Latent-state EM deconvolution of bulk methylation\n\
		  Estimate cell-type proportions of bulk samples from region-level\n\
		  methylation levels and a reference signature matrix.",
    term_width = 80
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Estimate cell-type proportions",
        long_about = "Estimate cell-type proportions in the three stages:\n\
		      (1) Align the observed regions with the signature\n\
		      (2) Fit complete samples in batches and the samples with\n\
		      missing values one at a time by EM\n\
		      (3) Write the proportions and per-sample diagnostics.\n"
    )]
    Estimate(EstimateArgs),

    #[command(
        about = "Simulate bulk methylation from a signature matrix",
        long_about = "Draw Dirichlet proportions and generate region-level\n\
		      methylation levels from the latent-state model.\n"
    )]
    Simulate(SimulateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = match &cli.commands {
        Commands::Estimate(args) => args.verbose,
        Commands::Simulate(args) => args.verbose,
    };

    if verbose {
        std::env::set_var("RUST_LOG", "debug");
    } else if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match &cli.commands {
        Commands::Estimate(args) => {
            run_estimate(args)?;
        }
        Commands::Simulate(args) => {
            run_simulate(args)?;
        }
    }

    Ok(())
}
