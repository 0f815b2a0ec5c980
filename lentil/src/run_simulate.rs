use lentil::common::*;
use lentil::simulate::*;
use lentil::*;

use clap::Args;
use matrix_util::common_io::mkdir;
use matrix_util::traits::IoOps;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// signature matrix, regions x cell types (first column: region names)
    #[arg(short = 'z', long, required = true)]
    signature_file: Box<str>,

    /// output header
    #[arg(short, long, required = true)]
    out: Box<str>,

    /// number of bulk samples
    #[arg(short = 'n', long, default_value_t = 100)]
    num_samples: usize,

    /// mean of the unmethylated state
    #[arg(long, default_value_t = 0.1)]
    a0: f64,

    /// mean of the methylated state
    #[arg(long, default_value_t = 0.85)]
    a1: f64,

    /// variance of the unmethylated state
    #[arg(long, default_value_t = 0.002)]
    sig0: f64,

    /// variance of the methylated state
    #[arg(long, default_value_t = 0.002)]
    sig1: f64,

    /// variance of the measurement error
    #[arg(long, default_value_t = 5e-4)]
    tau: f64,

    /// fraction of entries to blank out as missing
    #[arg(long, default_value_t = 0.0)]
    missing_rate: f64,

    /// random seed
    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// verbosity
    #[arg(long, short)]
    pub verbose: bool,
}

pub fn run_simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    let signature = SignatureMatrix::from_file(&args.signature_file)?;
    let theta = StateParams::new(args.a0, args.a1, args.sig0, args.sig1, args.tau)?;

    let SimOut { obs, proportions } = simulate_methylation(
        &signature,
        args.num_samples,
        &theta,
        args.missing_rate,
        args.seed,
    )?;

    let obs_file = format!("{}.obs.tsv.gz", args.out);
    let fractions_file = format!("{}.fractions.tsv.gz", args.out);
    mkdir(&obs_file)?;

    obs.methylation()
        .to_tsv_with_names(&obs_file, obs.region_names(), obs.sample_names(), "region")?;
    proportions.to_tsv_with_names(
        &fractions_file,
        obs.sample_names(),
        &signature.cell_types,
        "sample",
    )?;

    info!("wrote {} and {}", obs_file, fractions_file);
    Ok(())
}
