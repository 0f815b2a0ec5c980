use lentil::common::*;
use lentil::em::ConvergenceMetric;
use lentil::estimate::ProgressCallback;
use lentil::*;

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use matrix_util::common_io::mkdir;
use rayon::ThreadPoolBuilder;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct EstimateArgs {
    /// methylation levels in `[0, 1]` (`.tsv`, `.csv` or gzipped);
    /// regions in rows, samples in columns, the first column holds
    /// region names, `NA` marks missing values
    #[arg(short = 'y', long, required = true)]
    obs_file: Box<str>,

    /// signature matrix, regions x cell types, in the same format
    #[arg(short = 'z', long, required = true)]
    signature_file: Box<str>,

    /// output header
    #[arg(short, long, required = true)]
    out: Box<str>,

    /// initialization of the state parameters
    #[arg(long, value_enum, default_value = "random")]
    init: InitMethod,

    /// anchor regions: `region  unmethylated|methylated` per line
    #[arg(long)]
    anchors: Option<Box<str>>,

    /// take all-0 (all-1) signature rows as unmethylated (methylated)
    /// anchors
    #[arg(long, default_value_t = false)]
    anchors_from_signature: bool,

    /// starting mean of the unmethylated state
    #[arg(long)]
    a0: Option<f64>,

    /// starting mean of the methylated state
    #[arg(long)]
    a1: Option<f64>,

    /// starting variance of the unmethylated state
    #[arg(long)]
    sig0: Option<f64>,

    /// starting variance of the methylated state
    #[arg(long)]
    sig1: Option<f64>,

    /// starting variance of the measurement error
    #[arg(long)]
    tau: Option<f64>,

    /// convergence threshold
    #[arg(long, default_value_t = DEFAULT_EPSILON)]
    epsilon: f64,

    /// maximum number of EM iterations per batch
    #[arg(long, default_value_t = DEFAULT_MAX_ITER)]
    max_iter: usize,

    /// number of complete samples sharing one set of state parameters
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// quantity compared against `epsilon`
    #[arg(long, value_enum, default_value = "percent-llik")]
    metric: ConvergenceMetric,

    /// set smaller proportions to zero (0 = keep all)
    #[arg(long, default_value_t = 0.0)]
    min_proportion: f64,

    /// random seed
    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// maximum number of threads
    #[arg(long)]
    threads: Option<usize>,

    /// verbosity
    #[arg(long, short)]
    pub verbose: bool,
}

pub fn run_estimate(args: &EstimateArgs) -> anyhow::Result<()> {
    let max_threads = args.threads.unwrap_or(num_cpus::get()).max(1);
    ThreadPoolBuilder::new()
        .num_threads(max_threads)
        .build_global()?;
    info!("will use {} threads", rayon::current_num_threads());

    let obs = MethylationMatrix::from_file(&args.obs_file)?;
    let signature = SignatureMatrix::from_file(&args.signature_file)?;

    info!(
        "read {} regions x {} samples; signature {} regions x {} cell types",
        obs.num_regions(),
        obs.num_samples(),
        signature.num_regions(),
        signature.num_cell_types()
    );

    let anchors = match (&args.anchors, args.anchors_from_signature) {
        (Some(file), false) => Some(AnchorRegions::from_file(file)?),
        (None, true) => Some(AnchorRegions::from_signature(&signature)),
        (Some(_), true) => {
            return Err(anyhow::anyhow!(
                "use either --anchors or --anchors-from-signature"
            ))
        }
        (None, false) => None,
    };

    if let Some(anchors) = anchors.as_ref() {
        info!(
            "{} unmethylated and {} methylated anchor regions",
            anchors.unmethylated.len(),
            anchors.methylated.len()
        );
    }

    let pb = ProgressBar::new(obs.num_samples() as u64);
    pb.set_style(ProgressStyle::with_template(
        "{bar:40} {pos}/{len} samples ({eta})",
    )?);

    let config = EstimateConfig {
        init_method: args.init,
        overrides: StateOverrides {
            a0: args.a0,
            a1: args.a1,
            sig0: args.sig0,
            sig1: args.sig1,
            tau: args.tau,
        },
        anchors,
        epsilon: args.epsilon,
        max_iter: args.max_iter,
        batch_size: args.batch_size,
        metric: args.metric,
        min_proportion: args.min_proportion,
        seed: args.seed,
        progress: Some(progress_logger(pb.clone())),
    };

    let cell_counts = estimate_cell_counts(&obs, &signature, &config)?;
    pb.finish_and_clear();

    let ncapped = cell_counts.num_capped();
    if ncapped > 0 {
        warn!(
            "{} of {} samples reached {} iterations before converging",
            ncapped,
            obs.num_samples(),
            args.max_iter
        );
    }

    let proportions_file = format!("{}.proportions.tsv.gz", args.out);
    let metadata_file = format!("{}.metadata.json", args.out);
    mkdir(&proportions_file)?;

    cell_counts.to_tsv(&proportions_file)?;
    cell_counts.write_metadata(&metadata_file)?;

    info!("wrote {} and {}", proportions_file, metadata_file);
    Ok(())
}

fn progress_logger(pb: ProgressBar) -> ProgressCallback {
    Arc::new(move |event: &ProgressEvent| match event {
        ProgressEvent::BatchStarted {
            batch,
            samples,
            regions,
        } => {
            debug!(
                "batch {}: {} samples over {} regions",
                batch, samples, regions
            );
        }
        ProgressEvent::BatchFinished {
            batch,
            samples,
            status,
            iterations,
        } => {
            if *status == em::EmStatus::IterationCapped {
                warn!("batch {} stopped at {} iterations", batch, iterations);
            } else {
                info!("batch {} converged in {} iterations", batch, iterations);
            }
            pb.inc(*samples as u64);
        }
        ProgressEvent::SampleFinished {
            sample,
            regions_used,
            status,
            iterations,
        } => {
            if *status == em::EmStatus::IterationCapped {
                warn!(
                    "{}: stopped at {} iterations on {} regions",
                    sample, iterations, regions_used
                );
            } else {
                debug!(
                    "{}: {} iterations on {} observed regions",
                    sample, iterations, regions_used
                );
            }
            pb.inc(1);
        }
    })
}
