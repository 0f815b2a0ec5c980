use crate::common::*;
use crate::data::*;
use crate::em::*;
use crate::init::*;
use crate::param::{StateOverrides, StateParams};
use crate::simplex_qp::numerical_rank;

use matrix_util::common_io::open_buf_writer;
use matrix_util::traits::{IoOps, MissingOps};
use matrix_util::utils::generate_minibatch_intervals;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

/// Progress notifications emitted while batches are being fitted
#[derive(Debug, Clone, Serialize)]
pub enum ProgressEvent {
    BatchStarted {
        batch: usize,
        samples: usize,
        regions: usize,
    },
    BatchFinished {
        batch: usize,
        samples: usize,
        status: EmStatus,
        iterations: usize,
    },
    /// a sample fitted on its own observed regions
    SampleFinished {
        sample: Box<str>,
        regions_used: usize,
        status: EmStatus,
        iterations: usize,
    },
}

pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

#[derive(Clone)]
pub struct EstimateConfig {
    pub init_method: InitMethod,
    pub overrides: StateOverrides,
    pub anchors: Option<AnchorRegions>,
    pub epsilon: f64,
    pub max_iter: usize,
    /// number of complete samples fitted together
    pub batch_size: usize,
    pub metric: ConvergenceMetric,
    /// proportions below this are set to zero after fitting (0 = off)
    pub min_proportion: f64,
    pub seed: u64,
    pub progress: Option<ProgressCallback>,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            init_method: InitMethod::Random,
            overrides: StateOverrides::default(),
            anchors: None,
            epsilon: DEFAULT_EPSILON,
            max_iter: DEFAULT_MAX_ITER,
            batch_size: DEFAULT_BATCH_SIZE,
            metric: ConvergenceMetric::PercentLogLikelihood,
            min_proportion: 0.0,
            seed: DEFAULT_SEED,
            progress: None,
        }
    }
}

impl fmt::Debug for EstimateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstimateConfig")
            .field("init_method", &self.init_method)
            .field("overrides", &self.overrides)
            .field("anchors", &self.anchors)
            .field("epsilon", &self.epsilon)
            .field("max_iter", &self.max_iter)
            .field("batch_size", &self.batch_size)
            .field("metric", &self.metric)
            .field("min_proportion", &self.min_proportion)
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

impl EstimateConfig {
    pub fn validate(&self) -> DeconvResult<()> {
        if !(self.epsilon.is_finite() && self.epsilon >= 0.0) {
            return Err(DeconvError::InvalidConfig(format!(
                "epsilon must be a non-negative number: {}",
                self.epsilon
            )));
        }
        if self.max_iter == 0 {
            return Err(DeconvError::InvalidConfig("max_iter must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(DeconvError::InvalidConfig("batch size must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.min_proportion) {
            return Err(DeconvError::InvalidConfig(format!(
                "min_proportion must lie in [0, 1): {}",
                self.min_proportion
            )));
        }
        if self.needs_anchors() && self.anchors.is_none() {
            return Err(DeconvError::InvalidConfig(
                "known_regions initialization requires anchor regions".into(),
            ));
        }

        let ov = &self.overrides;
        if let Some(theta) = ov.complete() {
            theta?;
        }
        for v in [ov.sig0, ov.sig1, ov.tau].into_iter().flatten() {
            if !(v.is_finite() && v > 0.0) {
                return Err(DeconvError::InvalidConfig(format!(
                    "variance override must be positive: {}",
                    v
                )));
            }
        }
        for v in [ov.a0, ov.a1].into_iter().flatten() {
            if !v.is_finite() {
                return Err(DeconvError::InvalidConfig(format!(
                    "mean override must be finite: {}",
                    v
                )));
            }
        }
        if let (Some(a0), Some(a1)) = (ov.a0, ov.a1) {
            if a0 >= a1 {
                return Err(DeconvError::InvalidConfig(format!(
                    "a0 ({}) must be smaller than a1 ({})",
                    a0, a1
                )));
            }
        }
        Ok(())
    }

    /// Anchors matter only when the start is not fully given
    fn needs_anchors(&self) -> bool {
        self.init_method == InitMethod::KnownRegions && self.overrides.complete().is_none()
    }

    fn em_config(&self) -> EmConfig {
        EmConfig {
            epsilon: self.epsilon,
            max_iter: self.max_iter,
            metric: self.metric,
        }
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress(&event);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleDiagnostics {
    pub sample: Box<str>,
    pub batch: usize,
    pub regions_used: usize,
    pub status: EmStatus,
    pub iterations: usize,
    /// final log-likelihood of the batch this sample was fitted in
    pub log_likelihood: f64,
    pub theta: StateParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub source_tag: Box<str>,
    pub n_samples: usize,
    pub cell_types: Vec<Box<str>>,
    pub sample_names: Vec<Box<str>>,
    pub init_method: InitMethod,
    pub metric: ConvergenceMetric,
    pub epsilon: f64,
    pub max_iter: usize,
    pub batch_size: usize,
    pub regions_used: Vec<usize>,
    pub diagnostics: Vec<SampleDiagnostics>,
}

/// Estimated proportions (samples x cell types), rows in the input's
/// sample order, and the run metadata
#[derive(Debug, Clone)]
pub struct CellCounts {
    pub proportions: Mat,
    pub metadata: RunMetadata,
}

impl CellCounts {
    pub fn sample_names(&self) -> &[Box<str>] {
        &self.metadata.sample_names
    }

    pub fn cell_types(&self) -> &[Box<str>] {
        &self.metadata.cell_types
    }

    /// Samples whose batch stopped at `max_iter`
    pub fn num_capped(&self) -> usize {
        self.metadata
            .diagnostics
            .iter()
            .filter(|d| d.status == EmStatus::IterationCapped)
            .count()
    }

    pub fn to_tsv(&self, file_path: &str) -> anyhow::Result<()> {
        self.proportions.to_tsv_with_names(
            file_path,
            self.sample_names(),
            self.cell_types(),
            "sample",
        )
    }

    pub fn write_metadata(&self, file_path: &str) -> anyhow::Result<()> {
        let mut writer = open_buf_writer(file_path)?;
        serde_json::to_writer_pretty(&mut writer, &self.metadata)?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }
}

/// A unit of EM work: either a batch of complete samples over all
/// regions or one sample restricted to its observed regions
struct Job {
    batch: usize,
    samples: Vec<usize>,
    rows: Option<Vec<usize>>,
}

struct SampleFit {
    proportions: DVec,
    diagnostics: SampleDiagnostics,
}

/// Estimate the cell-type proportions of every sample in `source`.
///
/// Samples without missing values are fitted `batch_size` at a time,
/// sharing the state parameters within a batch. Each sample with missing
/// values is fitted alone on the regions it observes. Batches run in
/// parallel on the current rayon pool.
pub fn estimate_cell_counts<S>(
    source: &S,
    signature: &SignatureMatrix,
    config: &EstimateConfig,
) -> DeconvResult<CellCounts>
where
    S: MethylationSource + ?Sized,
{
    config.validate()?;
    validate_observations(source)?;

    let kk = signature.num_cell_types();
    if signature.num_regions() < kk {
        return Err(DeconvError::InsufficientSignal(format!(
            "{} regions for {} cell types",
            signature.num_regions(),
            kk
        )));
    }

    let rank = signature_rank(&signature.mat);
    if rank < kk {
        return Err(DeconvError::InsufficientSignal(format!(
            "the signature separates only {} of {} cell types",
            rank, kk
        )));
    }

    if let Some(anchors) = config.anchors.as_ref() {
        if config.needs_anchors() {
            let (unmeth, meth) = anchors.locate(&signature.regions);
            if unmeth.is_empty() || meth.is_empty() {
                return Err(DeconvError::InsufficientSignal(format!(
                    "{} unmethylated and {} methylated anchor regions among the signature regions",
                    unmeth.len(),
                    meth.len()
                )));
            }
        }
    }

    let ys = align_regions(source, signature)?;
    let samples = source.sample_names();
    let jobs = plan_jobs(&ys, &signature.mat, samples, config.batch_size)?;

    info!(
        "{} samples, {} regions, {} cell types in {} batches ({} missing entries)",
        ys.ncols(),
        ys.nrows(),
        kk,
        jobs.len(),
        ys.num_missing()
    );

    let fits = jobs
        .par_iter()
        .map(|job| fit_job(job, &ys, signature, samples, config))
        .collect::<DeconvResult<Vec<_>>>()?;

    let merged: BTreeMap<usize, SampleFit> = fits.into_iter().flatten().collect();

    let nn = ys.ncols();
    let mut proportions = Mat::zeros(nn, kk);
    let mut diagnostics = Vec::with_capacity(nn);
    for (j, fit) in merged.into_iter() {
        let mut pi = fit.proportions;
        if config.min_proportion > 0.0 {
            trim_small_proportions(&mut pi, config.min_proportion);
        }
        proportions.row_mut(j).copy_from(&pi.transpose());
        diagnostics.push(fit.diagnostics);
    }

    let metadata = RunMetadata {
        source_tag: source.source_tag().into(),
        n_samples: nn,
        cell_types: signature.cell_types.clone(),
        sample_names: samples.to_vec(),
        init_method: config.init_method,
        metric: config.metric,
        epsilon: config.epsilon,
        max_iter: config.max_iter,
        batch_size: config.batch_size,
        regions_used: diagnostics.iter().map(|d| d.regions_used).collect(),
        diagnostics,
    };

    Ok(CellCounts {
        proportions,
        metadata,
    })
}

/// Number of cell types the signature rows can tell apart
fn signature_rank(zs: &Mat) -> usize {
    numerical_rank(&(zs.transpose() * zs))
}

/// Complete samples go into minibatches first; every sample with
/// missing values becomes its own job afterwards
fn plan_jobs(
    ys: &Mat,
    zs: &Mat,
    samples: &[Box<str>],
    batch_size: usize,
) -> DeconvResult<Vec<Job>> {
    let kk = zs.ncols();
    let (incomplete, complete): (Vec<usize>, Vec<usize>) =
        (0..ys.ncols()).partition(|&j| ys.column_has_missing(j));

    let mut jobs: Vec<Job> = generate_minibatch_intervals(complete.len(), batch_size)
        .into_iter()
        .enumerate()
        .map(|(batch, (lb, ub))| Job {
            batch,
            samples: complete[lb..ub].to_vec(),
            rows: None,
        })
        .collect();

    for j in incomplete {
        let rows = ys.observed_rows(j);
        if rows.len() < kk {
            return Err(DeconvError::InsufficientSignal(format!(
                "sample `{}` has {} observed regions for {} cell types",
                samples[j],
                rows.len(),
                kk
            )));
        }
        let rank = signature_rank(&zs.select_rows(rows.iter()));
        if rank < kk {
            return Err(DeconvError::InsufficientSignal(format!(
                "observed regions of sample `{}` separate only {} of {} cell types",
                samples[j], rank, kk
            )));
        }
        jobs.push(Job {
            batch: jobs.len(),
            samples: vec![j],
            rows: Some(rows),
        });
    }

    Ok(jobs)
}

fn fit_job(
    job: &Job,
    ys: &Mat,
    signature: &SignatureMatrix,
    samples: &[Box<str>],
    config: &EstimateConfig,
) -> DeconvResult<Vec<(usize, SampleFit)>> {
    let (ys_job, zs, regions) = match &job.rows {
        Some(rows) => (
            ys.select_rows(rows.iter()).select_columns(job.samples.iter()),
            signature.mat.select_rows(rows.iter()),
            rows.iter()
                .map(|&r| signature.regions[r].clone())
                .collect::<Vec<_>>(),
        ),
        None => (
            ys.select_columns(job.samples.iter()),
            signature.mat.clone(),
            signature.regions.clone(),
        ),
    };
    let nregions = ys_job.nrows();

    if job.rows.is_none() {
        config.notify(ProgressEvent::BatchStarted {
            batch: job.batch,
            samples: job.samples.len(),
            regions: nregions,
        });
    }

    let settings = InitSettings {
        method: config.init_method,
        overrides: config.overrides,
        anchors: config.anchors.as_ref(),
        seed: config.seed,
    };
    let init = initialize(&ys_job, &zs, &regions, &settings, job.batch as u64)?;
    let fit = EmEngine::new(&ys_job, &zs)?.run(init, &config.em_config())?;

    match &job.rows {
        Some(_) => config.notify(ProgressEvent::SampleFinished {
            sample: samples[job.samples[0]].clone(),
            regions_used: nregions,
            status: fit.status,
            iterations: fit.iterations,
        }),
        None => config.notify(ProgressEvent::BatchFinished {
            batch: job.batch,
            samples: job.samples.len(),
            status: fit.status,
            iterations: fit.iterations,
        }),
    }

    let llik = fit.log_likelihood();
    Ok(job
        .samples
        .iter()
        .enumerate()
        .map(|(i, &j)| {
            let diagnostics = SampleDiagnostics {
                sample: samples[j].clone(),
                batch: job.batch,
                regions_used: nregions,
                status: fit.status,
                iterations: fit.iterations,
                log_likelihood: llik,
                theta: fit.theta,
            };
            let proportions = fit.proportions.row(i).transpose();
            (
                j,
                SampleFit {
                    proportions,
                    diagnostics,
                },
            )
        })
        .collect())
}

/// Zero out entries below `cutoff` and renormalize; uniform if nothing
/// survives
fn trim_small_proportions(pi: &mut DVec, cutoff: f64) {
    pi.iter_mut().for_each(|x| {
        if *x < cutoff {
            *x = 0.0;
        }
    });
    let tot = pi.sum();
    if tot > 0.0 {
        *pi /= tot;
    } else {
        pi.fill(1.0 / pi.len() as f64);
    }
}
