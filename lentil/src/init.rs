use crate::common::*;
use crate::data::AnchorRegions;
use crate::param::{StateOverrides, StateParams};
use crate::simplex_qp;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Exp1;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitMethod {
    /// random proportions; state means from empirical quantiles
    Random,
    /// state means and variances from anchor regions
    #[value(alias = "known_regions")]
    KnownRegions,
}

impl FromStr for InitMethod {
    type Err = DeconvError;

    fn from_str(s: &str) -> DeconvResult<Self> {
        match s {
            "random" => Ok(InitMethod::Random),
            "known_regions" | "known-regions" => Ok(InitMethod::KnownRegions),
            _ => Err(DeconvError::InvalidConfig(format!(
                "unsupported initialization method `{}` (random | known_regions)",
                s
            ))),
        }
    }
}

impl fmt::Display for InitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitMethod::Random => write!(f, "random"),
            InitMethod::KnownRegions => write!(f, "known_regions"),
        }
    }
}

/// How to produce the starting point of one EM run
#[derive(Debug, Clone, Copy)]
pub struct InitSettings<'a> {
    pub method: InitMethod,
    pub overrides: StateOverrides,
    pub anchors: Option<&'a AnchorRegions>,
    pub seed: u64,
}

/// θ and per-sample π (samples in rows) to start the EM iterations from
#[derive(Debug, Clone)]
pub struct InitialState {
    pub theta: StateParams,
    pub proportions: Mat,
}

/// Produce the starting θ and π for one batch.
///
/// * `ys` - regions x samples (no missing entries)
/// * `zs` - regions x cell types
/// * `regions` - names of the rows of `ys` and `zs`
/// * `stream` - batch index; mixed into the seed
pub fn initialize(
    ys: &Mat,
    zs: &Mat,
    regions: &[Box<str>],
    settings: &InitSettings,
    stream: u64,
) -> DeconvResult<InitialState> {
    if ys.nrows() != zs.nrows() || regions.len() != ys.nrows() {
        return Err(DeconvError::ShapeMismatch(format!(
            "{} observed rows, {} signature rows, {} region names",
            ys.nrows(),
            zs.nrows(),
            regions.len()
        )));
    }

    // explicit values bypass both modes
    if let Some(theta) = settings.overrides.complete() {
        let theta = theta?;
        let proportions = warm_start_proportions(ys, zs, &theta)?;
        return Ok(InitialState { theta, proportions });
    }

    let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(stream));

    let ret = match settings.method {
        InitMethod::Random => {
            let theta = random_state(ys, &mut rng);
            let theta = settings.overrides.apply(theta)?;
            let proportions = flat_dirichlet(ys.ncols(), zs.ncols(), &mut rng);
            InitialState { theta, proportions }
        }
        InitMethod::KnownRegions => {
            let anchors = settings.anchors.ok_or(DeconvError::InvalidConfig(
                "known_regions initialization requires anchor regions".into(),
            ))?;
            let theta = anchor_state(ys, regions, anchors)?;
            let theta = settings.overrides.apply(theta)?;
            let proportions = warm_start_proportions(ys, zs, &theta)?;
            InitialState { theta, proportions }
        }
    };

    debug!("initial state {:?}", ret.theta);
    Ok(ret)
}

/// Flat Dirichlet draws, one row per sample
pub fn flat_dirichlet(nsamples: usize, ncelltypes: usize, rng: &mut StdRng) -> Mat {
    let mut ret = Mat::from_fn(nsamples, ncelltypes, |_, _| {
        let e: f64 = rng.sample(Exp1);
        e + f64::MIN_POSITIVE
    });
    for mut row in ret.row_iter_mut() {
        let tot = row.sum();
        row /= tot;
    }
    ret
}

/// State means from random low/high empirical quantiles of `ys`
fn random_state(ys: &Mat, rng: &mut StdRng) -> StateParams {
    let mut values: Vec<f64> = ys.iter().copied().filter(|x| x.is_finite()).collect();
    values.sort_by(f64::total_cmp);

    let mut a0 = quantile_sorted(&values, rng.random_range(0.05..0.20));
    let mut a1 = quantile_sorted(&values, rng.random_range(0.80..0.95));

    if a1 - a0 < MIN_STATE_GAP {
        let mid = 0.5 * (a0 + a1);
        a0 = mid - 0.5 * MIN_STATE_GAP;
        a1 = mid + 0.5 * MIN_STATE_GAP;
    }

    let var = (0.1 * variance(&values)).max(VAR_FLOOR);

    StateParams {
        a0,
        a1,
        sig0: var,
        sig1: var,
        tau: var,
    }
}

/// a0/sig0 and a1/sig1 from the unmethylated and methylated anchor rows;
/// tau from the across-sample spread of the same rows
fn anchor_state(
    ys: &Mat,
    regions: &[Box<str>],
    anchors: &AnchorRegions,
) -> DeconvResult<StateParams> {
    let (unmeth, meth) = anchors.locate(regions);

    if unmeth.is_empty() || meth.is_empty() {
        return Err(DeconvError::InsufficientSignal(format!(
            "{} unmethylated and {} methylated anchor regions among {} regions",
            unmeth.len(),
            meth.len(),
            regions.len()
        )));
    }

    let pick = |rows: &[usize]| -> Vec<f64> {
        rows.iter()
            .flat_map(|&r| ys.row(r).iter().copied().collect::<Vec<_>>())
            .filter(|x| x.is_finite())
            .collect()
    };

    let values0 = pick(&unmeth);
    let values1 = pick(&meth);

    let a0 = mean(&values0);
    let a1 = mean(&values1);
    if a0 >= a1 {
        return Err(DeconvError::InsufficientSignal(format!(
            "unmethylated anchors average {:.3}, not below methylated anchors {:.3}",
            a0, a1
        )));
    }
    let sig0 = variance(&values0).max(VAR_FLOOR);
    let sig1 = variance(&values1).max(VAR_FLOOR);

    let tau = if ys.ncols() > 1 {
        let spread: Vec<f64> = unmeth
            .iter()
            .chain(meth.iter())
            .map(|&r| variance(&ys.row(r).iter().copied().collect::<Vec<_>>()))
            .collect();
        mean(&spread).max(VAR_FLOOR)
    } else {
        (0.5 * sig0.min(sig1)).max(VAR_FLOOR)
    };

    Ok(StateParams {
        a0,
        a1,
        sig0,
        sig1,
        tau,
    })
}

/// Simplex least-squares fit of the rescaled observations
/// `clamp((y - a0) / (a1 - a0), 0, 1)`, one row per sample
pub fn warm_start_proportions(ys: &Mat, zs: &Mat, theta: &StateParams) -> DeconvResult<Mat> {
    let gap = theta.a1 - theta.a0;
    let mut ret = Mat::zeros(ys.ncols(), zs.ncols());
    for (j, y_j) in ys.column_iter().enumerate() {
        let target = y_j.map(|y| ((y - theta.a0) / gap).clamp(0.0, 1.0));
        let pi = simplex_qp::solve(zs, &target)?;
        ret.row_mut(j).copy_from(&pi.transpose());
    }
    Ok(ret)
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let mu = mean(xs);
    xs.iter().map(|x| (x - mu).powi(2)).sum::<f64>() / xs.len() as f64
}

/// Linear interpolation between order statistics
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.5;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lb = pos.floor() as usize;
    let ub = (lb + 1).min(sorted.len() - 1);
    let frac = pos - lb as f64;
    sorted[lb] * (1.0 - frac) + sorted[ub] * frac
}
