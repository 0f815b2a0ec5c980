use crate::common::*;
use crate::init::InitialState;
use crate::param::StateParams;
use crate::simplex_qp;

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Scalar summary compared against `epsilon` after every iteration
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceMetric {
    /// 100 x |Δ log-likelihood| / max(|previous log-likelihood|, 1)
    #[value(name = "percent-llik")]
    PercentLogLikelihood,
    /// largest absolute change in a0, a1, the state/noise standard
    /// deviations and the proportions
    #[value(name = "max-param")]
    MaxParameterChange,
}

#[derive(Debug, Clone, Copy)]
pub struct EmConfig {
    pub epsilon: f64,
    pub max_iter: usize,
    pub metric: ConvergenceMetric,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            max_iter: DEFAULT_MAX_ITER,
            metric: ConvergenceMetric::PercentLogLikelihood,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmStatus {
    Converged,
    IterationCapped,
}

/// Outcome of one EM run over a batch
#[derive(Debug, Clone)]
pub struct EmFit {
    /// samples x cell types
    pub proportions: Mat,
    pub theta: StateParams,
    pub iterations: usize,
    pub status: EmStatus,
    /// observed-data log-likelihood, starting point first
    pub llik_trace: Vec<f64>,
}

impl EmFit {
    pub fn log_likelihood(&self) -> f64 {
        self.llik_trace.last().copied().unwrap_or(f64::NAN)
    }
}

/// Posterior moments of the two latent state signals at one (region,
/// sample) pair
#[derive(Debug, Clone, Copy)]
struct Posterior {
    w: f64,
    y: f64,
    eu: f64,
    em: f64,
    vu: f64,
    vm: f64,
    cov: f64,
}

impl Posterior {
    /// Condition (U, M) ~ N((a0, a1), diag(sig0, sig1)) on
    /// y = (1 - w) U + w M + e, e ~ N(0, tau)
    fn new(y: f64, w: f64, theta: &StateParams) -> Self {
        let h0 = 1.0 - w;
        let s = theta.mixed_var(w);
        let resid = y - theta.mixed_mean(w);
        let (k0, k1) = (h0 * theta.sig0 / s, w * theta.sig1 / s);

        Self {
            w,
            y,
            eu: theta.a0 + k0 * resid,
            em: theta.a1 + k1 * resid,
            vu: theta.sig0 - h0 * theta.sig0 * k0,
            vm: theta.sig1 - w * theta.sig1 * k1,
            cov: -h0 * theta.sig0 * k1,
        }
    }

    /// E[(y - X)²] where X = (1 - w) U + w M
    fn expected_sq_error(&self) -> f64 {
        let h0 = 1.0 - self.w;
        let resid = self.y - h0 * self.eu - self.w * self.em;
        resid * resid
            + h0 * h0 * self.vu
            + self.w * self.w * self.vm
            + 2.0 * h0 * self.w * self.cov
    }

    /// Weight E[(M - U)²] and target E[(y - U)(M - U)] / E[(M - U)²] of
    /// the least-squares problem in w
    fn weighted_target(&self) -> (f64, f64) {
        let gap = self.em - self.eu;
        let dd = gap * gap + self.vm + self.vu - 2.0 * self.cov;
        let rd = (self.y - self.eu) * gap + self.vu - self.cov;
        (dd, rd / dd)
    }
}

/// EM iterations for samples that share one region set
///
/// * `ys` - regions x samples, fully observed
/// * `zs` - regions x cell types
pub struct EmEngine<'a> {
    ys: &'a Mat,
    zs: &'a Mat,
}

impl<'a> EmEngine<'a> {
    pub fn new(ys: &'a Mat, zs: &'a Mat) -> DeconvResult<Self> {
        if ys.nrows() != zs.nrows() {
            return Err(DeconvError::ShapeMismatch(format!(
                "{} observed regions vs {} signature regions",
                ys.nrows(),
                zs.nrows()
            )));
        }
        if ys.nrows() == 0 || ys.ncols() == 0 {
            return Err(DeconvError::InsufficientSignal(
                "empty EM batch".into(),
            ));
        }
        if ys.iter().any(|y| !y.is_finite()) {
            return Err(DeconvError::InvalidConfig(
                "EM batch contains missing observations".into(),
            ));
        }
        Ok(Self { ys, zs })
    }

    /// Methylated fraction w = Z π for every region (rows) and sample
    /// (columns)
    fn mixing_fractions(&self, proportions: &Mat) -> Mat {
        self.zs * proportions.transpose()
    }

    /// Observed-data log-likelihood of the batch
    pub fn log_likelihood(&self, proportions: &Mat, theta: &StateParams) -> f64 {
        let ww = self.mixing_fractions(proportions);
        self.ys
            .iter()
            .zip(ww.iter())
            .map(|(&y, &w)| {
                let v = theta.mixed_var(w);
                let d = y - theta.mixed_mean(w);
                -0.5 * ((2.0 * PI * v).ln() + d * d / v)
            })
            .sum()
    }

    fn e_step(&self, proportions: &Mat, theta: &StateParams) -> Vec<Posterior> {
        let ww = self.mixing_fractions(proportions);
        self.ys
            .iter()
            .zip(ww.iter())
            .map(|(&y, &w)| Posterior::new(y, w, theta))
            .collect()
    }

    /// Closed-form a0, a1, sig0, sig1, tau pooled over the batch
    fn update_state(&self, post: &[Posterior]) -> StateParams {
        let n = post.len() as f64;
        let a0 = post.iter().map(|p| p.eu).sum::<f64>() / n;
        let a1 = post.iter().map(|p| p.em).sum::<f64>() / n;
        let sig0 = post.iter().map(|p| p.vu + (p.eu - a0).powi(2)).sum::<f64>() / n;
        let sig1 = post.iter().map(|p| p.vm + (p.em - a1).powi(2)).sum::<f64>() / n;
        let tau = post.iter().map(Posterior::expected_sq_error).sum::<f64>() / n;

        let mut ret = StateParams {
            a0,
            a1,
            sig0,
            sig1,
            tau,
        };
        ret.floor_variances();
        ret
    }

    /// Simplex-constrained proportions, one sample at a time
    fn update_proportions(&self, post: &[Posterior]) -> DeconvResult<Mat> {
        let nregions = self.ys.nrows();
        let mut ret = Mat::zeros(self.ys.ncols(), self.zs.ncols());

        // `post` follows the column-major order of `ys`
        for (j, col) in post.chunks(nregions).enumerate() {
            let (weights, target): (Vec<f64>, Vec<f64>) =
                col.iter().map(Posterior::weighted_target).unzip();
            let pi = simplex_qp::solve_weighted(
                self.zs,
                &DVec::from_vec(target),
                &DVec::from_vec(weights),
            )?;
            ret.row_mut(j).copy_from(&pi.transpose());
        }
        Ok(ret)
    }

    /// Iterate E and M steps from `init` until the convergence metric
    /// drops below `epsilon` or `max_iter` iterations have run
    pub fn run(&self, init: InitialState, config: &EmConfig) -> DeconvResult<EmFit> {
        let InitialState {
            mut theta,
            mut proportions,
        } = init;

        if proportions.nrows() != self.ys.ncols() || proportions.ncols() != self.zs.ncols() {
            return Err(DeconvError::ShapeMismatch(format!(
                "initial proportions {} x {} for {} samples and {} cell types",
                proportions.nrows(),
                proportions.ncols(),
                self.ys.ncols(),
                self.zs.ncols()
            )));
        }

        let mut llik = self.log_likelihood(&proportions, &theta);
        let mut llik_trace = vec![llik];

        for iter in 1..=config.max_iter {
            let post = self.e_step(&proportions, &theta);
            let theta_new = self.update_state(&post);
            let proportions_new = self.update_proportions(&post)?;
            let llik_new = self.log_likelihood(&proportions_new, &theta_new);

            let delta = match config.metric {
                ConvergenceMetric::PercentLogLikelihood => {
                    100.0 * (llik_new - llik).abs() / llik.abs().max(1.0)
                }
                ConvergenceMetric::MaxParameterChange => theta_new
                    .max_abs_change(&theta)
                    .max((&proportions_new - &proportions).amax()),
            };

            debug!(
                "[{}] log-likelihood: {:.5}, change: {:.3e}",
                iter, llik_new, delta
            );

            theta = theta_new;
            proportions = proportions_new;
            llik = llik_new;
            llik_trace.push(llik);

            if delta < config.epsilon {
                return Ok(EmFit {
                    proportions,
                    theta,
                    iterations: iter,
                    status: EmStatus::Converged,
                    llik_trace,
                });
            }
        }

        Ok(EmFit {
            proportions,
            theta,
            iterations: config.max_iter,
            status: EmStatus::IterationCapped,
            llik_trace,
        })
    }
}
