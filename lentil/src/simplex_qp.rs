//! Least squares on the probability simplex.
//!
//! Minimize ½ πᵀHπ − gᵀπ subject to 1ᵀπ = 1 and π ≥ 0, where
//! `H = Zᵀ D Z` and `g = Zᵀ D t` for a signature `Z`, region weights `D`
//! and a target vector `t`. Solved exactly by a primal active-set method:
//! the number of cell types is small, so every step solves the full
//! equality-constrained KKT system of the free coordinates.

use crate::common::*;
use nalgebra::SymmetricEigen;

/// eigenvalues below this fraction of the largest one count as zero
const RANK_TOL: f64 = 1e-10;
const STEP_TOL: f64 = 1e-12;
const MULTIPLIER_TOL: f64 = 1e-12;

/// π minimizing ‖Z π − t‖² on the simplex
pub fn solve(zs: &Mat, target: &DVec) -> DeconvResult<DVec> {
    let weights = DVec::from_element(zs.nrows(), 1.0);
    solve_weighted(zs, target, &weights)
}

/// π minimizing Σ_r d_r ((Z π)_r − t_r)² on the simplex
pub fn solve_weighted(zs: &Mat, target: &DVec, weights: &DVec) -> DeconvResult<DVec> {
    if zs.nrows() != target.len() || zs.nrows() != weights.len() {
        return Err(DeconvError::ShapeMismatch(format!(
            "signature has {} regions, target {}, weights {}",
            zs.nrows(),
            target.len(),
            weights.len()
        )));
    }
    if weights.iter().any(|&d| !(d.is_finite() && d >= 0.0)) {
        return Err(DeconvError::Solver("weights must be finite and non-negative".into()));
    }
    if target.iter().any(|t| !t.is_finite()) {
        return Err(DeconvError::Solver("non-finite target".into()));
    }

    // scale rows by √d so that H = Zᵀ D Z
    let mut zw = zs.clone();
    for (mut row, &d) in zw.row_iter_mut().zip(weights.iter()) {
        row *= d.sqrt();
    }
    let tw = target.component_mul(&weights.map(f64::sqrt));

    let hh = zw.transpose() * &zw;
    let gg = zw.transpose() * tw;
    solve_quadratic(&hh, &gg)
}

/// Ordinary least squares without any constraint; used to check the
/// interior case
pub fn unconstrained_least_squares(zs: &Mat, target: &DVec) -> DeconvResult<DVec> {
    let hh = zs.transpose() * zs;
    check_rank(&hh)?;
    let gg = zs.transpose() * target;
    hh.cholesky()
        .map(|chol| chol.solve(&gg))
        .ok_or(DeconvError::Solver("Cholesky factorization failed".into()))
}

/// Number of eigenvalues of the symmetric matrix `hh` that are
/// distinguishable from zero
pub fn numerical_rank(hh: &Mat) -> usize {
    let eigen = SymmetricEigen::new(hh.clone());
    let top = eigen.eigenvalues.iter().fold(0.0_f64, |a, &b| a.max(b.abs()));
    if top <= 0.0 {
        return 0;
    }
    eigen
        .eigenvalues
        .iter()
        .filter(|&&ev| ev > RANK_TOL * top)
        .count()
}

fn check_rank(hh: &Mat) -> DeconvResult<()> {
    let rank = numerical_rank(hh);
    if rank < hh.ncols() {
        return Err(DeconvError::RankDeficient {
            rank,
            ncols: hh.ncols(),
        });
    }
    Ok(())
}

/// Minimize ½ πᵀHπ − gᵀπ on the simplex. `H` must be positive definite.
pub fn solve_quadratic(hh: &Mat, gg: &DVec) -> DeconvResult<DVec> {
    let kk = gg.len();
    if kk == 0 || hh.nrows() != kk || hh.ncols() != kk {
        return Err(DeconvError::ShapeMismatch(format!(
            "{} x {} quadratic form with {} linear terms",
            hh.nrows(),
            hh.ncols(),
            kk
        )));
    }
    check_rank(hh)?;

    if kk == 1 {
        return Ok(DVec::from_element(1, 1.0));
    }

    let mut x = DVec::from_element(kk, 1.0 / kk as f64);
    let mut bound = vec![false; kk]; // working set of π_k = 0

    for _ in 0..(50 * (kk + 1)) {
        let free: Vec<usize> = (0..kk).filter(|&k| !bound[k]).collect();
        let nf = free.len();
        let grad = hh * &x - gg;

        // [H_FF 1; 1ᵀ 0] [p; λ] = [-∇_F; 0]
        let mut kkt = Mat::zeros(nf + 1, nf + 1);
        let mut rhs = DVec::zeros(nf + 1);
        for (a, &i) in free.iter().enumerate() {
            for (b, &j) in free.iter().enumerate() {
                kkt[(a, b)] = hh[(i, j)];
            }
            kkt[(a, nf)] = 1.0;
            kkt[(nf, a)] = 1.0;
            rhs[a] = -grad[i];
        }

        let sol = kkt
            .lu()
            .solve(&rhs)
            .ok_or(DeconvError::Solver("singular KKT system".into()))?;
        let lambda = sol[nf];
        let step = sol.rows(0, nf);

        if step.amax() < STEP_TOL {
            // multipliers of the bounds in the working set
            let leaving = (0..kk)
                .filter(|&k| bound[k])
                .map(|k| (k, grad[k] + lambda))
                .min_by(|a, b| a.1.total_cmp(&b.1));

            match leaving {
                Some((k, mu)) if mu < -MULTIPLIER_TOL => {
                    bound[k] = false;
                    continue;
                }
                _ => return Ok(polish(x)),
            }
        }

        // longest feasible step along p
        let mut alpha = 1.0;
        let mut blocking = None;
        for (a, &i) in free.iter().enumerate() {
            if step[a] < 0.0 {
                let ratio = -x[i] / step[a];
                if ratio < alpha {
                    alpha = ratio;
                    blocking = Some(i);
                }
            }
        }

        for (a, &i) in free.iter().enumerate() {
            x[i] += alpha * step[a];
        }

        if let Some(i) = blocking {
            x[i] = 0.0;
            bound[i] = true;
        }
    }

    Err(DeconvError::Solver(format!(
        "active set did not settle for {} cell types",
        kk
    )))
}

/// Zero out round-off and restore the unit sum
fn polish(mut x: DVec) -> DVec {
    x.iter_mut().for_each(|v| {
        if *v < 1e-12 {
            *v = 0.0;
        }
    });
    let tot = x.sum();
    x / tot
}
