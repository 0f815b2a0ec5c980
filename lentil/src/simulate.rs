use crate::common::*;
use crate::data::{MethylationMatrix, SignatureMatrix};
use crate::init::flat_dirichlet;
use crate::param::StateParams;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

pub struct SimOut {
    pub obs: MethylationMatrix,
    /// true proportions, samples x cell types
    pub proportions: Mat,
}

/// Generate bulk methylation from the latent-state model for the given
/// proportions (samples x cell types).
///
/// Each entry is `(1 - w) U + w M + e` with `w = Z π`, clamped to
/// `[0, 1]`. With `missing_rate > 0` entries are blanked at random.
pub fn simulate_with_proportions(
    signature: &SignatureMatrix,
    proportions: &Mat,
    theta: &StateParams,
    missing_rate: f64,
    seed: u64,
) -> DeconvResult<SimOut> {
    theta.validate()?;
    if proportions.ncols() != signature.num_cell_types() {
        return Err(DeconvError::ShapeMismatch(format!(
            "{} proportion columns for {} cell types",
            proportions.ncols(),
            signature.num_cell_types()
        )));
    }
    if !(0.0..1.0).contains(&missing_rate) {
        return Err(DeconvError::InvalidConfig(format!(
            "missing rate must lie in [0, 1): {}",
            missing_rate
        )));
    }

    let normal = |mean: f64, var: f64| {
        Normal::new(mean, var.sqrt()).map_err(|e| DeconvError::InvalidConfig(e.to_string()))
    };
    let unmeth = normal(theta.a0, theta.sig0)?;
    let meth = normal(theta.a1, theta.sig1)?;
    let noise = normal(0.0, theta.tau)?;

    let mut rng = StdRng::seed_from_u64(seed);
    let ww = &signature.mat * proportions.transpose();

    let mat = Mat::from_fn(ww.nrows(), ww.ncols(), |r, j| {
        let w = ww[(r, j)];
        let x = (1.0 - w) * unmeth.sample(&mut rng) + w * meth.sample(&mut rng);
        let y = (x + noise.sample(&mut rng)).clamp(0.0, 1.0);
        if missing_rate > 0.0 && rng.random::<f64>() < missing_rate {
            f64::NAN
        } else {
            y
        }
    });

    let samples = (0..proportions.nrows())
        .map(|j| format!("sample_{}", j).into_boxed_str())
        .collect();

    let obs = MethylationMatrix::new(signature.regions.clone(), samples, mat)?
        .with_tag("Simulation");

    Ok(SimOut {
        obs,
        proportions: proportions.clone(),
    })
}

/// Draw proportions from a flat Dirichlet and simulate `nsamples` samples
pub fn simulate_methylation(
    signature: &SignatureMatrix,
    nsamples: usize,
    theta: &StateParams,
    missing_rate: f64,
    seed: u64,
) -> DeconvResult<SimOut> {
    let mut rng = StdRng::seed_from_u64(seed);
    let proportions = flat_dirichlet(nsamples, signature.num_cell_types(), &mut rng);

    info!(
        "simulating {} samples over {} regions",
        nsamples,
        signature.num_regions()
    );
    simulate_with_proportions(
        signature,
        &proportions,
        theta,
        missing_rate,
        seed.wrapping_add(1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MethylationSource;

    fn signature() -> SignatureMatrix {
        SignatureMatrix::new(
            vec!["r0".into(), "r1".into(), "r2".into()],
            vec!["a".into(), "b".into()],
            Mat::from_row_slice(3, 2, &[1., 0., 0., 1., 0.5, 0.5]),
        )
        .unwrap()
    }

    #[test]
    fn test_simulated_values_in_range() -> anyhow::Result<()> {
        let theta = StateParams::new(0.1, 0.9, 0.01, 0.01, 0.01)?;
        let sim = simulate_methylation(&signature(), 50, &theta, 0.0, 7)?;

        assert_eq!(sim.obs.num_samples(), 50);
        assert!(sim
            .obs
            .methylation()
            .iter()
            .all(|y| (0.0..=1.0).contains(y)));
        for row in sim.proportions.row_iter() {
            approx::assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-10);
        }
        Ok(())
    }

    #[test]
    fn test_missing_rate_and_seed() -> anyhow::Result<()> {
        let theta = StateParams::new(0.1, 0.9, 0.01, 0.01, 0.01)?;
        let a = simulate_methylation(&signature(), 200, &theta, 0.3, 11)?;
        let b = simulate_methylation(&signature(), 200, &theta, 0.3, 11)?;

        let nmiss = a.obs.methylation().iter().filter(|y| y.is_nan()).count();
        assert!(nmiss > 100 && nmiss < 260, "{}", nmiss);

        let same = a
            .obs
            .methylation()
            .iter()
            .zip(b.obs.methylation().iter())
            .all(|(x, y)| x == y || (x.is_nan() && y.is_nan()));
        assert!(same);
        Ok(())
    }
}
