use crate::common::*;
use serde::{Deserialize, Serialize};

/// Methylation-state parameters shared by every sample of a batch
///
/// * `a0`, `sig0` - mean and variance of the unmethylated-state signal
/// * `a1`, `sig1` - mean and variance of the methylated-state signal
/// * `tau` - variance of the measurement error
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateParams {
    pub a0: f64,
    pub a1: f64,
    pub sig0: f64,
    pub sig1: f64,
    pub tau: f64,
}

impl StateParams {
    pub fn new(a0: f64, a1: f64, sig0: f64, sig1: f64, tau: f64) -> DeconvResult<Self> {
        let ret = Self {
            a0,
            a1,
            sig0,
            sig1,
            tau,
        };
        ret.validate()?;
        Ok(ret)
    }

    /// `a0 < a1` and strictly positive, finite variances
    pub fn validate(&self) -> DeconvResult<()> {
        let all = [self.a0, self.a1, self.sig0, self.sig1, self.tau];
        if all.iter().any(|x| !x.is_finite()) {
            return Err(DeconvError::InvalidConfig(format!(
                "non-finite state parameters {:?}",
                self
            )));
        }
        if self.a0 >= self.a1 {
            return Err(DeconvError::InvalidConfig(format!(
                "a0 ({}) must be smaller than a1 ({})",
                self.a0, self.a1
            )));
        }
        if self.sig0 <= 0.0 || self.sig1 <= 0.0 || self.tau <= 0.0 {
            return Err(DeconvError::InvalidConfig(format!(
                "variances must be positive: sig0={}, sig1={}, tau={}",
                self.sig0, self.sig1, self.tau
            )));
        }
        Ok(())
    }

    pub fn floor_variances(&mut self) {
        self.sig0 = self.sig0.max(VAR_FLOOR);
        self.sig1 = self.sig1.max(VAR_FLOOR);
        self.tau = self.tau.max(VAR_FLOOR);
    }

    /// Mean of an observation whose methylated fraction is `w`
    pub fn mixed_mean(&self, w: f64) -> f64 {
        (1.0 - w) * self.a0 + w * self.a1
    }

    /// Variance of an observation whose methylated fraction is `w`,
    /// measurement error included
    pub fn mixed_var(&self, w: f64) -> f64 {
        (1.0 - w).powi(2) * self.sig0 + w.powi(2) * self.sig1 + self.tau
    }

    /// Largest absolute change in the means and standard deviations
    pub fn max_abs_change(&self, other: &Self) -> f64 {
        [
            (self.a0 - other.a0).abs(),
            (self.a1 - other.a1).abs(),
            (self.sig0.sqrt() - other.sig0.sqrt()).abs(),
            (self.sig1.sqrt() - other.sig1.sqrt()).abs(),
            (self.tau.sqrt() - other.tau.sqrt()).abs(),
        ]
        .into_iter()
        .fold(0.0, f64::max)
    }
}

/// Caller-supplied starting values. Each component is optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StateOverrides {
    pub a0: Option<f64>,
    pub a1: Option<f64>,
    pub sig0: Option<f64>,
    pub sig1: Option<f64>,
    pub tau: Option<f64>,
}

impl StateOverrides {
    /// All five components given: the starting point is fully determined
    pub fn complete(&self) -> Option<DeconvResult<StateParams>> {
        match (self.a0, self.a1, self.sig0, self.sig1, self.tau) {
            (Some(a0), Some(a1), Some(sig0), Some(sig1), Some(tau)) => {
                Some(StateParams::new(a0, a1, sig0, sig1, tau))
            }
            _ => None,
        }
    }

    /// Replace the given components of `theta`
    pub fn apply(&self, theta: StateParams) -> DeconvResult<StateParams> {
        let ret = StateParams {
            a0: self.a0.unwrap_or(theta.a0),
            a1: self.a1.unwrap_or(theta.a1),
            sig0: self.sig0.unwrap_or(theta.sig0),
            sig1: self.sig1.unwrap_or(theta.sig1),
            tau: self.tau.unwrap_or(theta.tau),
        };
        ret.validate()?;
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_params_reject_swapped_means() {
        assert!(StateParams::new(0.8, 0.2, 0.01, 0.01, 0.01).is_err());
        assert!(StateParams::new(0.2, 0.8, 0.0, 0.01, 0.01).is_err());
        assert!(StateParams::new(0.2, 0.8, 0.01, 0.01, 0.01).is_ok());
    }

    #[test]
    fn test_overrides_partial_and_complete() -> anyhow::Result<()> {
        let theta = StateParams::new(0.1, 0.9, 0.01, 0.02, 0.03)?;

        let partial = StateOverrides {
            a1: Some(0.7),
            ..Default::default()
        };
        assert!(partial.complete().is_none());
        let applied = partial.apply(theta)?;
        assert_eq!(applied.a1, 0.7);
        assert_eq!(applied.sig1, 0.02);

        let full = StateOverrides {
            a0: Some(0.05),
            a1: Some(0.95),
            sig0: Some(0.001),
            sig1: Some(0.001),
            tau: Some(0.002),
        };
        let theta = full.complete().expect("all given")?;
        assert_eq!(theta.tau, 0.002);
        Ok(())
    }

    #[test]
    fn test_mixed_moments() {
        let theta = StateParams {
            a0: 0.1,
            a1: 0.9,
            sig0: 0.01,
            sig1: 0.04,
            tau: 0.001,
        };
        approx::assert_abs_diff_eq!(theta.mixed_mean(0.5), 0.5, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(
            theta.mixed_var(0.5),
            0.25 * 0.01 + 0.25 * 0.04 + 0.001,
            epsilon = 1e-12
        );
    }
}
