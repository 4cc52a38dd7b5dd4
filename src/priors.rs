//! Prior distributions over hyperparameters.
//!
//! Priors are attached by name to the hyperparameter blocks of a model
//! (see [`HyperBlock`]). A prior always describes the natural value of the
//! parameter: when a block is stored in log space, samples are log-transformed
//! and log-densities account for the change of variable.

use crate::errors::{GpError, Result};
use crate::hyperparameters::HyperBlock;
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use ndarray_rand::RandomExt;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// A prior distribution of a scalar hyperparameter
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Prior<F: Float> {
    /// Uniform distribution over `[a, b]`
    Uniform {
        /// lower bound
        a: F,
        /// upper bound
        b: F,
    },
    /// Normal distribution with mean `mu` and variance `s2`
    Gaussian {
        /// mean
        mu: F,
        /// variance
        s2: F,
    },
    /// Distribution whose log is normal with mean `mu` and variance `s2`
    LogNormal {
        /// mean of the log
        mu: F,
        /// variance of the log
        s2: F,
    },
}

impl<F: Float> fmt::Display for Prior<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Prior::Uniform { a, b } => write!(f, "Uniform({a}, {b})"),
            Prior::Gaussian { mu, s2 } => write!(f, "Gaussian({mu}, {s2})"),
            Prior::LogNormal { mu, s2 } => write!(f, "LogNormal({mu}, {s2})"),
        }
    }
}

impl<F: Float> Prior<F> {
    /// Uniform prior over `[a, b]`
    pub fn uniform(a: F, b: F) -> Result<Self> {
        if !(a < b && a.is_finite() && b.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "uniform prior requires finite bounds a < b, got [{a}, {b}]"
            )));
        }
        Ok(Prior::Uniform { a, b })
    }

    /// Gaussian prior
    pub fn gaussian(mu: F, s2: F) -> Result<Self> {
        Self::check_variance(s2)?;
        Ok(Prior::Gaussian { mu, s2 })
    }

    /// Log-normal prior
    pub fn lognormal(mu: F, s2: F) -> Result<Self> {
        Self::check_variance(s2)?;
        Ok(Prior::LogNormal { mu, s2 })
    }

    fn check_variance(s2: F) -> Result<()> {
        if !(s2 > F::zero() && s2.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "prior variance should be positive, got {s2}"
            )));
        }
        Ok(())
    }

    /// Check the prior can describe a block stored in log space when `logged`
    fn check_support(&self, logged: bool) -> Result<()> {
        match self {
            Prior::Gaussian { .. } if logged => Err(GpError::InvalidValueError(
                "gaussian prior cannot describe a positive log-transformed parameter".to_string(),
            )),
            Prior::Uniform { a, .. } if logged && *a <= F::zero() => {
                Err(GpError::InvalidValueError(format!(
                    "uniform prior of a positive log-transformed parameter requires a > 0, got {a}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Draws `n` values of the stored parameter (log-transformed when `logged`)
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, logged: bool, rng: &mut R) -> Array1<F> {
        let natural = match *self {
            Prior::Uniform { a, b } => {
                Array1::<f64>::random_using(n, Uniform::new(0., 1.), rng)
                    .mapv(|u| a + (b - a) * F::cast(u))
            }
            Prior::Gaussian { mu, s2 } => {
                Array1::<f64>::random_using(n, StandardNormal, rng)
                    .mapv(|v| mu + s2.sqrt() * F::cast(v))
            }
            Prior::LogNormal { mu, s2 } => {
                let logs = Array1::<f64>::random_using(n, StandardNormal, rng)
                    .mapv(|v| mu + s2.sqrt() * F::cast(v));
                if logged {
                    return logs;
                }
                logs.mapv(|v| v.exp())
            }
        };
        if logged {
            natural.mapv(|v| v.ln())
        } else {
            natural
        }
    }

    /// Log-density (up to a constant) of the stored parameter value `theta`
    pub fn logprior(&self, theta: F, logged: bool) -> F {
        let half = F::cast(0.5);
        let two_pi = F::cast(2. * std::f64::consts::PI);
        match *self {
            Prior::Uniform { a, b } => {
                let (x, logjac) = if logged {
                    (theta.exp(), theta)
                } else {
                    (theta, F::zero())
                };
                if x < a || x > b {
                    F::neg_infinity()
                } else {
                    -(b - a).ln() + logjac
                }
            }
            Prior::Gaussian { mu, s2 } => {
                if logged {
                    return F::neg_infinity();
                }
                -half * (theta - mu) * (theta - mu) / s2 - half * (two_pi * s2).ln()
            }
            Prior::LogNormal { mu, s2 } => {
                let (logx, logjac) = if logged {
                    (theta, F::zero())
                } else if theta > F::zero() {
                    (theta.ln(), -theta.ln())
                } else {
                    return F::neg_infinity();
                };
                -half * (logx - mu) * (logx - mu) / s2 - half * (two_pi * s2).ln() + logjac
            }
        }
    }

    /// Bounds of the stored parameter when the prior has a compact support
    pub fn bounds(&self, logged: bool) -> Option<(F, F)> {
        match *self {
            Prior::Uniform { a, b } if logged => Some((a.ln(), b.ln())),
            Prior::Uniform { a, b } => Some((a, b)),
            _ => None,
        }
    }
}

/// Priors attached by name to hyperparameter blocks.
///
/// A block mapped to `None` (see [`Priors::fixed`]) or not mentioned at all
/// is held at its current value by samplers.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Priors<F: Float> {
    entries: Vec<(String, Option<Prior<F>>)>,
}

impl<F: Float> fmt::Display for Priors<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let entries: Vec<String> = self
            .entries
            .iter()
            .map(|(name, prior)| match prior {
                Some(p) => format!("{name}: {p}"),
                None => format!("{name}: fixed"),
            })
            .collect();
        write!(f, "Priors({})", entries.join(", "))
    }
}

impl<F: Float> Priors<F> {
    /// Empty set of priors
    pub fn new() -> Self {
        Priors { entries: vec![] }
    }

    /// Attach `prior` to the block named `name`
    pub fn with(mut self, name: &str, prior: Prior<F>) -> Self {
        self.set(name, Some(prior));
        self
    }

    /// Mark the block named `name` as fixed
    pub fn fixed(mut self, name: &str) -> Self {
        self.set(name, None);
        self
    }

    fn set(&mut self, name: &str, prior: Option<Prior<F>>) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = prior,
            None => self.entries.push((name.to_string(), prior)),
        }
    }

    /// Prior attached to the block named `name` if any
    pub fn get(&self, name: &str) -> Option<&Prior<F>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, p)| p.as_ref())
    }

    /// Whether the block named `name` is explicitly fixed
    pub fn is_fixed(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, p)| n == name && p.is_none())
    }

    /// Check every named block exists in `blocks` with a compatible prior
    pub fn check(&self, blocks: &[HyperBlock]) -> Result<()> {
        for (name, prior) in self.entries.iter() {
            let block = blocks.iter().find(|b| &b.name == name).ok_or_else(|| {
                GpError::InvalidValueError(format!("prior given for unknown hyperparameter {name}"))
            })?;
            if let Some(prior) = prior {
                prior.check_support(block.logged)?;
            }
        }
        Ok(())
    }

    /// Flat indices of the hyperparameters having a prior
    pub fn active(&self, blocks: &[HyperBlock]) -> Vec<usize> {
        blocks
            .iter()
            .filter(|b| self.get(&b.name).is_some())
            .flat_map(|b| b.range.clone())
            .collect()
    }

    /// Log-density of the hyperparameters having a prior
    pub fn logprior(&self, hyper: &ArrayBase<impl Data<Elem = F>, Ix1>, blocks: &[HyperBlock]) -> F {
        let mut logp = F::zero();
        for block in blocks.iter() {
            if let Some(prior) = self.get(&block.name) {
                for i in block.range.clone() {
                    logp += prior.logprior(hyper[i], block.logged);
                }
            }
        }
        logp
    }

    /// Draws `n` hyperparameter vectors (one per row), sampling the blocks
    /// having a prior and keeping the others at their value in `hyper0`
    pub fn sample_hypers<R: Rng + ?Sized>(
        &self,
        hyper0: &ArrayBase<impl Data<Elem = F>, Ix1>,
        blocks: &[HyperBlock],
        n: usize,
        rng: &mut R,
    ) -> Result<Array2<F>> {
        self.check(blocks)?;
        let mut hypers = Array2::zeros((n, hyper0.len()));
        for mut row in hypers.rows_mut() {
            row.assign(hyper0);
        }
        for block in blocks.iter() {
            if let Some(prior) = self.get(&block.name) {
                for i in block.range.clone() {
                    hypers.column_mut(i).assign(&prior.sample(n, block.logged, rng));
                }
            }
        }
        Ok(hypers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Axis};
    use ndarray_rand::rand::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    fn blocks() -> Vec<HyperBlock> {
        vec![
            HyperBlock::new("sn", 0..1, true),
            HyperBlock::new("sf", 1..2, true),
            HyperBlock::new("ell", 2..4, true),
            HyperBlock::new("mean", 4..5, false),
        ]
    }

    #[test]
    fn test_sample_hypers() {
        let priors = Priors::new()
            .with("sn", Prior::uniform(0.01, 1.).unwrap())
            .with("ell", Prior::lognormal(0., 1.).unwrap())
            .with("mean", Prior::gaussian(2., 0.25).unwrap())
            .fixed("sf");
        let hyper0 = array![0., 0.3, 0., 0., 0.];
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let hypers = priors
            .sample_hypers(&hyper0, &blocks(), 5000, &mut rng)
            .unwrap();
        assert_eq!(hypers.dim(), (5000, 5));
        // fixed block is kept
        assert!(hypers.column(1).iter().all(|&v| v == 0.3));
        // uniform bounds in log space
        assert!(hypers
            .column(0)
            .iter()
            .all(|&v| v >= 0.01f64.ln() && v <= 0.));
        let means = hypers.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(means[2], 0., epsilon = 0.05);
        assert_abs_diff_eq!(means[4], 2., epsilon = 0.05);
        assert_abs_diff_eq!(hypers.column(4).std(0.), 0.5, epsilon = 0.05);
    }

    #[test]
    fn test_active() {
        let priors = Priors::new()
            .with("ell", Prior::lognormal(0., 1.).unwrap())
            .fixed("mean");
        assert_eq!(priors.active(&blocks()), vec![2, 3]);
    }

    #[test]
    fn test_logprior() {
        let prior = Prior::uniform(1., 3.).unwrap();
        assert_abs_diff_eq!(prior.logprior(2., false), -(2f64.ln()));
        assert_eq!(prior.logprior(4., false), f64::NEG_INFINITY);
        assert_abs_diff_eq!(prior.logprior(2f64.ln(), true), -(2f64.ln()) + 2f64.ln());

        let prior = Prior::lognormal(0., 1.).unwrap();
        let expected = -0.5 * (2. * std::f64::consts::PI).ln();
        assert_abs_diff_eq!(prior.logprior(0., true), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(prior.logprior(1., false), expected, epsilon = 1e-12);
        assert_eq!(prior.logprior(-1., false), f64::NEG_INFINITY);
    }

    #[test]
    fn test_invalid_priors() {
        assert!(Prior::uniform(1., 0.).is_err());
        assert!(Prior::gaussian(0., -1.).is_err());
        let priors = Priors::new().with("sn", Prior::gaussian(0., 1.).unwrap());
        assert!(priors.check(&blocks()).is_err());
        let priors = Priors::new().with("foo", Prior::lognormal(0., 1.).unwrap());
        assert!(priors.check(&blocks()).is_err());
    }
}
