//! Observation models linking latent function values to observed targets.

use crate::errors::{GpError, Result};
use crate::hyperparameters::HyperBlock;
use crate::utils::randn;
use linfa::Float;
use ndarray::{Array1, ArrayBase, Data, Ix1};
use ndarray_rand::rand::Rng;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Noise structure of an observation model
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoiseModel<F: Float> {
    /// Additive gaussian noise with the given variance
    Gaussian(F),
    /// Any other observation model, not handled by exact inference
    NonGaussian,
}

/// A trait for observation models `p(y | f)`
pub trait Likelihood<F: Float>: Clone + fmt::Debug + fmt::Display + Send + Sync {
    /// Number of hyperparameters
    fn nhyper(&self) -> usize;

    /// Hyperparameter blocks relative to the likelihood own vector
    fn params(&self) -> Vec<HyperBlock>;

    /// Hyperparameters as stored (log space)
    fn hyper(&self) -> Array1<F>;

    /// Set hyperparameters from a vector laid out as [`Likelihood::params`]
    fn set_hyper(&mut self, hyper: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()>;

    /// Noise structure
    fn noise_model(&self) -> NoiseModel<F>;

    /// Derivatives of the gaussian noise variance wrt each hyperparameter
    fn variance_grad(&self) -> Array1<F>;

    /// Draws observations given latent function values `f`
    fn sample<R: Rng + ?Sized>(&self, f: &ArrayBase<impl Data<Elem = F>, Ix1>, rng: &mut R) -> Array1<F>;

    /// Gaussian noise variance or `UnsupportedLikelihood` error
    fn variance(&self) -> Result<F> {
        match self.noise_model() {
            NoiseModel::Gaussian(s2) => Ok(s2),
            NoiseModel::NonGaussian => Err(GpError::UnsupportedLikelihood(self.to_string())),
        }
    }
}

/// Gaussian likelihood `y = f + e` with `e ~ N(0, sn^2)`
///
/// Its single hyperparameter is `log(sn)`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Gaussian<F: Float> {
    log_sn: F,
}

impl<F: Float> Gaussian<F> {
    /// Constructor given the noise standard deviation `sn`
    pub fn new(sn: F) -> Result<Self> {
        if !(sn > F::zero() && sn.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "noise standard deviation should be positive and finite, got {sn}"
            )));
        }
        Ok(Gaussian { log_sn: sn.ln() })
    }

    /// Noise standard deviation
    pub fn sn(&self) -> F {
        self.log_sn.exp()
    }
}

impl<F: Float> fmt::Display for Gaussian<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Gaussian(sn={})", self.sn())
    }
}

impl<F: Float> Likelihood<F> for Gaussian<F> {
    fn nhyper(&self) -> usize {
        1
    }

    fn params(&self) -> Vec<HyperBlock> {
        vec![HyperBlock::new("sn", 0..1, true)]
    }

    fn hyper(&self) -> Array1<F> {
        Array1::from_elem(1, self.log_sn)
    }

    fn set_hyper(&mut self, hyper: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()> {
        if hyper.len() != 1 {
            return Err(GpError::InvalidValueError(format!(
                "gaussian likelihood expects 1 hyperparameter, got {}",
                hyper.len()
            )));
        }
        self.log_sn = hyper[0];
        Ok(())
    }

    fn noise_model(&self) -> NoiseModel<F> {
        NoiseModel::Gaussian((self.log_sn * F::cast(2.)).exp())
    }

    fn variance_grad(&self) -> Array1<F> {
        Array1::from_elem(1, (self.log_sn * F::cast(2.)).exp() * F::cast(2.))
    }

    fn sample<R: Rng + ?Sized>(&self, f: &ArrayBase<impl Data<Elem = F>, Ix1>, rng: &mut R) -> Array1<F> {
        randn::<F, R>(f.len(), rng) * self.sn() + f
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_rand::rand::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    /// Observation model without gaussian noise, used to check inference guards
    #[derive(Debug, Clone)]
    pub(crate) struct Probit;

    impl fmt::Display for Probit {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "Probit")
        }
    }

    impl Likelihood<f64> for Probit {
        fn nhyper(&self) -> usize {
            0
        }
        fn params(&self) -> Vec<HyperBlock> {
            vec![]
        }
        fn hyper(&self) -> Array1<f64> {
            Array1::zeros(0)
        }
        fn set_hyper(&mut self, _hyper: &ArrayBase<impl Data<Elem = f64>, Ix1>) -> Result<()> {
            Ok(())
        }
        fn noise_model(&self) -> NoiseModel<f64> {
            NoiseModel::NonGaussian
        }
        fn variance_grad(&self) -> Array1<f64> {
            Array1::zeros(0)
        }
        fn sample<R: Rng + ?Sized>(
            &self,
            f: &ArrayBase<impl Data<Elem = f64>, Ix1>,
            _rng: &mut R,
        ) -> Array1<f64> {
            f.mapv(|v| if v > 0. { 1. } else { -1. })
        }
    }

    #[test]
    fn test_gaussian() {
        let mut lik = Gaussian::new(0.5).unwrap();
        assert_abs_diff_eq!(lik.variance().unwrap(), 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(lik.variance_grad(), array![0.5], epsilon = 1e-12);
        lik.set_hyper(&array![0.]).unwrap();
        assert_abs_diff_eq!(lik.sn(), 1.);
        assert!(lik.set_hyper(&array![0., 1.]).is_err());
        assert!(Gaussian::new(0.).is_err());
    }

    #[test]
    fn test_gaussian_sample() {
        let lik = Gaussian::new(0.1).unwrap();
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let f = Array1::from_elem(10000, 1.);
        let y = lik.sample(&f, &mut rng);
        assert_abs_diff_eq!(y.mean().unwrap(), 1., epsilon = 0.01);
        assert_abs_diff_eq!(y.std(0.), 0.1, epsilon = 0.01);
    }

    #[test]
    fn test_unsupported() {
        assert!(matches!(
            Probit.variance(),
            Err(GpError::UnsupportedLikelihood(_))
        ));
    }
}
