use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::likelihoods::Likelihood;
use crate::parameters::{GpParams, GpValidParams, HyperTuning};
use linfa::{Float, ParamGuard};
use ndarray::Array2;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Sparse GP inducing points specification
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum Inducings<F: Float> {
    /// `usize` points are selected randomly in the training dataset
    Randomized(usize),
    /// Points are given as a (npoints, nx) matrix
    Located(Array2<F>),
}

impl<F: Float> Default for Inducings<F> {
    fn default() -> Inducings<F> {
        Self::Randomized(10)
    }
}

/// A set of validated sparse GP parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, Lik: Serialize, K: Serialize",
        deserialize = "F: Deserialize<'de>, Lik: Deserialize<'de>, K: Deserialize<'de>"
    ))
)]
pub struct SparseGpValidParams<F: Float, Lik: Likelihood<F>, K: Kernel<F>> {
    /// gp
    gp_params: GpValidParams<F, Lik, K>,
    /// Inducing points
    z: Inducings<F>,
    /// Random generator seed used to select inducing points
    seed: Option<u64>,
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> SparseGpValidParams<F, Lik, K> {
    /// Get underlying GP parameters
    pub fn gp_params(&self) -> &GpValidParams<F, Lik, K> {
        &self.gp_params
    }

    /// Get observation model
    pub fn likelihood(&self) -> &Lik {
        self.gp_params.likelihood()
    }

    /// Get covariance kernel k(x, x')
    pub fn kernel(&self) -> &K {
        self.gp_params.kernel()
    }

    /// Get constant prior mean
    pub fn mean(&self) -> F {
        self.gp_params.mean()
    }

    /// Get hyperparameters tuning
    pub fn tuning(&self) -> &HyperTuning<F> {
        self.gp_params.tuning()
    }

    /// Get the number of internal GP hyperparameters optimization restart
    pub fn n_start(&self) -> usize {
        self.gp_params.n_start()
    }

    /// Get the max number of internal likelihood evaluations during one optimization
    pub fn max_eval(&self) -> usize {
        self.gp_params.max_eval()
    }

    /// Get inducing points
    pub fn inducings(&self) -> &Inducings<F> {
        &self.z
    }

    /// Get seed
    pub fn seed(&self) -> Option<&u64> {
        self.seed.as_ref()
    }
}

#[derive(Clone, Debug)]
/// The set of hyperparameters that can be specified for the execution of
/// the [sparse GP algorithm](struct.SparseGaussianProcess.html).
pub struct SparseGpParams<F: Float, Lik: Likelihood<F>, K: Kernel<F>>(
    SparseGpValidParams<F, Lik, K>,
);

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> SparseGpParams<F, Lik, K> {
    /// A constructor for sparse GP parameters given likelihood, kernel and inducing points
    pub fn new(likelihood: Lik, kernel: K, inducings: Inducings<F>) -> SparseGpParams<F, Lik, K> {
        Self(SparseGpValidParams {
            gp_params: GpParams::new(likelihood, kernel).into_inner(),
            z: inducings,
            seed: None,
        })
    }

    /// A constructor for sparse GP parameters from validated parameters
    pub fn new_from_valid(params: &SparseGpValidParams<F, Lik, K>) -> Self {
        Self(params.clone())
    }

    /// Set constant prior mean.
    pub fn mean(mut self, mean: F) -> Self {
        self.0.gp_params = GpParams::from(self.0.gp_params).mean(mean).into_inner();
        self
    }

    /// Set hyperparameters tuning
    pub fn tuning(mut self, tuning: HyperTuning<F>) -> Self {
        self.0.gp_params = GpParams::from(self.0.gp_params).tuning(tuning).into_inner();
        self
    }

    /// Set the number of internal hyperparameters optimization restarts
    pub fn n_start(mut self, n_start: usize) -> Self {
        self.0.gp_params = GpParams::from(self.0.gp_params).n_start(n_start).into_inner();
        self
    }

    /// Set the max number of internal likelihood evaluations during one optimization
    pub fn max_eval(mut self, max_eval: usize) -> Self {
        self.0.gp_params = GpParams::from(self.0.gp_params).max_eval(max_eval).into_inner();
        self
    }

    /// Set inducing points
    pub fn inducings(mut self, z: Inducings<F>) -> Self {
        self.0.z = z;
        self
    }

    /// Set the random generator seed used to select inducing points
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.0.seed = seed;
        self
    }
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> From<SparseGpValidParams<F, Lik, K>>
    for SparseGpParams<F, Lik, K>
{
    fn from(valid: SparseGpValidParams<F, Lik, K>) -> Self {
        SparseGpParams(valid)
    }
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> ParamGuard for SparseGpParams<F, Lik, K> {
    type Checked = SparseGpValidParams<F, Lik, K>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        GpParams::new_from_valid(&self.0.gp_params).check_ref()?;
        match &self.0.z {
            Inducings::Randomized(0) => Err(GpError::InvalidValueError(
                "number of inducing points should be positive".to_string(),
            )),
            Inducings::Located(z) if z.nrows() == 0 => Err(GpError::InvalidValueError(
                "inducing points should not be empty".to_string(),
            )),
            Inducings::Located(z) if z.ncols() != self.0.gp_params.kernel().ndim() => {
                Err(GpError::DimensionError {
                    expected: self.0.gp_params.kernel().ndim(),
                    actual: z.ncols(),
                })
            }
            _ => Ok(&self.0),
        }
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
