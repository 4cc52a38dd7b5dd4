use crate::errors::{GpError, Result};
use crate::hyperparameters::{layout, HyperBlock};
use crate::kernels::Kernel;
use crate::likelihoods::Likelihood;
use crate::optimization::{GP_COBYLA_MAX_EVAL, GP_COBYLA_MIN_EVAL, GP_OPTIM_N_START};
use crate::priors::Priors;
use linfa::{Float, ParamGuard};

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// An enum to represent how hyperparameters are tuned when fitting a model
#[derive(Clone, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum HyperTuning<F: Float> {
    /// Hyperparameters are kept as given
    #[default]
    Fixed,
    /// Hyperparameters are optimized to maximize the log marginal likelihood
    /// plus the log prior of the blocks having a prior.
    /// With no priors, this is maximum likelihood estimation.
    Optimized {
        /// Priors used as penalty and bounds of the search space
        priors: Priors<F>,
    },
}

/// A set of validated GP parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, Lik: Serialize, K: Serialize",
        deserialize = "F: Deserialize<'de>, Lik: Deserialize<'de>, K: Deserialize<'de>"
    ))
)]
pub struct GpValidParams<F: Float, Lik: Likelihood<F>, K: Kernel<F>> {
    /// Observation model
    pub(crate) likelihood: Lik,
    /// Covariance kernel of the GP prior
    pub(crate) kernel: K,
    /// Constant prior mean
    pub(crate) mean: F,
    /// Hyperparameters tuning
    pub(crate) tuning: HyperTuning<F>,
    /// Number of internal likelihood optimization restart
    pub(crate) n_start: usize,
    /// Max number of internal likelihood evaluation during optimization
    pub(crate) max_eval: usize,
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> GpValidParams<F, Lik, K> {
    /// Get observation model
    pub fn likelihood(&self) -> &Lik {
        &self.likelihood
    }

    /// Get covariance kernel k(x, x')
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Get constant prior mean
    pub fn mean(&self) -> F {
        self.mean
    }

    /// Get hyperparameters tuning
    pub fn tuning(&self) -> &HyperTuning<F> {
        &self.tuning
    }

    /// Get the number of internal optimization restart
    pub fn n_start(&self) -> usize {
        self.n_start
    }

    /// Get the max number of internal likelihood evaluations during one optimization
    pub fn max_eval(&self) -> usize {
        self.max_eval
    }

    /// Blocks of the flat hyperparameter vector of the model
    pub fn params(&self) -> Vec<HyperBlock> {
        layout(self.likelihood.params(), self.kernel.params())
    }
}

#[derive(Clone, Debug)]
/// The set of hyperparameters that can be specified for the execution of
/// the [GP algorithm](struct.GaussianProcess.html).
pub struct GpParams<F: Float, Lik: Likelihood<F>, K: Kernel<F>>(GpValidParams<F, Lik, K>);

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> GpParams<F, Lik, K> {
    /// A constructor for GP parameters given likelihood and kernel, mean is zero
    pub fn new(likelihood: Lik, kernel: K) -> GpParams<F, Lik, K> {
        Self(GpValidParams {
            likelihood,
            kernel,
            mean: F::zero(),
            tuning: HyperTuning::Fixed,
            n_start: GP_OPTIM_N_START,
            max_eval: GP_COBYLA_MAX_EVAL,
        })
    }

    /// A constructor for GP parameters from validated parameters
    pub fn new_from_valid(params: &GpValidParams<F, Lik, K>) -> Self {
        Self(params.clone())
    }

    /// Set observation model.
    pub fn likelihood(mut self, likelihood: Lik) -> Self {
        self.0.likelihood = likelihood;
        self
    }

    /// Set covariance kernel.
    pub fn kernel(mut self, kernel: K) -> Self {
        self.0.kernel = kernel;
        self
    }

    /// Set constant prior mean.
    pub fn mean(mut self, mean: F) -> Self {
        self.0.mean = mean;
        self
    }

    /// Set hyperparameters tuning
    pub fn tuning(mut self, tuning: HyperTuning<F>) -> Self {
        self.0.tuning = tuning;
        self
    }

    /// Set the number of internal hyperparameters optimization restarts
    pub fn n_start(mut self, n_start: usize) -> Self {
        self.0.n_start = n_start;
        self
    }

    /// Set the max number of internal likelihood evaluations during one optimization
    /// Given max_eval has to be greater than [crate::GP_COBYLA_MIN_EVAL] otherwise
    /// max_eval is set to [crate::GP_COBYLA_MIN_EVAL].
    pub fn max_eval(mut self, max_eval: usize) -> Self {
        self.0.max_eval = GP_COBYLA_MIN_EVAL.max(max_eval);
        self
    }

    /// Unchecked parameters, validation is left to the enclosing builder
    pub(crate) fn into_inner(self) -> GpValidParams<F, Lik, K> {
        self.0
    }
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> From<GpValidParams<F, Lik, K>>
    for GpParams<F, Lik, K>
{
    fn from(valid: GpValidParams<F, Lik, K>) -> Self {
        GpParams(valid)
    }
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> ParamGuard for GpParams<F, Lik, K> {
    type Checked = GpValidParams<F, Lik, K>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        // exact inference needs gaussian noise
        self.0.likelihood.variance()?;
        if !self.0.mean.is_finite() {
            return Err(GpError::InvalidValueError(format!(
                "prior mean should be finite, got {}",
                self.0.mean
            )));
        }
        if let HyperTuning::Optimized { priors } = &self.0.tuning {
            priors.check(&self.0.params())?;
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
