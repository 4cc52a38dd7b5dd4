//! This library implements [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process) regression
//! models designed to be fed with data sequentially, as in Bayesian optimization loops.
//!
//! Exact inference is implemented by [GaussianProcess] parameterized by [GpParams]: the Cholesky
//! factor of the training covariance is extended when data is added instead of being recomputed,
//! and the log marginal likelihood comes with its gradient wrt hyperparameters.
//!
//! The FITC sparse approximation is implemented by [SparseGaussianProcess] parameterized by
//! [SparseGpParams]. The complexity of GP inference, O(N^3) in processing time where N is the number
//! of training points, is then reduced to O(N.M^2) where M is the number of so-called inducing points.
//!
//! Both models share the [GpSurrogate] interface, used by:
//! * [FourierSample]: functions drawn from the posterior with random Fourier features,
//! * [optimize]: maximum (penalized) likelihood estimation of hyperparameters,
//! * [SliceSampler]: MCMC sampling of hyperparameters given their [Priors],
//! * [Smc] and [McmcGp]: meta models marginalizing hyperparameters, respectively with
//!   sequential Monte Carlo and plain MCMC.
//!
//! Hyperparameters of a model form a flat vector `[likelihood, kernel, mean]`, positive
//! parameters being stored in log space. Blocks of that vector are named (see [HyperBlock]),
//! names being used to attach priors.
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
mod errors;
mod fourier;
mod hyperparameters;
pub mod kernels;
pub mod likelihoods;
mod mcmc;
mod optimization;
mod parameters;
pub mod priors;
pub mod sampling;
mod smc;
mod smc_parameters;
mod sparse_algorithm;
mod sparse_parameters;
mod surrogate;
mod utils;

pub use algorithm::*;
pub use errors::*;
pub use fourier::*;
pub use hyperparameters::*;
pub use kernels::{squared_exponential, Kernel, SquaredExponential};
pub use likelihoods::{Gaussian, Likelihood, NoiseModel};
pub use mcmc::*;
pub use optimization::{
    optimize, optimize_with, GP_COBYLA_MAX_EVAL, GP_COBYLA_MIN_EVAL, GP_OPTIM_BOUND_WIDTH,
    GP_OPTIM_N_START,
};
pub use parameters::*;
pub use priors::{Prior, Priors};
pub use sampling::{McmcKernel, SliceSampler};
pub use smc::*;
pub use smc_parameters::*;
pub use sparse_algorithm::*;
pub use sparse_parameters::*;
pub use surrogate::*;
pub use utils::{cross_differences, logsumexp};
