use crate::errors::Result;
use crate::hyperparameters::HyperBlock;
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Data, Ix1, Ix2};
use std::fmt;

/// Posterior mean, variance and their gradients wrt query points:
/// `(mu (nq,), s2 (nq,), dmu (nq, ndim), ds2 (nq, ndim))`
pub type PosteriorGrad<F> = (Array1<F>, Array1<F>, Array2<F>, Array2<F>);

/// A trait shared by GP models (exact, sparse), used by the meta models
/// marginalizing their hyperparameters.
///
/// Models hold their training data and hyperparameters, and keep posterior
/// statistics consistent with both: any change of data or hyperparameters
/// is followed by a refresh of the cached statistics.
pub trait GpSurrogate<F: Float>: Clone + Send + Sync + fmt::Display {
    /// Input dimension
    fn ndim(&self) -> usize;

    /// Number of training points
    fn ndata(&self) -> usize;

    /// Training inputs (ndata, ndim) and targets (ndata,)
    fn data(&self) -> (ArrayView2<F>, ArrayView1<F>);

    /// Add training points `x` (n, ndim) with targets `y` (n,)
    fn add_data(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()>;

    /// Remove all training data, the model then predicts its prior
    fn reset(&mut self);

    /// Posterior mean and variance of the latent function at `x` points (nq, ndim)
    fn posterior(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<(Array1<F>, Array1<F>)>;

    /// Posterior mean and variance with their gradients wrt `x` points
    fn posterior_grad(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<PosteriorGrad<F>>;

    /// Log marginal likelihood of training data
    fn loglikelihood(&self) -> Result<F>;

    /// Log marginal likelihood with its gradient wrt the flat hyperparameters
    fn loglikelihood_grad(&self) -> Result<(F, Array1<F>)>;

    /// Number of hyperparameters
    fn nhyper(&self) -> usize;

    /// Blocks of the flat hyperparameter vector
    fn params(&self) -> Vec<HyperBlock>;

    /// Flat hyperparameter vector
    fn hyper(&self) -> Array1<F>;

    /// Set the flat hyperparameter vector and refresh posterior statistics
    fn set_hyper(&mut self, hyper: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()>;

    /// Independent copy of the model with the given hyperparameters
    fn copy_with(&self, hyper: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Self> {
        let mut model = self.clone();
        model.set_hyper(hyper)?;
        Ok(model)
    }
}
