use crate::errors::{GpError, Result};
use crate::fourier::FourierSample;
use crate::hyperparameters::{layout, HyperBlock};
use crate::kernels::{squared_exponential, Kernel, SquaredExponential};
use crate::likelihoods::{Gaussian, Likelihood};
use crate::optimization::optimize_with;
use crate::parameters::{GpParams, GpValidParams, HyperTuning};
use crate::surrogate::{GpSurrogate, PosteriorGrad};
use crate::utils::{
    check_data, check_dim, cholesky_append, sample_mvn, solve_lower_vec, solve_upper_vec, stack,
    stack_rows, Cache,
};

use linfa::prelude::{DatasetBase, Fit, Float, ParamGuard, PredictInplace};
use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{s, Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Ix1, Ix2};
use ndarray_rand::rand::Rng;

use log::debug;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

#[cfg(feature = "persistent")]
use std::fs;
#[cfg(feature = "persistent")]
use std::io::Write;

/// Seed of the multistart optimization run when fitting
const GP_OPTIM_SEED: u64 = 42;

/// Posterior statistics of the exact GP computed from training data
/// and used later on in prediction computations
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub(crate) struct ExactStats<F: Float> {
    /// Lower Cholesky factor of `K + sn^2 I`
    r_chol: Array2<F>,
    /// Whitened residuals `r_chol^-1 (y - mean)`
    a: Array1<F>,
}

/// Gaussian process model with exact inference under a gaussian likelihood
///
/// The model holds its training data `(X, y)` and keeps the Cholesky factor
/// of the training covariance consistent with its hyperparameters. Data added
/// one batch at a time extends the factor in `O(n^2 m)` instead of
/// factorizing again from scratch.
///
/// # Example
///
/// ```no_run
/// use bayesgp::{BasicGp, GpSurrogate};
/// use ndarray::{array, Array2};
///
/// let x = array![[0f64], [0.25], [0.5], [0.75], [1.]];
/// let y = x.column(0).mapv(|v| (6. * v).sin());
///
/// let mut gp = BasicGp::basic(0.1, 1., &array![0.2], Some(1)).expect("valid hyperparameters");
/// gp.add_data(&x, &y).expect("GP update");
///
/// let xtest = Array2::from_shape_vec((3, 1), vec![0.1, 0.3, 0.9]).unwrap();
/// let (mu, s2) = gp.posterior(&xtest).expect("GP posterior");
/// println!("mean = {mu}, variance = {s2}");
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, Lik: Serialize, K: Serialize",
        deserialize = "F: Deserialize<'de>, Lik: Deserialize<'de>, K: Deserialize<'de>"
    ))
)]
pub struct GaussianProcess<F: Float, Lik: Likelihood<F>, K: Kernel<F>> {
    /// Observation model
    likelihood: Lik,
    /// Covariance kernel
    kernel: K,
    /// Constant prior mean
    mean: F,
    /// Training inputs
    xt: Array2<F>,
    /// Training outputs
    yt: Array1<F>,
    /// Posterior statistics
    stats: Cache<ExactStats<F>>,
}

/// Exact GP with gaussian noise and squared exponential kernel
pub type BasicGp<F> = GaussianProcess<F, Gaussian<F>, SquaredExponential<F>>;

impl<F: Float> BasicGp<F> {
    /// GP with noise std `sn`, kernel std `sf`, lengthscales `ell` and zero mean.
    ///
    /// The kernel is isotropic in `ndim` dimensions when `ndim` is given (then `ell` holds
    /// a single value) otherwise it is ARD with one lengthscale per dimension.
    pub fn basic(
        sn: F,
        sf: F,
        ell: &ArrayBase<impl Data<Elem = F>, Ix1>,
        ndim: Option<usize>,
    ) -> Result<Self> {
        GaussianProcess::new(
            Gaussian::new(sn)?,
            squared_exponential(sf, ell, ndim)?,
            F::zero(),
        )
    }
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> fmt::Display for GaussianProcess<F, Lik, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "GP(likelihood={}, kernel={}, mean={}, ndata={})",
            self.likelihood,
            self.kernel,
            self.mean,
            self.ndata()
        )
    }
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> GaussianProcess<F, Lik, K> {
    /// Gp parameters contructor
    pub fn params<NewLik: Likelihood<F>, NewK: Kernel<F>>(
        likelihood: NewLik,
        kernel: NewK,
    ) -> GpParams<F, NewLik, NewK> {
        GpParams::new(likelihood, kernel)
    }

    /// Model without data given its likelihood, kernel and constant prior mean.
    ///
    /// Returns `UnsupportedLikelihood` error when the likelihood is not gaussian.
    pub fn new(likelihood: Lik, kernel: K, mean: F) -> Result<Self> {
        let params = GpParams::new(likelihood, kernel).mean(mean).check()?;
        Ok(Self::from_params(&params))
    }

    pub(crate) fn from_params(params: &GpValidParams<F, Lik, K>) -> Self {
        let ndim = params.kernel().ndim();
        GaussianProcess {
            likelihood: params.likelihood().clone(),
            kernel: params.kernel().clone(),
            mean: params.mean(),
            xt: Array2::zeros((0, ndim)),
            yt: Array1::zeros(0),
            stats: Cache::Empty,
        }
    }

    /// Observation model
    pub fn likelihood(&self) -> &Lik {
        &self.likelihood
    }

    /// Covariance kernel
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Constant prior mean
    pub fn mean(&self) -> F {
        self.mean
    }

    /// Input dimension
    pub fn ndim(&self) -> usize {
        self.kernel.ndim()
    }

    /// Number of training points
    pub fn ndata(&self) -> usize {
        self.xt.nrows()
    }

    /// Training inputs and outputs
    pub fn data(&self) -> (ArrayView2<F>, ArrayView1<F>) {
        (self.xt.view(), self.yt.view())
    }

    /// Number of hyperparameters
    pub fn nhyper(&self) -> usize {
        self.likelihood.nhyper() + self.kernel.nhyper() + 1
    }

    /// Blocks of the flat hyperparameter vector `[likelihood, kernel, mean]`
    pub fn params_blocks(&self) -> Vec<HyperBlock> {
        layout(self.likelihood.params(), self.kernel.params())
    }

    /// Flat hyperparameter vector `[likelihood, kernel, mean]`
    pub fn hyper(&self) -> Array1<F> {
        let mut hyper = stack(&self.likelihood.hyper(), &self.kernel.hyper()).to_vec();
        hyper.push(self.mean);
        Array1::from(hyper)
    }

    /// Set hyperparameters and refresh posterior statistics accordingly.
    ///
    /// When the refresh fails the error is returned and the model stays
    /// invalidated until hyperparameters allowing a refresh are set.
    pub fn set_hyper(&mut self, hyper: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()> {
        if hyper.len() != self.nhyper() {
            return Err(GpError::InvalidValueError(format!(
                "GP expects {} hyperparameters, got {}",
                self.nhyper(),
                hyper.len()
            )));
        }
        if hyper.iter().any(|v| !v.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "hyperparameters should be finite, got {hyper}"
            )));
        }
        let nlik = self.likelihood.nhyper();
        let nkern = self.kernel.nhyper();
        self.likelihood.set_hyper(&hyper.slice(s![..nlik]))?;
        self.kernel.set_hyper(&hyper.slice(s![nlik..nlik + nkern]))?;
        self.mean = hyper[nlik + nkern];
        self.refresh()
    }

    /// Recompute posterior statistics from scratch
    pub fn refresh(&mut self) -> Result<()> {
        if self.ndata() == 0 {
            self.stats = Cache::Empty;
            return Ok(());
        }
        self.stats = Cache::Invalidated;
        let stats = self.compute_stats()?;
        self.stats = Cache::Valid(stats);
        Ok(())
    }

    fn compute_stats(&self) -> Result<ExactStats<F>> {
        let sn2 = self.likelihood.variance()?;
        let mut k = self.kernel.value(&self.xt, &self.xt);
        k.diag_mut().mapv_inplace(|v| v + sn2);
        let r_chol = k.cholesky()?;
        let a = solve_lower_vec(&r_chol, &(&self.yt - self.mean))?;
        debug!("GP factorization refreshed with {} points", self.ndata());
        Ok(ExactStats { r_chol, a })
    }

    /// Extends current factorization with `x` points and `y` targets
    fn extended_stats(
        &self,
        stats: &ExactStats<F>,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<ExactStats<F>> {
        let sn2 = self.likelihood.variance()?;
        let k12 = self.kernel.value(&self.xt, x);
        let mut k22 = self.kernel.value(x, x);
        k22.diag_mut().mapv_inplace(|v| v + sn2);
        let (r_chol, c) = cholesky_append(&stats.r_chol, &k12, &k22)?;

        let n = self.ndata();
        let r2 = y - self.mean;
        let a2 = solve_lower_vec(&r_chol.slice(s![n.., n..]), &(r2 - c.t().dot(&stats.a)))?;
        let a = stack(&stats.a, &a2);
        Ok(ExactStats { r_chol, a })
    }

    /// Add training points `x` (n, ndim) and targets `y` (n,).
    ///
    /// The current factorization is extended with the new points when valid,
    /// otherwise it is computed from scratch.
    pub fn add_data(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        check_data(x, y, self.ndim())?;
        if x.nrows() == 0 {
            return Ok(());
        }
        let extended = match self.stats.get() {
            Ok(Some(stats)) => Some(self.extended_stats(stats, x, y)),
            _ => None,
        };
        self.xt = stack_rows(&self.xt, x);
        self.yt = stack(&self.yt, y);
        match extended {
            Some(Ok(stats)) => {
                self.stats = Cache::Valid(stats);
                Ok(())
            }
            Some(Err(err)) => {
                self.stats = Cache::Invalidated;
                Err(err)
            }
            None => self.refresh(),
        }
    }

    /// Add training points and recompute the factorization from scratch
    pub fn add_data_batch(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        check_data(x, y, self.ndim())?;
        self.xt = stack_rows(&self.xt, x);
        self.yt = stack(&self.yt, y);
        self.refresh()
    }

    /// Remove all training data
    pub fn reset(&mut self) {
        self.xt = Array2::zeros((0, self.ndim()));
        self.yt = Array1::zeros(0);
        self.stats = Cache::Empty;
    }

    /// Posterior mean and variance of the latent function at `x` points (nq, ndim)
    pub fn posterior(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array1<F>, Array1<F>)> {
        check_dim(x, self.ndim())?;
        let mut mu = Array1::from_elem(x.nrows(), self.mean);
        let mut s2 = self.kernel.diag(x);
        if let Some(stats) = self.stats.get()? {
            let k = self.kernel.value(&self.xt, x);
            let rk = stats.r_chol.solve_triangular(&k, UPLO::Lower)?;
            mu += &rk.t().dot(&stats.a);
            s2 -= &rk.mapv(|v| v * v).sum_axis(Axis(0));
        }
        // Variance might be slightly negative depending on
        // machine precision: set to zero in that case
        s2.mapv_inplace(|v| v.max(F::zero()));
        Ok((mu, s2))
    }

    /// Posterior mean and variance at `x` points (nq, ndim) with their gradients
    /// (nq, ndim) wrt the query points. The kernel is assumed stationary.
    pub fn posterior_grad(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<PosteriorGrad<F>> {
        check_dim(x, self.ndim())?;
        let (nq, ndim) = x.dim();
        let mut mu = Array1::from_elem(nq, self.mean);
        let mut s2 = self.kernel.diag(x);
        let mut dmu = Array2::zeros((nq, ndim));
        let mut ds2 = Array2::zeros((nq, ndim));
        if let Some(stats) = self.stats.get()? {
            let k = self.kernel.value(&self.xt, x);
            let rk = stats.r_chol.solve_triangular(&k, UPLO::Lower)?;
            mu += &rk.t().dot(&stats.a);
            s2 -= &rk.mapv(|v| v * v).sum_axis(Axis(0));

            for (j, dk) in self.kernel.grad_x(&self.xt, x).iter().enumerate() {
                let rdk = stats.r_chol.solve_triangular(dk, UPLO::Lower)?;
                dmu.column_mut(j).assign(&rdk.t().dot(&stats.a));
                ds2.column_mut(j)
                    .assign(&((&rdk * &rk).sum_axis(Axis(0)) * F::cast(-2.)));
            }
        }
        s2.mapv_inplace(|v| v.max(F::zero()));
        Ok((mu, s2, dmu, ds2))
    }

    /// Posterior mean (nq,) and full covariance (nq, nq) at `x` points
    pub fn full_posterior(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array1<F>, Array2<F>)> {
        check_dim(x, self.ndim())?;
        let mut mu = Array1::from_elem(x.nrows(), self.mean);
        let mut sigma = self.kernel.value(x, x);
        if let Some(stats) = self.stats.get()? {
            let k = self.kernel.value(&self.xt, x);
            let rk = stats.r_chol.solve_triangular(&k, UPLO::Lower)?;
            mu += &rk.t().dot(&stats.a);
            sigma -= &rk.t().dot(&rk);
        }
        Ok((mu, sigma))
    }

    /// Draws `m` joint samples (m, nq) of the posterior at `x` points.
    ///
    /// Samples are latent function values when `latent` is true, otherwise
    /// they are passed through the observation model.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        m: usize,
        latent: bool,
        rng: &mut R,
    ) -> Result<Array2<F>> {
        let (mu, sigma) = self.full_posterior(x)?;
        let mut f = sample_mvn(&mu, &sigma, m, rng)?;
        if !latent {
            for mut row in f.rows_mut() {
                let y = self.likelihood.sample(&row, rng);
                row.assign(&y);
            }
        }
        Ok(f)
    }

    /// Draws a function from the posterior approximated with `n` random Fourier features
    pub fn sample_fourier<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<FourierSample<F>> {
        let data = if self.ndata() > 0 {
            Some((self.xt.view(), self.yt.view()))
        } else {
            None
        };
        FourierSample::new(&self.likelihood, &self.kernel, self.mean, n, data, rng)
    }

    /// Log marginal likelihood of training data, zero without data
    pub fn loglikelihood(&self) -> Result<F> {
        match self.stats.get()? {
            None => Ok(F::zero()),
            Some(stats) => {
                let n = F::cast(self.ndata());
                let half = F::cast(0.5);
                Ok(-half * stats.a.dot(&stats.a)
                    - half * n * F::cast(2. * std::f64::consts::PI).ln()
                    - stats.r_chol.diag().mapv(|v| v.ln()).sum())
            }
        }
    }

    /// Log marginal likelihood with its gradient wrt the flat hyperparameters
    pub fn loglikelihood_grad(&self) -> Result<(F, Array1<F>)> {
        let lz = self.loglikelihood()?;
        let mut dlz = Array1::zeros(self.nhyper());
        let stats = match self.stats.get()? {
            None => return Ok((lz, dlz)),
            Some(stats) => stats,
        };
        let half = F::cast(0.5);

        // d lZ = (alpha^T dK alpha - tr(K^-1 dK)) / 2 with alpha = K^-1 (y - mean)
        let alpha = solve_upper_vec(&stats.r_chol, &stats.a)?;
        let trace_solve = |dk: &Array2<F>| -> Result<F> {
            let w = stats.r_chol.solve_triangular(dk, UPLO::Lower)?;
            let z = stats.r_chol.t().solve_triangular(&w, UPLO::Upper)?;
            Ok(z.diag().sum())
        };

        let nlik = self.likelihood.nhyper();
        let tr_noise = trace_solve(&Array2::eye(self.ndata()))?;
        let aa = alpha.dot(&alpha);
        for (i, dsn2) in self.likelihood.variance_grad().iter().enumerate() {
            dlz[i] = half * *dsn2 * (aa - tr_noise);
        }
        for (i, dk) in self.kernel.grad(&self.xt, &self.xt).iter().enumerate() {
            dlz[nlik + i] = half * (alpha.dot(&dk.dot(&alpha)) - trace_solve(dk)?);
        }
        let nh = self.nhyper();
        dlz[nh - 1] = alpha.sum();
        Ok((lz, dlz))
    }
}

#[cfg(feature = "persistent")]
impl<F, Lik, K> GaussianProcess<F, Lik, K>
where
    F: Float + Serialize + for<'de> Deserialize<'de>,
    Lik: Likelihood<F> + Serialize + for<'de> Deserialize<'de>,
    K: Kernel<F> + Serialize + for<'de> Deserialize<'de>,
{
    /// Save the model (data and hyperparameters) in a json file
    pub fn save(&self, path: &str) -> Result<()> {
        let mut file = fs::File::create(path)?;
        let bytes = serde_json::to_vec(self)?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Load a model from a json file
    pub fn load(path: &str) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> GpSurrogate<F> for GaussianProcess<F, Lik, K> {
    fn ndim(&self) -> usize {
        GaussianProcess::ndim(self)
    }

    fn ndata(&self) -> usize {
        GaussianProcess::ndata(self)
    }

    fn data(&self) -> (ArrayView2<F>, ArrayView1<F>) {
        GaussianProcess::data(self)
    }

    fn add_data(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        GaussianProcess::add_data(self, x, y)
    }

    fn reset(&mut self) {
        GaussianProcess::reset(self)
    }

    fn posterior(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<(Array1<F>, Array1<F>)> {
        GaussianProcess::posterior(self, x)
    }

    fn posterior_grad(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<PosteriorGrad<F>> {
        GaussianProcess::posterior_grad(self, x)
    }

    fn loglikelihood(&self) -> Result<F> {
        GaussianProcess::loglikelihood(self)
    }

    fn loglikelihood_grad(&self) -> Result<(F, Array1<F>)> {
        GaussianProcess::loglikelihood_grad(self)
    }

    fn nhyper(&self) -> usize {
        GaussianProcess::nhyper(self)
    }

    fn params(&self) -> Vec<HyperBlock> {
        self.params_blocks()
    }

    fn hyper(&self) -> Array1<F> {
        GaussianProcess::hyper(self)
    }

    fn set_hyper(&mut self, hyper: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()> {
        GaussianProcess::set_hyper(self, hyper)
    }
}

impl<F, D, Lik, K> PredictInplace<ArrayBase<D, Ix2>, Array1<F>> for GaussianProcess<F, Lik, K>
where
    F: Float,
    D: Data<Elem = F>,
    Lik: Likelihood<F>,
    K: Kernel<F>,
{
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array1<F>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );

        let (values, _) = self.posterior(x).expect("GP Prediction");
        *y = values;
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array1<F> {
        Array1::zeros((x.nrows(),))
    }
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>, D: Data<Elem = F>>
    Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>, GpError> for GpValidParams<F, Lik, K>
{
    type Object = GaussianProcess<F, Lik, K>;

    /// Condition the GP on the dataset, optimizing hyperparameters when requested
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>>,
    ) -> Result<Self::Object> {
        let mut gp = GaussianProcess::from_params(self);
        gp.add_data_batch(dataset.records(), dataset.targets())?;
        if let HyperTuning::Optimized { priors } = self.tuning() {
            optimize_with(
                &mut gp,
                Some(priors),
                self.n_start(),
                self.max_eval(),
                Some(GP_OPTIM_SEED),
            )?;
        }
        Ok(gp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihoods::tests::Probit;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use linfa::prelude::{Dataset, Predict};
    use ndarray::{array, Array};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use paste::paste;
    use rand_xoshiro::Xoshiro256Plus;

    fn make_test_data(n: usize, ndim: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let x = Array::random_using((n, ndim), Uniform::new(0f64, 1.), &mut rng);
        let y = x.map_axis(Axis(1), |row| row.mapv(|v| f64::sin(3. * v)).sum());
        (x, y)
    }

    fn make_gp(ard: bool) -> BasicGp<f64> {
        if ard {
            BasicGp::basic(0.3, 1.2, &array![0.7, 1.4], None).unwrap()
        } else {
            BasicGp::basic(1., 1., &array![1.], Some(2)).unwrap()
        }
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!(
                (a - e).abs() <= 1e-5 + 1e-5 * e.abs(),
                "{actual:?} vs {expected:?}"
            );
        }
    }

    macro_rules! test_gp {
        ($name:ident, $ard:expr) => {
            paste! {

                #[test]
                fn [<test_hyper_roundtrip_ $name>]() {
                    let mut gp = make_gp($ard);
                    let (x, y) = make_test_data(10, 2, 1);
                    gp.add_data(&x, &y).unwrap();
                    let h = gp.hyper();
                    assert_eq!(h.len(), gp.nhyper());
                    let h2 = &h + 0.1;
                    gp.set_hyper(&h2).unwrap();
                    assert_abs_diff_eq!(gp.hyper(), h2, epsilon = 1e-12);
                    gp.set_hyper(&h).unwrap();
                    assert_abs_diff_eq!(gp.hyper(), h, epsilon = 1e-12);
                }

                #[test]
                fn [<test_incremental_update_ $name>]() {
                    let (x, y) = make_test_data(10, 2, 1);
                    let (xtest, _) = make_test_data(5, 2, 2);
                    let mut gp_inc = make_gp($ard);
                    gp_inc.add_data(&x.slice(s![..4, ..]), &y.slice(s![..4])).unwrap();
                    for i in 4..10 {
                        gp_inc.add_data(&x.slice(s![i..i + 1, ..]), &y.slice(s![i..i + 1])).unwrap();
                    }
                    let mut gp_batch = make_gp($ard);
                    gp_batch.add_data_batch(&x, &y).unwrap();

                    let (mu1, s21) = gp_inc.posterior(&xtest).unwrap();
                    let (mu2, s22) = gp_batch.posterior(&xtest).unwrap();
                    assert_abs_diff_eq!(mu1, mu2, epsilon = 1e-8);
                    assert_abs_diff_eq!(s21, s22, epsilon = 1e-8);
                    assert_abs_diff_eq!(
                        gp_inc.loglikelihood().unwrap(),
                        gp_batch.loglikelihood().unwrap(),
                        epsilon = 1e-8
                    );
                }

                #[test]
                fn [<test_loglikelihood_grad_ $name>]() {
                    let mut gp = make_gp($ard);
                    let (x, y) = make_test_data(10, 2, 1);
                    gp.add_data(&x, &y).unwrap();
                    let (lz, dlz) = gp.loglikelihood_grad().unwrap();
                    assert_abs_diff_eq!(lz, gp.loglikelihood().unwrap(), epsilon = 1e-12);

                    let f = |h: &Vec<f64>| -> f64 {
                        gp.copy_with(&Array1::from(h.clone()))
                            .unwrap()
                            .loglikelihood()
                            .unwrap()
                    };
                    let fd = gp.hyper().to_vec().central_diff(&f);
                    assert_close(dlz.as_slice().unwrap(), &fd);
                }

                #[test]
                fn [<test_posterior_grad_ $name>]() {
                    let mut gp = make_gp($ard);
                    let (x, y) = make_test_data(10, 2, 1);
                    gp.add_data(&x, &y).unwrap();
                    let (xtest, _) = make_test_data(3, 2, 3);
                    let (mu, s2, dmu, ds2) = gp.posterior_grad(&xtest).unwrap();
                    let (mu_, s2_) = gp.posterior(&xtest).unwrap();
                    assert_abs_diff_eq!(mu, mu_, epsilon = 1e-12);
                    assert_abs_diff_eq!(s2, s2_, epsilon = 1e-12);

                    for i in 0..xtest.nrows() {
                        let fmu = |x: &Vec<f64>| -> f64 {
                            let x = Array2::from_shape_vec((1, 2), x.clone()).unwrap();
                            gp.posterior(&x).unwrap().0[0]
                        };
                        let fs2 = |x: &Vec<f64>| -> f64 {
                            let x = Array2::from_shape_vec((1, 2), x.clone()).unwrap();
                            gp.posterior(&x).unwrap().1[0]
                        };
                        let xi = xtest.row(i).to_vec();
                        assert_close(&dmu.row(i).to_vec(), &xi.central_diff(&fmu));
                        assert_close(&ds2.row(i).to_vec(), &xi.central_diff(&fs2));
                    }
                }
            }
        };
    }

    test_gp!(iso, false);
    test_gp!(ard, true);

    #[test]
    fn test_reset_recovers_prior() {
        let mut gp = make_gp(true);
        let (x, y) = make_test_data(10, 2, 1);
        gp.add_data(&x, &y).unwrap();
        gp.reset();
        assert_eq!(gp.ndata(), 0);
        let (xtest, _) = make_test_data(4, 2, 5);
        let (mu, s2) = gp.posterior(&xtest).unwrap();
        assert_abs_diff_eq!(mu, Array1::zeros(4), epsilon = 1e-12);
        assert_abs_diff_eq!(s2, gp.kernel().diag(&xtest), epsilon = 1e-12);
        assert_eq!(gp.loglikelihood().unwrap(), 0.);

        // data streamed again gives the same model
        let mut gp2 = make_gp(true);
        gp2.add_data(&x, &y).unwrap();
        gp.add_data(&x, &y).unwrap();
        assert_abs_diff_eq!(
            gp.posterior(&xtest).unwrap().0,
            gp2.posterior(&xtest).unwrap().0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_variance_nonnegative() {
        let mut gp = BasicGp::basic(1e-4, 1., &array![0.5], Some(1)).unwrap();
        let x = Array::linspace(0f64, 1., 15).insert_axis(Axis(1));
        let y = x.column(0).mapv(|v| v * v);
        gp.add_data(&x, &y).unwrap();
        let (_, s2) = gp.posterior(&x).unwrap();
        assert!(s2.iter().all(|&v| v >= 0.));
    }

    #[test]
    fn test_basic_scenario() {
        let xt = array![
            [0.05],
            [0.13],
            [0.21],
            [0.34],
            [0.42],
            [0.55],
            [0.61],
            [0.73],
            [0.86],
            [0.97]
        ];
        let yt = array![
            0.2955, 0.7033, 0.9521, 0.8919, 0.5823, -0.1577, -0.4955, -0.9453, -0.9015, -0.4468
        ];
        let xtest = array![[0.48]];

        let mut gp = BasicGp::basic(0.1, 1., &array![0.1], Some(1)).unwrap();
        gp.add_data(&xt, &yt).unwrap();
        let (mu, s2) = gp.posterior(&xtest).unwrap();
        assert_abs_diff_eq!(mu[0], 0.25238812016465423, epsilon = 1e-9);
        assert_abs_diff_eq!(s2[0], 0.02609207263630209, epsilon = 1e-9);
        assert_abs_diff_eq!(gp.loglikelihood().unwrap(), -7.516350434613401, epsilon = 1e-9);

        let xnew = array![[0.09], [0.27], [0.67], [0.79], [0.92]];
        let ynew = array![0.5141, 0.9988, -0.7697, -0.9996, -0.6912];
        let mut gp_direct = gp.clone();
        gp_direct.add_data_batch(&xnew, &ynew).unwrap();
        let mut gp_inc = gp.clone();
        for i in 0..xnew.nrows() {
            gp_inc
                .add_data(&xnew.slice(s![i..i + 1, ..]), &ynew.slice(s![i..i + 1]))
                .unwrap();
        }
        assert_eq!(gp_inc.ndata(), 15);
        for model in [&gp_direct, &gp_inc] {
            let (mu, s2) = model.posterior(&xtest).unwrap();
            assert_abs_diff_eq!(mu[0], 0.25613248991040893, epsilon = 1e-9);
            assert_abs_diff_eq!(s2[0], 0.024046695678947683, epsilon = 1e-9);
            assert_abs_diff_eq!(
                model.loglikelihood().unwrap(),
                -3.6544193496121586,
                epsilon = 1e-9
            );
        }
        let xgrid = Array::linspace(0f64, 1., 11).insert_axis(Axis(1));
        let (mu1, s21) = gp_direct.posterior(&xgrid).unwrap();
        let (mu2, s22) = gp_inc.posterior(&xgrid).unwrap();
        assert_abs_diff_eq!(mu1, mu2, epsilon = 1e-10);
        assert_abs_diff_eq!(s21, s22, epsilon = 1e-10);

        // far from data (wrt lengthscale) the prior is recovered
        let (mu, s2) = gp_direct.posterior(&array![[3.]]).unwrap();
        assert_abs_diff_eq!(mu[0], 0., epsilon = 1e-10);
        assert_abs_diff_eq!(s2[0], 1., epsilon = 1e-10);
    }

    #[test]
    fn test_full_posterior_and_sample() {
        let mut gp = make_gp(false);
        let (x, y) = make_test_data(10, 2, 1);
        gp.add_data(&x, &y).unwrap();
        let (xtest, _) = make_test_data(3, 2, 7);
        let (mu, sigma) = gp.full_posterior(&xtest).unwrap();
        let (mu_, s2) = gp.posterior(&xtest).unwrap();
        assert_abs_diff_eq!(mu, mu_, epsilon = 1e-12);
        assert_abs_diff_eq!(sigma.diag().to_owned(), s2, epsilon = 1e-12);

        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let samples = gp.sample(&xtest, 20000, true, &mut rng).unwrap();
        assert_eq!(samples.dim(), (20000, 3));
        let mean = samples.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(mean, mu, epsilon = 0.05);
        let obs = gp.sample(&xtest, 5, false, &mut rng).unwrap();
        assert_eq!(obs.dim(), (5, 3));
    }

    #[test]
    fn test_dimension_errors() {
        let mut gp = make_gp(false);
        let x = array![[0., 1., 2.]];
        assert!(matches!(
            gp.add_data(&x, &array![1.]),
            Err(GpError::DimensionError {
                expected: 2,
                actual: 3
            })
        ));
        assert!(matches!(
            gp.add_data(&array![[0., 1.]], &array![1., 2.]),
            Err(GpError::LengthMismatch(1, 2))
        ));
        assert!(matches!(
            gp.posterior(&x),
            Err(GpError::DimensionError { .. })
        ));
        assert!(gp.set_hyper(&array![0.]).is_err());
    }

    #[test]
    fn test_unsupported_likelihood() {
        let kernel = SquaredExponential::isotropic(1., 1., 1).unwrap();
        assert!(matches!(
            GaussianProcess::new(Probit, kernel, 0.),
            Err(GpError::UnsupportedLikelihood(_))
        ));
    }

    #[test]
    fn test_failed_refresh_invalidates() {
        let mut gp = BasicGp::basic(1e-3, 1., &array![1.], Some(1)).unwrap();
        let x = array![[0.1], [0.1]];
        gp.add_data(&x, &array![1., 1.]).unwrap();
        // negligible noise makes the covariance of duplicated points singular
        let mut h = gp.hyper();
        h[0] = -400.;
        assert!(gp.set_hyper(&h).is_err());
        assert!(matches!(gp.posterior(&x), Err(GpError::InvalidCache)));
        assert!(matches!(gp.loglikelihood(), Err(GpError::InvalidCache)));
        // a valid setting restores the model
        h[0] = 0.1f64.ln();
        gp.set_hyper(&h).unwrap();
        assert!(gp.posterior(&x).is_ok());
    }

    #[test]
    fn test_fit() {
        let (x, y) = make_test_data(15, 2, 1);
        let gp = BasicGp::<f64>::params(
            Gaussian::new(0.1).unwrap(),
            SquaredExponential::isotropic(1., 0.5, 2).unwrap(),
        )
        .mean(0.5)
        .fit(&Dataset::new(x.to_owned(), y.to_owned()))
        .expect("GP fit error");
        assert_eq!(gp.ndata(), 15);
        let ypred = gp.predict(&x);
        assert_abs_diff_eq!(ypred, y, epsilon = 0.2);
        println!("{gp}");
    }

    #[test]
    fn test_fit_optimized() {
        let (x, y) = make_test_data(15, 1, 1);
        let gp = BasicGp::<f64>::params(
            Gaussian::new(1.).unwrap(),
            SquaredExponential::isotropic(1., 1., 1).unwrap(),
        )
        .tuning(HyperTuning::Optimized {
            priors: crate::priors::Priors::new().fixed("mean"),
        })
        .n_start(2)
        .fit(&Dataset::new(x.to_owned(), y.to_owned()))
        .expect("GP fit error");
        let mut reference = BasicGp::basic(1., 1., &array![1.], Some(1)).unwrap();
        reference.add_data(&x, &y).unwrap();
        assert!(gp.loglikelihood().unwrap() > reference.loglikelihood().unwrap());
    }
}
