use crate::errors::{GpError, Result};
use crate::fourier::FourierSample;
use crate::hyperparameters::{layout, HyperBlock};
use crate::kernels::{squared_exponential, Kernel, SquaredExponential};
use crate::likelihoods::{Gaussian, Likelihood};
use crate::optimization::optimize_with;
use crate::parameters::HyperTuning;
use crate::sparse_parameters::{Inducings, SparseGpParams, SparseGpValidParams};
use crate::surrogate::{GpSurrogate, PosteriorGrad};
use crate::utils::{
    check_data, check_dim, sample_mvn, solve_lower_vec, solve_upper_vec, stack, stack_rows, Cache,
};

use linfa::prelude::{DatasetBase, Fit, Float, ParamGuard, PredictInplace};
use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{s, Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Ix1, Ix2, Zip};
use ndarray_rand::rand::seq::SliceRandom;
use ndarray_rand::rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;

use log::debug;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Seed of the multistart optimization run when fitting
const SGP_OPTIM_SEED: u64 = 42;
/// Inducing points covariance jitter relative to the noise variance
const FITC_JITTER: f64 = 1e-6;

/// FITC posterior statistics computed from training data
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(deserialize = "F: Deserialize<'de>"))
)]
pub(crate) struct FitcStats<F: Float> {
    /// Lower Cholesky factor of `Kuu + su2 I`
    l: Array2<F>,
    /// Lower Cholesky factor of `I + V V^T`
    la: Array2<F>,
    /// `l la`
    r: Array2<F>,
    /// `r^-1 Kux ell^-2 (y - mean)`
    b: Array1<F>,
    /// `l^-1 Kux ell^-1` (m, n)
    v: Array2<F>,
    /// Per point scaling `sqrt(kxx - qxx + sn2)` (n,)
    ell: Array1<F>,
    /// Scaled residuals `(y - mean) / ell`
    rs: Array1<F>,
}

/// Sparse gaussian process using the FITC approximation
///
/// The training covariance is approximated through a fixed set of `m`
/// inducing points `U` by `Q + diag(K - Q) + sn^2 I` with `Q = Kxu Kuu^-1 Kux`.
/// Posterior statistics are recomputed from scratch on data addition at a
/// cost of `O(n m^2)`, queries cost `O(m^2)` per point.
///
/// Inducing points are given by the caller and never checked for adequacy.
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, Lik: Serialize, K: Serialize",
        deserialize = "F: Deserialize<'de>, Lik: Deserialize<'de>, K: Deserialize<'de>"
    ))
)]
pub struct SparseGaussianProcess<F: Float, Lik: Likelihood<F>, K: Kernel<F>> {
    /// Observation model
    likelihood: Lik,
    /// Covariance kernel
    kernel: K,
    /// Constant prior mean
    mean: F,
    /// Inducing points (m, ndim)
    inducings: Array2<F>,
    /// Training inputs
    xt: Array2<F>,
    /// Training outputs
    yt: Array1<F>,
    /// Posterior statistics
    stats: Cache<FitcStats<F>>,
}

/// FITC GP with gaussian noise and squared exponential kernel
pub type BasicSparseGp<F> = SparseGaussianProcess<F, Gaussian<F>, SquaredExponential<F>>;

impl<F: Float> BasicSparseGp<F> {
    /// Sparse GP with noise std `sn`, kernel std `sf`, lengthscales `ell`, zero mean
    /// and the given inducing points.
    ///
    /// The kernel is isotropic in `ndim` dimensions when `ndim` is given otherwise ARD.
    pub fn basic(
        sn: F,
        sf: F,
        ell: &ArrayBase<impl Data<Elem = F>, Ix1>,
        ndim: Option<usize>,
        inducings: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Self> {
        SparseGaussianProcess::new(
            Gaussian::new(sn)?,
            squared_exponential(sf, ell, ndim)?,
            F::zero(),
            inducings,
        )
    }
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> fmt::Display
    for SparseGaussianProcess<F, Lik, K>
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "FITC(likelihood={}, kernel={}, mean={}, inducings={}, ndata={})",
            self.likelihood,
            self.kernel,
            self.mean,
            self.inducings.nrows(),
            self.ndata()
        )
    }
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> SparseGaussianProcess<F, Lik, K> {
    /// Sparse Gp parameters contructor
    pub fn params<NewLik: Likelihood<F>, NewK: Kernel<F>>(
        likelihood: NewLik,
        kernel: NewK,
        inducings: Inducings<F>,
    ) -> SparseGpParams<F, NewLik, NewK> {
        SparseGpParams::new(likelihood, kernel, inducings)
    }

    /// Model without data given its likelihood, kernel, constant prior mean
    /// and inducing points (m, ndim).
    ///
    /// Returns `UnsupportedLikelihood` error when the likelihood is not gaussian.
    pub fn new(
        likelihood: Lik,
        kernel: K,
        mean: F,
        inducings: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<Self> {
        let params = SparseGpParams::new(
            likelihood,
            kernel,
            Inducings::Located(inducings.to_owned()),
        )
        .mean(mean)
        .check()?;
        Ok(Self::from_params(&params, inducings.to_owned()))
    }

    fn from_params(params: &SparseGpValidParams<F, Lik, K>, inducings: Array2<F>) -> Self {
        let ndim = params.kernel().ndim();
        SparseGaussianProcess {
            likelihood: params.likelihood().clone(),
            kernel: params.kernel().clone(),
            mean: params.mean(),
            inducings,
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

    /// Inducing points (m, ndim)
    pub fn inducings(&self) -> &Array2<F> {
        &self.inducings
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

    /// Set hyperparameters and refresh posterior statistics accordingly
    pub fn set_hyper(&mut self, hyper: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()> {
        if hyper.len() != self.nhyper() {
            return Err(GpError::InvalidValueError(format!(
                "sparse GP expects {} hyperparameters, got {}",
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

    fn compute_stats(&self) -> Result<FitcStats<F>> {
        let sn2 = self.likelihood.variance()?;
        let su2 = sn2 * F::cast(FITC_JITTER);
        let u = &self.inducings;

        let mut kuu = self.kernel.value(u, u);
        kuu.diag_mut().mapv_inplace(|v| v + su2);
        let l = kuu.cholesky()?;

        let kux = self.kernel.value(u, &self.xt);
        let kxx = self.kernel.diag(&self.xt);
        let v = l.solve_triangular(&kux, UPLO::Lower)?;

        // diagonal correction of the low rank approximation plus noise
        let ell = (kxx - v.mapv(|e| e * e).sum_axis(Axis(0)) + sn2).mapv(|e| e.sqrt());
        let kux = kux / &ell;
        let v = v / &ell;
        let rs = (&self.yt - self.mean) / &ell;

        let mut a = v.dot(&v.t());
        a.diag_mut().mapv_inplace(|e| e + F::one());
        let la = a.cholesky()?;
        let r = l.dot(&la);
        let b = solve_lower_vec(&r, &kux.dot(&rs))?;
        debug!(
            "FITC statistics refreshed with {} points and {} inducings",
            self.ndata(),
            u.nrows()
        );
        Ok(FitcStats {
            l,
            la,
            r,
            b,
            v,
            ell,
            rs,
        })
    }

    /// Add training points `x` (n, ndim) and targets `y` (n,).
    ///
    /// Statistics are always recomputed over the whole training set.
    pub fn add_data(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        check_data(x, y, self.ndim())?;
        self.xt = stack_rows(&self.xt, x);
        self.yt = stack(&self.yt, y);
        self.refresh()
    }

    /// Remove all training data, inducing points are kept
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
            let k = self.kernel.value(&self.inducings, x);
            let lk = stats.l.solve_triangular(&k, UPLO::Lower)?;
            let rk = stats.r.solve_triangular(&k, UPLO::Lower)?;
            mu += &rk.t().dot(&stats.b);
            s2 += &(rk.mapv(|v| v * v) - lk.mapv(|v| v * v)).sum_axis(Axis(0));
        }
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
            let k = self.kernel.value(&self.inducings, x);
            let lk = stats.l.solve_triangular(&k, UPLO::Lower)?;
            let rk = stats.r.solve_triangular(&k, UPLO::Lower)?;
            mu += &rk.t().dot(&stats.b);
            s2 += &(rk.mapv(|v| v * v) - lk.mapv(|v| v * v)).sum_axis(Axis(0));

            let two = F::cast(2.);
            for (j, dk) in self.kernel.grad_x(&self.inducings, x).iter().enumerate() {
                let ldk = stats.l.solve_triangular(dk, UPLO::Lower)?;
                let rdk = stats.r.solve_triangular(dk, UPLO::Lower)?;
                dmu.column_mut(j).assign(&rdk.t().dot(&stats.b));
                ds2.column_mut(j)
                    .assign(&(((&rdk * &rk) - (&ldk * &lk)).sum_axis(Axis(0)) * two));
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
            let k = self.kernel.value(&self.inducings, x);
            let lk = stats.l.solve_triangular(&k, UPLO::Lower)?;
            let rk = stats.r.solve_triangular(&k, UPLO::Lower)?;
            mu += &rk.t().dot(&stats.b);
            sigma += &(rk.t().dot(&rk) - lk.t().dot(&lk));
        }
        Ok((mu, sigma))
    }

    /// Draws `m` joint samples (m, nq) of the posterior at `x` points,
    /// latent values or observations depending on `latent`.
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
    pub fn sample_fourier<R: Rng + ?Sized>(
        &self,
        n: usize,
        rng: &mut R,
    ) -> Result<FourierSample<F>> {
        let data = if self.ndata() > 0 {
            Some((self.xt.view(), self.yt.view()))
        } else {
            None
        };
        FourierSample::new(&self.likelihood, &self.kernel, self.mean, n, data, rng)
    }

    /// Log marginal likelihood of training data under the FITC approximation
    pub fn loglikelihood(&self) -> Result<F> {
        match self.stats.get()? {
            None => Ok(F::zero()),
            Some(stats) => {
                let beta = solve_lower_vec(&stats.la, &stats.v.dot(&stats.rs))?;
                Ok(self.loglikelihood_from(stats, &beta))
            }
        }
    }

    fn loglikelihood_from(&self, stats: &FitcStats<F>, beta: &Array1<F>) -> F {
        let half = F::cast(0.5);
        let n = F::cast(self.ndata());
        -stats.la.diag().mapv(|v| v.ln()).sum()
            - stats.ell.mapv(|v| v.ln()).sum()
            - half * (stats.rs.dot(&stats.rs) - beta.dot(beta))
            - half * n * F::cast(2. * std::f64::consts::PI).ln()
    }

    /// Log marginal likelihood with its gradient wrt the flat hyperparameters
    pub fn loglikelihood_grad(&self) -> Result<(F, Array1<F>)> {
        let mut dlz = Array1::zeros(self.nhyper());
        let stats = match self.stats.get()? {
            None => return Ok((F::zero(), dlz)),
            Some(stats) => stats,
        };
        let sn2 = self.likelihood.variance()?;
        let su2 = sn2 * F::cast(FITC_JITTER);
        let half = F::cast(0.5);
        let two = F::cast(2.);
        let sq = |v: F| v * v;

        let beta = solve_lower_vec(&stats.la, &stats.v.dot(&stats.rs))?;
        let lz = self.loglikelihood_from(stats, &beta);
        let alpha =
            (&stats.rs - &stats.v.t().dot(&solve_upper_vec(&stats.la, &beta)?)) / &stats.ell;

        // B = Kuu^-1 Kux (m, n) and W = la^-1 V ell^-1 (m, n)
        let b = stats
            .l
            .t()
            .solve_triangular(&(&stats.v * &stats.ell), UPLO::Upper)?;
        let w_mat = stats
            .la
            .solve_triangular(&(&stats.v / &stats.ell), UPLO::Lower)?;
        let w = b.dot(&alpha);
        let w2 = w_mat.mapv(sq).sum_axis(Axis(0));
        let bw = b.dot(&w_mat.t());
        let inv_ell2 = stats.ell.mapv(|e| F::one() / (e * e));

        // noise, including the inducings jitter which scales with it
        let v = b.mapv(sq).sum_axis(Axis(0)) * (two * su2);
        let dnoise = -sn2 * (inv_ell2.sum() - w_mat.mapv(sq).sum() - alpha.dot(&alpha))
            - su2 * (w.dot(&w) + bw.mapv(sq).sum())
            + half * (alpha.dot(&(&v * &alpha)) + w2.dot(&v));
        let nlik = self.likelihood.nhyper();
        for (i, dsn2) in self.likelihood.variance_grad().iter().enumerate() {
            dlz[i] = dnoise * *dsn2 / (two * sn2);
        }

        let u = &self.inducings;
        let grads = self
            .kernel
            .grad(u, u)
            .into_iter()
            .zip(self.kernel.grad(u, &self.xt))
            .zip(self.kernel.grad_diag(&self.xt));
        for (i, ((dkuu, dkux), dkxx)) in grads.enumerate() {
            let m = &dkux * two - dkuu.dot(&b);
            let v = &dkxx - &(&m * &b).sum_axis(Axis(0));
            dlz[nlik + i] = half
                * (-(&dkxx * &inv_ell2).sum() - w.dot(&(dkuu.dot(&w) - dkux.dot(&alpha) * two))
                    + alpha.dot(&(&v * &alpha))
                    + w2.dot(&v)
                    + (m.dot(&w_mat.t()) * &bw).sum());
        }
        let nh = self.nhyper();
        dlz[nh - 1] = alpha.sum();
        Ok((lz, dlz))
    }
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>> GpSurrogate<F>
    for SparseGaussianProcess<F, Lik, K>
{
    fn ndim(&self) -> usize {
        SparseGaussianProcess::ndim(self)
    }

    fn ndata(&self) -> usize {
        SparseGaussianProcess::ndata(self)
    }

    fn data(&self) -> (ArrayView2<F>, ArrayView1<F>) {
        SparseGaussianProcess::data(self)
    }

    fn add_data(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        SparseGaussianProcess::add_data(self, x, y)
    }

    fn reset(&mut self) {
        SparseGaussianProcess::reset(self)
    }

    fn posterior(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<(Array1<F>, Array1<F>)> {
        SparseGaussianProcess::posterior(self, x)
    }

    fn posterior_grad(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<PosteriorGrad<F>> {
        SparseGaussianProcess::posterior_grad(self, x)
    }

    fn loglikelihood(&self) -> Result<F> {
        SparseGaussianProcess::loglikelihood(self)
    }

    fn loglikelihood_grad(&self) -> Result<(F, Array1<F>)> {
        SparseGaussianProcess::loglikelihood_grad(self)
    }

    fn nhyper(&self) -> usize {
        SparseGaussianProcess::nhyper(self)
    }

    fn params(&self) -> Vec<HyperBlock> {
        self.params_blocks()
    }

    fn hyper(&self) -> Array1<F> {
        SparseGaussianProcess::hyper(self)
    }

    fn set_hyper(&mut self, hyper: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()> {
        SparseGaussianProcess::set_hyper(self, hyper)
    }
}

impl<F, D, Lik, K> PredictInplace<ArrayBase<D, Ix2>, Array1<F>> for SparseGaussianProcess<F, Lik, K>
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

        let (values, _) = self.posterior(x).expect("SGP Prediction");
        *y = values;
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array1<F> {
        Array1::zeros((x.nrows(),))
    }
}

impl<F: Float, Lik: Likelihood<F>, K: Kernel<F>, D: Data<Elem = F>>
    Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>, GpError> for SparseGpValidParams<F, Lik, K>
{
    type Object = SparseGaussianProcess<F, Lik, K>;

    /// Condition the sparse GP on the dataset, optimizing hyperparameters when requested
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>>,
    ) -> Result<Self::Object> {
        let xtrain = dataset.records();
        check_dim(xtrain, self.kernel().ndim())?;

        let mut rng = match self.seed() {
            Some(seed) => Xoshiro256Plus::seed_from_u64(*seed),
            None => Xoshiro256Plus::from_entropy(),
        };
        let z = match self.inducings() {
            Inducings::Randomized(n) => make_inducings(*n, &xtrain.view(), &mut rng),
            Inducings::Located(z) => z.to_owned(),
        };
        if z.nrows() == 0 {
            return Err(GpError::InvalidValueError(
                "inducing points can not be selected from an empty dataset".to_string(),
            ));
        }

        let mut sgp = SparseGaussianProcess::from_params(self, z);
        sgp.add_data(xtrain, dataset.targets())?;
        if let HyperTuning::Optimized { priors } = self.tuning() {
            optimize_with(
                &mut sgp,
                Some(priors),
                self.n_start(),
                self.max_eval(),
                Some(SGP_OPTIM_SEED),
            )?;
        }
        Ok(sgp)
    }
}

/// Selects `n_inducing` distinct training points at random
fn make_inducings<F: Float>(
    n_inducing: usize,
    xt: &ArrayView2<F>,
    rng: &mut Xoshiro256Plus,
) -> Array2<F> {
    let mut indices = (0..xt.nrows()).collect::<Vec<_>>();
    indices.shuffle(rng);
    let n = n_inducing.min(xt.nrows());
    let mut z = Array2::zeros((n, xt.ncols()));
    Zip::from(z.rows_mut())
        .and(&Array1::from_vec(indices[..n].to_vec()))
        .for_each(|mut zi, i| zi.assign(&xt.row(*i)));
    z
}
