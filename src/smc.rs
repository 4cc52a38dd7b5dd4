//! Sequential Monte Carlo marginalization of GP hyperparameters.
//!
//! Particles are GP models sharing the same training data, each with its own
//! hyperparameters drawn initially from the priors. Observations are
//! streamed one at a time: degenerated weights are resampled, each particle
//! ingests the observation and is reweighted by its marginal likelihood
//! increment, then particles are moved with an MCMC kernel leaving the
//! current posterior invariant (Del Moral et al., 2006).
//!
//! Predictions are those of the weighted mixture of particles.

use crate::errors::{GpError, Result};
use crate::optimization::into_f64;
use crate::priors::Priors;
use crate::sampling::{McmcKernel, SliceSampler};
use crate::smc_parameters::{SmcParams, SmcValidParams};
use crate::surrogate::{GpSurrogate, PosteriorGrad};
use crate::utils::{check_data, logsumexp, mixture_moments, mixture_moments_grad};

use linfa::prelude::{DatasetBase, Fit, Float, ParamGuard};
use log::debug;
use ndarray::{Array1, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Ix1, Ix2};
use ndarray_rand::rand::distributions::{Distribution, WeightedIndex};
use ndarray_rand::rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use std::fmt;

/// A weighted hyperparameters hypothesis of the SMC meta model
///
/// Each particle owns a GP model conditioned on all the observations
/// ingested so far, its hyperparameters being the hypothesis. Particles
/// never share their training data nor their cached factorization.
#[derive(Debug, Clone)]
pub struct Particle<F: Float, M: GpSurrogate<F>> {
    /// GP model holding the particle hyperparameters and training data
    model: M,
    /// Normalized log weight, `logsumexp` over particles is zero
    log_weight: F,
    /// Log marginal likelihood of the model cached after the last rejuvenation,
    /// used to compute the weight increment of the next observation
    loglike: F,
}

impl<F: Float, M: GpSurrogate<F>> Particle<F, M> {
    /// Particle model
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Normalized log weight
    pub fn log_weight(&self) -> F {
        self.log_weight
    }

    /// Cached log marginal likelihood of the particle model
    pub fn loglike(&self) -> F {
        self.loglike
    }

    /// Normalized weight
    pub fn weight(&self) -> F {
        self.log_weight.exp()
    }
}

/// SMC meta model averaging GP predictions over the hyperparameters posterior
#[derive(Debug, Clone)]
pub struct Smc<F: Float, M: GpSurrogate<F>, S: McmcKernel<F> = SliceSampler> {
    priors: Priors<F>,
    sampler: S,
    resample: bool,
    rejuvenation_steps: usize,
    particles: Vec<Particle<F, M>>,
    rng: Xoshiro256Plus,
}

impl<F: Float, M: GpSurrogate<F>> Smc<F, M, SliceSampler> {
    /// SMC parameters constructor given the template `model` and hyperparameters `priors`
    pub fn params(model: M, priors: Priors<F>) -> SmcParams<F, M, SliceSampler> {
        SmcParams::new(model, priors)
    }

    /// SMC with `n_particles` drawn from `priors` and slice sampling rejuvenation.
    ///
    /// Training data of `model` if any is streamed into the particles.
    pub fn new(model: M, priors: Priors<F>, n_particles: usize) -> Result<Self> {
        Smc::from_params(&SmcParams::new(model, priors).n_particles(n_particles).check()?)
    }
}

impl<F: Float, M: GpSurrogate<F>, S: McmcKernel<F>> fmt::Display for Smc<F, M, S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SMC(particles={}, ess={:.1}, ndata={}, priors={})",
            self.particles.len(),
            self.effective_sample_size(),
            self.ndata(),
            self.priors
        )
    }
}

impl<F: Float, M: GpSurrogate<F>, S: McmcKernel<F>> Smc<F, M, S> {
    /// Particles drawn from the priors around a reset copy of the template
    /// model, then conditioned on its data if any
    pub fn from_params(params: &SmcValidParams<F, M, S>) -> Result<Self> {
        let mut rng = match params.seed() {
            Some(seed) => Xoshiro256Plus::seed_from_u64(*seed),
            None => Xoshiro256Plus::from_entropy(),
        };
        let mut model = params.model().clone();
        let (xt, yt) = {
            let (x, y) = model.data();
            (x.to_owned(), y.to_owned())
        };
        model.reset();

        let n = params.n_particles();
        let hypers =
            params
                .priors()
                .sample_hypers(&model.hyper(), &model.params(), n, &mut rng)?;
        let log_weight = -F::cast(n).ln();
        let particles = hypers
            .rows()
            .into_iter()
            .map(|h| -> Result<Particle<F, M>> {
                Ok(Particle {
                    model: model.copy_with(&h)?,
                    log_weight,
                    loglike: F::zero(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut smc = Smc {
            priors: params.priors().clone(),
            sampler: params.sampler().clone(),
            resample: params.resample(),
            rejuvenation_steps: params.rejuvenation_steps(),
            particles,
            rng,
        };
        smc.add_data(&xt, &yt)?;
        Ok(smc)
    }

    /// Input dimension
    pub fn ndim(&self) -> usize {
        self.particles[0].model.ndim()
    }

    /// Number of observations ingested so far
    pub fn ndata(&self) -> usize {
        self.particles[0].model.ndata()
    }

    /// Observations ingested so far
    pub fn data(&self) -> (ArrayView2<F>, ArrayView1<F>) {
        self.particles[0].model.data()
    }

    /// Hyperparameters priors
    pub fn priors(&self) -> &Priors<F> {
        &self.priors
    }

    /// Current particles
    pub fn particles(&self) -> &[Particle<F, M>] {
        &self.particles
    }

    /// Iterator over particles
    pub fn iter(&self) -> std::slice::Iter<'_, Particle<F, M>> {
        self.particles.iter()
    }

    /// Normalized log weights of particles
    pub fn log_weights(&self) -> Array1<F> {
        self.particles.iter().map(|p| p.log_weight).collect()
    }

    /// Effective sample size `1 / sum(w^2)`
    pub fn effective_sample_size(&self) -> F {
        (-logsumexp(&(self.log_weights() * F::cast(2.)))).exp()
    }

    /// Stream observations `x` (n, ndim) and `y` (n,) one at a time into the particles.
    ///
    /// On error, particles and random generator are restored to their state
    /// before the call: either all observations are ingested or none.
    pub fn add_data(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        check_data(x, y, self.ndim())?;
        if x.nrows() == 0 {
            return Ok(());
        }
        let particles = self.particles.clone();
        let rng = self.rng.clone();
        for (xi, &yi) in x.rows().into_iter().zip(y.iter()) {
            if let Err(err) = self.add_point(xi.insert_axis(Axis(0)), yi) {
                debug!("SMC update failed, {} particles restored", particles.len());
                self.particles = particles;
                self.rng = rng;
                return Err(err);
            }
        }
        Ok(())
    }

    fn add_point(&mut self, x: ArrayView2<F>, y: F) -> Result<()> {
        let n = self.particles.len();
        let half_n = F::cast(n as f64 / 2.);
        if self.resample && self.effective_sample_size() < half_n {
            self.resample_particles()?;
        }

        let y = Array1::from_elem(1, y);
        let loglikes = self
            .particles
            .par_iter_mut()
            .map(|p| {
                p.model.add_data(&x, &y)?;
                p.model.loglikelihood()
            })
            .collect::<Result<Vec<F>>>()?;

        // incremental weights, Eq. 31 of Del Moral et al.
        for (p, ll) in self.particles.iter_mut().zip(loglikes) {
            p.log_weight += ll - p.loglike;
        }
        let lognorm = logsumexp(&self.log_weights());
        if !lognorm.is_finite() {
            return Err(GpError::InvalidValueError(
                "all SMC particles have a null likelihood".to_string(),
            ));
        }
        self.particles
            .iter_mut()
            .for_each(|p| p.log_weight -= lognorm);

        self.rejuvenate()?;
        self.particles
            .par_iter_mut()
            .map(|p| -> Result<()> {
                p.loglike = p.model.loglikelihood()?;
                Ok(())
            })
            .collect::<Result<()>>()
    }

    /// Multinomial resampling, weights are reset to uniform
    fn resample_particles(&mut self) -> Result<()> {
        let n = self.particles.len();
        let weights: Vec<f64> = self
            .particles
            .iter()
            .map(|p| into_f64(&p.weight()))
            .collect();
        let dist = WeightedIndex::new(&weights)
            .map_err(|err| GpError::InvalidValueError(format!("SMC resampling: {err}")))?;
        debug!(
            "Resample {n} particles (ess = {})",
            self.effective_sample_size()
        );
        let log_weight = -F::cast(n).ln();
        let resampled: Vec<_> = (0..n)
            .map(|_| {
                let p = &self.particles[dist.sample(&mut self.rng)];
                Particle {
                    model: p.model.clone(),
                    log_weight,
                    loglike: p.loglike,
                }
            })
            .collect();
        self.particles = resampled;
        Ok(())
    }

    /// Moves every particle with the MCMC kernel, one seeded generator per particle
    fn rejuvenate(&mut self) -> Result<()> {
        let blocks = self.particles[0].model.params();
        if self.rejuvenation_steps == 0 || self.priors.active(&blocks).is_empty() {
            return Ok(());
        }
        let seeds: Vec<u64> = (0..self.particles.len()).map(|_| self.rng.gen()).collect();
        let sampler = &self.sampler;
        let priors = &self.priors;
        let steps = self.rejuvenation_steps;
        self.particles
            .par_iter_mut()
            .zip(seeds)
            .map(|(p, seed)| -> Result<()> {
                let mut rng = Xoshiro256Plus::seed_from_u64(seed);
                sampler.sample(&mut p.model, priors, steps, &mut rng)?;
                Ok(())
            })
            .collect::<Result<()>>()
    }

    fn weights(&self) -> Array1<F> {
        self.log_weights().mapv(|v| v.exp())
    }

    /// Mixture posterior mean and variance at `x` points (nq, ndim)
    pub fn posterior(
        &self,
        x: &ArrayBase<impl Data<Elem = F> + Sync, Ix2>,
    ) -> Result<(Array1<F>, Array1<F>)> {
        let parts = self
            .particles
            .par_iter()
            .map(|p| p.model.posterior(x))
            .collect::<Result<Vec<_>>>()?;
        Ok(mixture_moments(&self.weights(), &parts))
    }

    /// Mixture posterior mean and variance with their gradients wrt `x` points
    pub fn posterior_grad(
        &self,
        x: &ArrayBase<impl Data<Elem = F> + Sync, Ix2>,
    ) -> Result<PosteriorGrad<F>> {
        let parts = self
            .particles
            .par_iter()
            .map(|p| p.model.posterior_grad(x))
            .collect::<Result<Vec<_>>>()?;
        Ok(mixture_moments_grad(&self.weights(), &parts))
    }
}

impl<'a, F: Float, M: GpSurrogate<F>, S: McmcKernel<F>> IntoIterator for &'a Smc<F, M, S> {
    type Item = &'a Particle<F, M>;
    type IntoIter = std::slice::Iter<'a, Particle<F, M>>;

    fn into_iter(self) -> Self::IntoIter {
        self.particles.iter()
    }
}

impl<F: Float, M: GpSurrogate<F>, S: McmcKernel<F>, D: Data<Elem = F>>
    Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>, GpError> for SmcValidParams<F, M, S>
{
    type Object = Smc<F, M, S>;

    /// Particles drawn from the priors then conditioned on the dataset
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>>,
    ) -> Result<Self::Object> {
        let mut smc = Smc::from_params(self)?;
        smc.add_data(dataset.records(), dataset.targets())?;
        Ok(smc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::BasicGp;
    use crate::priors::Prior;
    use crate::sparse_algorithm::BasicSparseGp;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use linfa::prelude::Dataset;
    use ndarray::{array, s, Array, Array2};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    fn make_test_data(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let x = Array::random_using((n, 1), Uniform::new(0f64, 1.), &mut rng);
        let y = x.column(0).mapv(|v| f64::sin(6. * v));
        (x, y)
    }

    fn priors() -> Priors<f64> {
        Priors::new()
            .with("sn", Prior::uniform(0.01, 1.).unwrap())
            .with("sf", Prior::uniform(0.01, 5.).unwrap())
            .with("ell", Prior::uniform(0.01, 1.).unwrap())
    }

    fn make_smc(seed: u64) -> Smc<f64, BasicGp<f64>> {
        let gp = BasicGp::basic(0.1, 1., &array![0.1], Some(1)).unwrap();
        Smc::params(gp, priors())
            .n_particles(20)
            .seed(Some(seed))
            .check()
            .unwrap()
            .fit(&Dataset::new(Array2::zeros((0, 1)), Array1::zeros(0)))
            .unwrap()
    }

    #[test]
    fn test_smc_weights_normalized() {
        let mut smc = make_smc(0);
        assert_abs_diff_eq!(smc.log_weights().mapv(f64::exp).sum(), 1., epsilon = 1e-12);
        assert_abs_diff_eq!(smc.effective_sample_size(), 20., epsilon = 1e-9);
        let (x, y) = make_test_data(8, 1);
        for i in 0..x.nrows() {
            smc.add_data(&x.slice(s![i..i + 1, ..]), &y.slice(s![i..i + 1]))
                .unwrap();
            let total: f64 = smc.iter().map(|p| p.weight()).sum();
            assert_abs_diff_eq!(total, 1., epsilon = 1e-10);
            let ess = smc.effective_sample_size();
            assert!(ess >= 1. - 1e-9 && ess <= 20. + 1e-9);
        }
        assert_eq!(smc.ndata(), 8);
        assert!(smc.particles().iter().all(|p| p.model().ndata() == 8));
        for p in &smc {
            assert_abs_diff_eq!(p.loglike(), p.model().loglikelihood().unwrap(), epsilon = 1e-12);
        }
        assert_abs_diff_eq!(smc.data().0, x.view(), epsilon = 0.);
    }

    #[test]
    fn test_smc_particles_in_prior_support() {
        let mut smc = make_smc(1);
        let (x, y) = make_test_data(5, 2);
        smc.add_data(&x, &y).unwrap();
        for p in &smc {
            let h = p.model().hyper();
            assert!(h[0] >= 0.01f64.ln() && h[0] <= 0.);
            assert!(h[1] >= 0.01f64.ln() && h[1] <= 5f64.ln());
            assert!(h[2] >= 0.01f64.ln() && h[2] <= 0.);
            // no prior on mean: template value kept
            assert_eq!(h[3], 0.);
        }
    }

    #[test]
    fn test_smc_reproducible() {
        let (x, y) = make_test_data(5, 2);
        let xtest = array![[0.25], [0.75]];
        let run = |seed| {
            let mut smc = make_smc(seed);
            smc.add_data(&x, &y).unwrap();
            smc.posterior(&xtest).unwrap()
        };
        let (mu1, s21) = run(3);
        let (mu2, s22) = run(3);
        assert_eq!(mu1, mu2);
        assert_eq!(s21, s22);
    }

    #[test]
    fn test_smc_posterior_grad() {
        let mut smc = make_smc(4);
        let (x, y) = make_test_data(6, 2);
        smc.add_data(&x, &y).unwrap();
        let xtest = array![[0.1], [0.45], [0.8]];
        let (mu, s2, dmu, ds2) = smc.posterior_grad(&xtest).unwrap();
        let (mu_, s2_) = smc.posterior(&xtest).unwrap();
        assert_abs_diff_eq!(mu, mu_, epsilon = 1e-12);
        assert_abs_diff_eq!(s2, s2_, epsilon = 1e-12);
        for i in 0..xtest.nrows() {
            let fmu = |x: &Vec<f64>| -> f64 {
                smc.posterior(&Array2::from_shape_vec((1, 1), x.clone()).unwrap())
                    .unwrap()
                    .0[0]
            };
            let fs2 = |x: &Vec<f64>| -> f64 {
                smc.posterior(&Array2::from_shape_vec((1, 1), x.clone()).unwrap())
                    .unwrap()
                    .1[0]
            };
            let xi = xtest.row(i).to_vec();
            let (gmu, gs2) = (xi.central_diff(&fmu)[0], xi.central_diff(&fs2)[0]);
            assert!((dmu[[i, 0]] - gmu).abs() <= 1e-5 + 1e-5 * gmu.abs());
            assert!((ds2[[i, 0]] - gs2).abs() <= 1e-5 + 1e-5 * gs2.abs());
        }
    }

    #[test]
    fn test_smc_from_model_with_data() {
        let (x, y) = make_test_data(6, 2);
        let mut gp = BasicGp::basic(0.1, 1., &array![0.1], Some(1)).unwrap();
        gp.add_data(&x, &y).unwrap();
        let smc = Smc::params(gp, priors())
            .n_particles(10)
            .seed(Some(5))
            .check()
            .unwrap();
        let smc = Smc::from_params(&smc).unwrap();
        assert_eq!(smc.ndata(), 6);
        assert_abs_diff_eq!(smc.data().1, y.view(), epsilon = 0.);
        assert_abs_diff_eq!(smc.log_weights().mapv(f64::exp).sum(), 1., epsilon = 1e-10);
    }

    #[test]
    fn test_smc_prior_without_data() {
        let smc = make_smc(6);
        assert_eq!(smc.ndata(), 0);
        let xtest = array![[0.3], [0.6]];
        let (mu, s2) = smc.posterior(&xtest).unwrap();
        assert_abs_diff_eq!(mu, Array1::zeros(2), epsilon = 1e-12);
        // mixture of prior variances sf^2
        let expected: f64 = smc
            .iter()
            .map(|p| p.weight() * (2. * p.model().hyper()[1]).exp())
            .sum();
        assert_abs_diff_eq!(s2[0], expected, epsilon = 1e-10);
        assert_abs_diff_eq!(s2[1], expected, epsilon = 1e-10);
    }

    #[test]
    fn test_smc_without_resampling() {
        let gp = BasicGp::basic(0.1, 1., &array![0.1], Some(1)).unwrap();
        let mut smc = Smc::params(gp, priors())
            .n_particles(10)
            .resample(false)
            .rejuvenation_steps(0)
            .seed(Some(7))
            .check()
            .and_then(|params| Smc::from_params(&params))
            .unwrap();
        let hypers0: Vec<_> = smc.iter().map(|p| p.model().hyper()).collect();
        let (x, y) = make_test_data(10, 2);
        smc.add_data(&x, &y).unwrap();
        // neither resampled nor moved
        for (p, h) in smc.iter().zip(hypers0) {
            assert_eq!(p.model().hyper(), h);
        }
        // weights are the normalized marginal likelihoods
        let lls = Array1::from_iter(smc.iter().map(|p| p.model().loglikelihood().unwrap()));
        let expected = &lls - logsumexp(&lls);
        assert_abs_diff_eq!(smc.log_weights(), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_smc_failed_update_restores_particles() {
        let mut smc = make_smc(4);
        let (x, y) = make_test_data(3, 5);
        smc.add_data(&x, &y).unwrap();
        let xtest = array![[0.3], [0.7]];
        let lw = smc.log_weights();
        let hypers: Vec<_> = smc.iter().map(|p| p.model().hyper()).collect();
        let (mu, s2) = smc.posterior(&xtest).unwrap();

        // first observation is valid, second one makes every weight undefined
        let res = smc.add_data(&array![[0.5], [0.6]], &array![0.1, f64::NAN]);
        assert!(res.is_err());
        assert_eq!(smc.ndata(), 3);
        assert!(smc.iter().all(|p| p.model().ndata() == 3));
        assert_abs_diff_eq!(smc.log_weights(), lw, epsilon = 0.);
        for (p, h) in smc.iter().zip(hypers) {
            assert_eq!(p.model().hyper(), h);
        }
        let (mu_, s2_) = smc.posterior(&xtest).unwrap();
        assert_abs_diff_eq!(mu, mu_, epsilon = 0.);
        assert_abs_diff_eq!(s2, s2_, epsilon = 0.);

        smc.add_data(&array![[0.5]], &array![0.1]).unwrap();
        assert_eq!(smc.ndata(), 4);
        assert_abs_diff_eq!(smc.log_weights().mapv(f64::exp).sum(), 1., epsilon = 1e-10);
    }

    #[test]
    fn test_smc_consistent_after_factorization_failure() {
        // tiny noise levels make repeated inputs singular for some particles
        let gp = BasicGp::basic(0.1, 1., &array![0.1], Some(1)).unwrap();
        let priors = Priors::new().with("sn", Prior::lognormal(-20., 400.).unwrap());
        let mut smc = Smc::params(gp, priors)
            .n_particles(20)
            .seed(Some(0))
            .check()
            .unwrap()
            .fit(&Dataset::new(array![[0.2]], array![0.3]))
            .unwrap();
        let res = smc.add_data(&array![[0.5], [0.5]], &array![0.1, 0.1]);
        let expected = if res.is_ok() { 3 } else { 1 };
        assert!(smc.iter().all(|p| p.model().ndata() == expected));
        assert_eq!(smc.ndata(), expected);
        assert!(smc.posterior(&array![[0.4]]).is_ok());
    }

    #[test]
    fn test_smc_sparse_particles() {
        let z = array![[0.1], [0.4], [0.7], [0.9]];
        let sgp = BasicSparseGp::basic(0.1, 1., &array![0.2], Some(1), &z).unwrap();
        let mut smc = Smc::new(sgp, priors(), 8).unwrap();
        let (x, y) = make_test_data(6, 2);
        smc.add_data(&x, &y).unwrap();
        assert_eq!(smc.ndata(), 6);
        let (_, s2) = smc.posterior(&array![[0.5]]).unwrap();
        assert!(s2[0] >= 0.);
    }

    #[test]
    fn test_smc_invalid_params() {
        let gp = BasicGp::basic(0.1, 1., &array![0.1], Some(1)).unwrap();
        assert!(Smc::new(gp.clone(), priors(), 0).is_err());
        let bad = Priors::new().with("noise", Prior::uniform(0.01, 1.).unwrap());
        assert!(Smc::new(gp.clone(), bad, 10).is_err());
        let mut smc = Smc::new(gp, priors(), 5).unwrap();
        assert!(matches!(
            smc.add_data(&array![[0., 1.]], &array![1.]),
            Err(GpError::DimensionError { .. })
        ));
    }
}
