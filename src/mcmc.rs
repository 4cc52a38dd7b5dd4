use crate::errors::{GpError, Result};
use crate::priors::Priors;
use crate::sampling::{McmcKernel, SliceSampler};
use crate::surrogate::{GpSurrogate, PosteriorGrad};
use crate::utils::{mixture_moments, mixture_moments_grad};

use linfa::Float;
use ndarray::{Array1, ArrayBase, ArrayView1, ArrayView2, Data, Ix1, Ix2};
use ndarray_rand::rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use std::fmt;

/// Meta model averaging GP predictions over hyperparameters sampled by MCMC.
///
/// Each time data is added, the chain is run from the last sample: `burn`
/// steps are discarded then `n` consecutive states are kept as equally
/// weighted models.
#[derive(Debug, Clone)]
pub struct McmcGp<F: Float, M: GpSurrogate<F>, S: McmcKernel<F> = SliceSampler> {
    model: M,
    priors: Priors<F>,
    sampler: S,
    n: usize,
    burn: usize,
    samples: Vec<M>,
    rng: Xoshiro256Plus,
}

impl<F: Float, M: GpSurrogate<F>> McmcGp<F, M, SliceSampler> {
    /// Meta model keeping `n` slice samples after `burn` steps, sampling
    /// right away when `model` already has data
    pub fn new(model: M, priors: Priors<F>, n: usize, burn: usize, seed: Option<u64>) -> Result<Self> {
        McmcGp::with_sampler(model, priors, SliceSampler::default(), n, burn, seed)
    }
}

impl<F: Float, M: GpSurrogate<F>, S: McmcKernel<F>> fmt::Display for McmcGp<F, M, S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "MCMC(samples={}, burn={}, ndata={}, priors={})",
            self.samples.len(),
            self.burn,
            self.ndata(),
            self.priors
        )
    }
}

impl<F: Float, M: GpSurrogate<F>, S: McmcKernel<F>> McmcGp<F, M, S> {
    /// Same as [McmcGp::new] with a given MCMC kernel
    pub fn with_sampler(
        model: M,
        priors: Priors<F>,
        sampler: S,
        n: usize,
        burn: usize,
        seed: Option<u64>,
    ) -> Result<Self> {
        if n == 0 {
            return Err(GpError::InvalidValueError(
                "MCMC meta model requires at least one sample".to_string(),
            ));
        }
        priors.check(&model.params())?;
        let rng = match seed {
            Some(seed) => Xoshiro256Plus::seed_from_u64(seed),
            None => Xoshiro256Plus::from_entropy(),
        };
        let mut mcmc = McmcGp {
            samples: vec![model.clone()],
            model,
            priors,
            sampler,
            n,
            burn,
            rng,
        };
        if mcmc.model.ndata() > 0 {
            mcmc.update()?;
        }
        Ok(mcmc)
    }

    fn update(&mut self) -> Result<()> {
        if self.burn > 0 {
            self.sampler
                .sample(&mut self.model, &self.priors, self.burn, &mut self.rng)?;
        }
        let mut samples = Vec::with_capacity(self.n);
        for _ in 0..self.n {
            self.sampler
                .sample(&mut self.model, &self.priors, 1, &mut self.rng)?;
            samples.push(self.model.clone());
        }
        self.samples = samples;
        Ok(())
    }

    /// Number of training points
    pub fn ndata(&self) -> usize {
        self.model.ndata()
    }

    /// Training inputs and outputs
    pub fn data(&self) -> (ArrayView2<F>, ArrayView1<F>) {
        self.model.data()
    }

    /// Current sampled models
    pub fn samples(&self) -> &[M] {
        &self.samples
    }

    /// Add training points `x` (n, ndim) and targets `y` (n,) then sample hyperparameters again.
    ///
    /// On error, the meta model is left as before the call.
    pub fn add_data(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        let (model, samples, rng) = (self.model.clone(), self.samples.clone(), self.rng.clone());
        let res = self.model.add_data(x, y).and_then(|_| self.update());
        if res.is_err() {
            self.model = model;
            self.samples = samples;
            self.rng = rng;
        }
        res
    }

    fn weights(&self) -> Array1<F> {
        Array1::from_elem(self.samples.len(), F::one() / F::cast(self.samples.len()))
    }

    /// Posterior mean and variance of the equally weighted mixture at `x` points
    pub fn posterior(
        &self,
        x: &ArrayBase<impl Data<Elem = F> + Sync, Ix2>,
    ) -> Result<(Array1<F>, Array1<F>)> {
        let parts = self
            .samples
            .par_iter()
            .map(|m| m.posterior(x))
            .collect::<Result<Vec<_>>>()?;
        Ok(mixture_moments(&self.weights(), &parts))
    }

    /// Posterior mean and variance with their gradients wrt `x` points
    pub fn posterior_grad(
        &self,
        x: &ArrayBase<impl Data<Elem = F> + Sync, Ix2>,
    ) -> Result<PosteriorGrad<F>> {
        let parts = self
            .samples
            .par_iter()
            .map(|m| m.posterior_grad(x))
            .collect::<Result<Vec<_>>>()?;
        Ok(mixture_moments_grad(&self.weights(), &parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::BasicGp;
    use crate::priors::Prior;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array, Array2};
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

    #[test]
    fn test_mcmc_samples() {
        let gp = BasicGp::basic(0.1, 1., &array![0.1], Some(1)).unwrap();
        let mut mcmc = McmcGp::new(gp, priors(), 20, 10, Some(42)).unwrap();
        // no data: the template model is the only sample
        assert_eq!(mcmc.samples().len(), 1);

        let (x, y) = make_test_data(10, 1);
        mcmc.add_data(&x, &y).unwrap();
        assert_eq!(mcmc.ndata(), 10);
        assert_eq!(mcmc.samples().len(), 20);
        assert!(mcmc.samples().iter().all(|m| m.ndata() == 10));

        let xtest = array![[0.2], [0.5]];
        let (mu, s2) = mcmc.posterior(&xtest).unwrap();
        assert!(s2.iter().all(|&v| v >= 0.));
        // mixture mean is the average of sample means
        let avg = mcmc
            .samples()
            .iter()
            .map(|m| m.posterior(&xtest).unwrap().0)
            .fold(Array1::zeros(2), |acc, mu| acc + mu)
            / 20.;
        assert_abs_diff_eq!(mu, avg, epsilon = 1e-10);
        let (mu_, s2_, dmu, _) = mcmc.posterior_grad(&xtest).unwrap();
        assert_abs_diff_eq!(mu, mu_, epsilon = 1e-12);
        assert_abs_diff_eq!(s2, s2_, epsilon = 1e-12);
        assert_eq!(dmu.dim(), (2, 1));
    }

    #[test]
    fn test_mcmc_with_data() {
        let (x, y) = make_test_data(10, 1);
        let mut gp = BasicGp::basic(0.1, 1., &array![0.1], Some(1)).unwrap();
        gp.add_data(&x, &y).unwrap();
        let mcmc = McmcGp::new(gp, priors(), 5, 0, Some(0)).unwrap();
        assert_eq!(mcmc.samples().len(), 5);
        assert_eq!(mcmc.data().0.nrows(), 10);
    }

    #[test]
    fn test_mcmc_failed_update_restores_samples() {
        let (x, y) = make_test_data(10, 1);
        let gp = BasicGp::basic(0.1, 1., &array![0.1], Some(1)).unwrap();
        let mut mcmc = McmcGp::new(gp, priors(), 5, 2, Some(3)).unwrap();
        mcmc.add_data(&x, &y).unwrap();
        let xtest = array![[0.4]];
        let (mu, s2) = mcmc.posterior(&xtest).unwrap();

        assert!(mcmc.add_data(&array![[0.5]], &array![f64::NAN]).is_err());
        assert_eq!(mcmc.ndata(), 10);
        assert!(mcmc.samples().iter().all(|m| m.ndata() == 10));
        let (mu_, s2_) = mcmc.posterior(&xtest).unwrap();
        assert_abs_diff_eq!(mu, mu_, epsilon = 0.);
        assert_abs_diff_eq!(s2, s2_, epsilon = 0.);
    }

    #[test]
    fn test_mcmc_invalid() {
        let gp = BasicGp::basic(0.1, 1., &array![0.1], Some(1)).unwrap();
        assert!(McmcGp::new(gp.clone(), priors(), 0, 0, None).is_err());
        let bad = Priors::new().with("unknown", Prior::uniform(0.01, 1.).unwrap());
        assert!(McmcGp::new(gp, bad, 10, 0, None).is_err());
    }
}
