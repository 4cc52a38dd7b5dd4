//! MCMC transition kernels over the hyperparameters of a GP model.
//!
//! A kernel leaves the posterior `p(theta | data)`, proportional to the
//! marginal likelihood times the priors, invariant. Only hyperparameters of
//! blocks having a prior move, the others stay at their current value.

use crate::errors::{GpError, Result};
use crate::hyperparameters::HyperBlock;
use crate::priors::Priors;
use crate::surrogate::GpSurrogate;

use linfa::Float;
use log::warn;
use ndarray::{Array1, Array2};
use ndarray_rand::rand::Rng;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default initial width of the slice bracket
pub const SLICE_WIDTH: f64 = 1.;
/// Default max number of stepping out extensions of the slice bracket
pub const SLICE_MAX_STEPS: usize = 10;

/// A Markov chain transition kernel on GP hyperparameters
pub trait McmcKernel<F: Float>: Clone + fmt::Debug + Send + Sync {
    /// Runs `n_steps` transitions starting from the `model` current hyperparameters.
    ///
    /// Returns visited hyperparameters (n_steps, nhyper), the model is left
    /// with the last ones set.
    fn sample<M: GpSurrogate<F>, R: Rng + ?Sized>(
        &self,
        model: &mut M,
        priors: &Priors<F>,
        n_steps: usize,
        rng: &mut R,
    ) -> Result<Array2<F>>;
}

/// Axis-aligned slice sampler with stepping out (Neal, 2003)
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct SliceSampler {
    width: f64,
    max_steps: usize,
}

impl Default for SliceSampler {
    fn default() -> Self {
        SliceSampler {
            width: SLICE_WIDTH,
            max_steps: SLICE_MAX_STEPS,
        }
    }
}

impl SliceSampler {
    /// Slice sampler with initial bracket `width` extended at most `max_steps` times
    pub fn new(width: f64, max_steps: usize) -> Result<Self> {
        if !(width.is_finite() && width > 0.) {
            return Err(GpError::InvalidValueError(format!(
                "slice width should be positive, got {width}"
            )));
        }
        Ok(SliceSampler { width, max_steps })
    }

    /// Initial bracket width
    pub fn width(&self) -> f64 {
        self.width
    }

    /// Max number of stepping out extensions
    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Draws a new value of `hyper[i]` from the slice of `logp0`, `hyper` is updated
    /// and the log target at the new point is returned
    #[allow(clippy::too_many_arguments)]
    fn update_coordinate<F: Float, M: GpSurrogate<F>, R: Rng + ?Sized>(
        &self,
        model: &mut M,
        priors: &Priors<F>,
        blocks: &[HyperBlock],
        hyper: &mut Array1<F>,
        i: usize,
        logp0: F,
        rng: &mut R,
    ) -> F {
        let x0 = hyper[i];
        let level = logp0 + F::cast(rng.gen::<f64>().ln());
        let mut logp_at = |x: F, hyper: &mut Array1<F>| {
            hyper[i] = x;
            log_target(model, priors, blocks, hyper)
        };

        // stepping out
        let width = F::cast(self.width);
        let mut lo = x0 - width * F::cast(rng.gen::<f64>());
        let mut hi = lo + width;
        let mut j = rng.gen_range(0..=self.max_steps);
        let mut k = self.max_steps - j;
        while j > 0 && logp_at(lo, hyper) > level {
            lo -= width;
            j -= 1;
        }
        while k > 0 && logp_at(hi, hyper) > level {
            hi += width;
            k -= 1;
        }

        // shrinkage
        loop {
            let x1 = lo + (hi - lo) * F::cast(rng.gen::<f64>());
            let logp1 = logp_at(x1, hyper);
            if logp1 > level {
                return logp1;
            }
            if x1 < x0 {
                lo = x1;
            } else {
                hi = x1;
            }
            if hi - lo <= F::epsilon() * (F::one() + num_traits::Float::abs(x0)) {
                warn!("Slice sampling bracket collapsed on hyperparameter {i}, value kept");
                hyper[i] = x0;
                return logp0;
            }
        }
    }
}

/// Unnormalized log posterior of hyperparameters, `-inf` when the model can not be updated
fn log_target<F: Float, M: GpSurrogate<F>>(
    model: &mut M,
    priors: &Priors<F>,
    blocks: &[HyperBlock],
    hyper: &Array1<F>,
) -> F {
    let logprior = priors.logprior(hyper, blocks);
    if !logprior.is_finite() {
        return F::neg_infinity();
    }
    match model.set_hyper(hyper).and_then(|_| model.loglikelihood()) {
        Ok(ll) if ll.is_finite() => logprior + ll,
        _ => F::neg_infinity(),
    }
}

impl<F: Float> McmcKernel<F> for SliceSampler {
    fn sample<M: GpSurrogate<F>, R: Rng + ?Sized>(
        &self,
        model: &mut M,
        priors: &Priors<F>,
        n_steps: usize,
        rng: &mut R,
    ) -> Result<Array2<F>> {
        let blocks = model.params();
        priors.check(&blocks)?;
        let active = priors.active(&blocks);
        let mut hyper = model.hyper();
        let mut samples = Array2::zeros((n_steps, hyper.len()));

        let mut logp = log_target(model, priors, &blocks, &hyper);
        if !logp.is_finite() {
            // restore the model which may be left invalidated
            model.set_hyper(&hyper)?;
            return Err(GpError::InvalidValueError(format!(
                "slice sampling starts with a null posterior density at {hyper}"
            )));
        }
        for mut row in samples.rows_mut() {
            for &i in active.iter() {
                logp = self.update_coordinate(model, priors, &blocks, &mut hyper, i, logp, rng);
            }
            row.assign(&hyper);
        }
        model.set_hyper(&hyper)?;
        Ok(samples)
    }
}
