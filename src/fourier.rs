//! Function draws from a GP approximated with random Fourier features.
//!
//! A stationary kernel is approximated by `n` random features
//! `phi(x) = a * cos(W x + b)` where rows of `W` are drawn from the kernel
//! spectral density, `b ~ U(0, 2 pi)` and `a = sqrt(2 sf^2 / n)`. A function
//! draw is then `f(x) = phi(x)^T theta + mean` with `theta` drawn from its
//! posterior given training data (or from `N(0, I)` without data). Such a
//! draw is a deterministic function which can be evaluated and differentiated
//! anywhere, which is what Thompson sampling acquisitions need.

use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::likelihoods::Likelihood;
use crate::utils::{check_data, check_dim, randn, solve_lower_vec, solve_upper_vec};
use linfa::Float;
use linfa_linalg::cholesky::*;
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Ix1, Ix2};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// A function drawn from a GP posterior using random Fourier features
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct FourierSample<F: Float> {
    /// Spectral frequencies (n, ndim)
    w: Array2<F>,
    /// Phases (n,)
    b: Array1<F>,
    /// Features amplitude
    a: F,
    /// Features weights (n,)
    theta: Array1<F>,
    /// Constant prior mean
    mean: F,
}

impl<F: Float> FourierSample<F> {
    /// Draws a function with `n` features from the GP defined by `likelihood`,
    /// `kernel` and `mean` conditioned on `data` if any.
    ///
    /// Returns `UnsupportedLikelihood` error when the likelihood is not gaussian.
    pub fn new<Lik: Likelihood<F>, K: Kernel<F>, R: Rng + ?Sized>(
        likelihood: &Lik,
        kernel: &K,
        mean: F,
        n: usize,
        data: Option<(ArrayView2<F>, ArrayView1<F>)>,
        rng: &mut R,
    ) -> Result<Self> {
        let sn2 = likelihood.variance()?;
        if n == 0 {
            return Err(GpError::InvalidValueError(
                "number of Fourier features should be positive".to_string(),
            ));
        }
        let (w, alpha) = kernel.sample_spectrum(n, rng);
        let b = Array1::<f64>::random_using(n, Uniform::new(0., 2. * std::f64::consts::PI), rng)
            .mapv(|v| F::cast(v));
        let a = (F::cast(2.) * alpha / F::cast(n)).sqrt();

        let theta = match data {
            Some((x, y)) if x.nrows() > 0 => {
                check_data(&x, &y, kernel.ndim())?;
                let phi = (x.dot(&w.t()) + &b).mapv(|v| a * v.cos());
                let mut amat = phi.t().dot(&phi);
                amat.diag_mut().mapv_inplace(|v| v + sn2);
                let l = amat.cholesky()?;

                // posterior N(A^-1 phi^T r, sn2 A^-1) with A = phi^T phi + sn2 I
                let r = &y - mean;
                let m = solve_upper_vec(&l, &solve_lower_vec(&l, &phi.t().dot(&r))?)?;
                let z = randn::<F, R>(n, rng) * sn2.sqrt();
                m + solve_upper_vec(&l, &z)?
            }
            _ => randn(n, rng),
        };

        Ok(FourierSample {
            w,
            b,
            a,
            theta,
            mean,
        })
    }

    /// Number of features
    pub fn nfeatures(&self) -> usize {
        self.theta.len()
    }

    /// Input dimension
    pub fn ndim(&self) -> usize {
        self.w.ncols()
    }

    /// Values of the function at `x` points (nq, ndim)
    pub fn evaluate(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        check_dim(x, self.ndim())?;
        let z = x.dot(&self.w.t()) + &self.b;
        Ok(z.mapv(|v| self.a * v.cos()).dot(&self.theta) + self.mean)
    }

    /// Values (nq,) and gradients (nq, ndim) of the function at `x` points (nq, ndim)
    pub fn evaluate_grad(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array1<F>, Array2<F>)> {
        check_dim(x, self.ndim())?;
        let z = x.dot(&self.w.t()) + &self.b;
        let f = z.mapv(|v| self.a * v.cos()).dot(&self.theta) + self.mean;
        let g = (z.mapv(|v| -self.a * v.sin()) * &self.theta).dot(&self.w);
        Ok((f, g))
    }

    /// Value of the function at a single point `x` (ndim,)
    pub fn call(&self, x: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<F> {
        Ok(self.evaluate(&x.view().insert_axis(Axis(0)))?[0])
    }

    /// Value and gradient (ndim,) of the function at a single point `x` (ndim,)
    pub fn call_grad(&self, x: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<(F, Array1<F>)> {
        let (f, g) = self.evaluate_grad(&x.view().insert_axis(Axis(0)))?;
        Ok((f[0], g.row(0).to_owned()))
    }
}
