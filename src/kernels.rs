//! Covariance kernels used as GP prior.
//!
//! A kernel owns its hyperparameters (stored in log space) and provides the
//! covariance between two sets of points, its derivatives wrt its
//! hyperparameters and wrt the points of the second set, and a spectral
//! sampler used to build random Fourier features.
//!
//! The following kernels are implemented:
//! * squared exponential, either isotropic or with automatic relevance determination (ARD).

use crate::errors::{GpError, Result};
use crate::hyperparameters::HyperBlock;
use crate::utils::cross_differences;
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// A trait for covariance kernels `k(x, x')` of a GP prior
pub trait Kernel<F: Float>: Clone + fmt::Debug + fmt::Display + Send + Sync {
    /// Input dimension
    fn ndim(&self) -> usize;

    /// Number of hyperparameters
    fn nhyper(&self) -> usize;

    /// Hyperparameter blocks relative to the kernel own vector
    fn params(&self) -> Vec<HyperBlock>;

    /// Hyperparameters as stored (log space)
    fn hyper(&self) -> Array1<F>;

    /// Set hyperparameters from a vector laid out as [`Kernel::params`]
    fn set_hyper(&mut self, hyper: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()>;

    /// Covariance matrix (na, nb) between points of `a` and points of `b`
    fn value(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Array2<F>;

    /// Variances `k(x, x)` of points of `a`
    fn diag(&self, a: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F>;

    /// Derivatives of the covariance matrix wrt each hyperparameter, in order
    fn grad(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Vec<Array2<F>>;

    /// Derivatives of the variances wrt each hyperparameter, in order
    fn grad_diag(&self, a: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Vec<Array1<F>>;

    /// Derivatives of the covariance matrix wrt each component of the points of `b`:
    /// the k-th array holds `d k(a_i, b_j) / d b_jk`
    fn grad_x(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Vec<Array2<F>>;

    /// Draws `n` frequencies (n, ndim) of the kernel spectral density
    /// and returns them with the spectral mass (ie the kernel variance)
    fn sample_spectrum<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> (Array2<F>, F);
}

/// Squared exponential kernel `sf^2 * exp(-0.5 * sum_k ((x_k - x'_k) / ell_k)^2)`
///
/// Hyperparameters are `[log(sf), log(ell)]` for the isotropic version
/// and `[log(sf), log(ell_1), ..., log(ell_d)]` for the ARD version.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct SquaredExponential<F: Float> {
    log_sf: F,
    log_ell: Array1<F>,
    ndim: usize,
}

impl<F: Float> SquaredExponential<F> {
    /// Isotropic kernel with a single lengthscale shared by `ndim` dimensions
    pub fn isotropic(sf: F, ell: F, ndim: usize) -> Result<Self> {
        Self::check_positive("sf", sf)?;
        Self::check_positive("ell", ell)?;
        if ndim == 0 {
            return Err(GpError::InvalidValueError(
                "kernel dimension should be positive".to_string(),
            ));
        }
        Ok(SquaredExponential {
            log_sf: sf.ln(),
            log_ell: Array1::from_elem(1, ell.ln()),
            ndim,
        })
    }

    /// ARD kernel with one lengthscale per dimension
    pub fn ard(sf: F, ell: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Self> {
        Self::check_positive("sf", sf)?;
        if ell.is_empty() {
            return Err(GpError::InvalidValueError(
                "kernel dimension should be positive".to_string(),
            ));
        }
        for &v in ell.iter() {
            Self::check_positive("ell", v)?;
        }
        Ok(SquaredExponential {
            log_sf: sf.ln(),
            log_ell: ell.mapv(|v| v.ln()),
            ndim: ell.len(),
        })
    }

    fn check_positive(name: &str, v: F) -> Result<()> {
        if !(v > F::zero() && v.is_finite()) {
            return Err(GpError::InvalidValueError(format!(
                "kernel {name} should be positive and finite, got {v}"
            )));
        }
        Ok(())
    }

    /// Whether a single lengthscale is shared by all dimensions
    pub fn is_isotropic(&self) -> bool {
        self.log_ell.len() == 1
    }

    /// Kernel variance `sf^2`
    pub fn variance(&self) -> F {
        (self.log_sf * F::cast(2.)).exp()
    }

    /// Lengthscales, one per dimension
    pub fn lengthscales(&self) -> Array1<F> {
        if self.log_ell.len() == self.ndim {
            self.log_ell.mapv(|v| v.exp())
        } else {
            Array1::from_elem(self.ndim, self.log_ell[0].exp())
        }
    }

    /// Scaled componentwise differences `(a_k - b_k) / ell_k` and the covariance matrix
    fn scaled_differences(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> (Vec<Array2<F>>, Array2<F>) {
        let ell = self.lengthscales();
        let diffs: Vec<Array2<F>> = cross_differences(a, b)
            .into_iter()
            .zip(ell.iter())
            .map(|(d, &l)| d / l)
            .collect();
        let mut sqdist = Array2::zeros((a.nrows(), b.nrows()));
        for d in diffs.iter() {
            sqdist += &d.mapv(|v| v * v);
        }
        let sf2 = self.variance();
        let k = sqdist.mapv(|v| sf2 * (-v / F::cast(2.)).exp());
        (diffs, k)
    }
}

impl<F: Float> fmt::Display for SquaredExponential<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SquaredExponential(sf={}, ell={})",
            self.log_sf.exp(),
            self.log_ell.mapv(|v| v.exp())
        )
    }
}

impl<F: Float> Kernel<F> for SquaredExponential<F> {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn nhyper(&self) -> usize {
        1 + self.log_ell.len()
    }

    fn params(&self) -> Vec<HyperBlock> {
        vec![
            HyperBlock::new("sf", 0..1, true),
            HyperBlock::new("ell", 1..(1 + self.log_ell.len()), true),
        ]
    }

    fn hyper(&self) -> Array1<F> {
        let mut hyper = Array1::zeros(self.nhyper());
        hyper[0] = self.log_sf;
        hyper.slice_mut(ndarray::s![1..]).assign(&self.log_ell);
        hyper
    }

    fn set_hyper(&mut self, hyper: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<()> {
        if hyper.len() != self.nhyper() {
            return Err(GpError::InvalidValueError(format!(
                "kernel expects {} hyperparameters, got {}",
                self.nhyper(),
                hyper.len()
            )));
        }
        self.log_sf = hyper[0];
        self.log_ell.assign(&hyper.slice(ndarray::s![1..]));
        Ok(())
    }

    fn value(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Array2<F> {
        self.scaled_differences(a, b).1
    }

    fn diag(&self, a: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F> {
        Array1::from_elem(a.nrows(), self.variance())
    }

    fn grad(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Vec<Array2<F>> {
        let (diffs, k) = self.scaled_differences(a, b);
        let mut grads = Vec::with_capacity(self.nhyper());
        grads.push(&k * F::cast(2.));
        if self.log_ell.len() == self.ndim {
            for d in diffs.iter() {
                grads.push(&k * &d.mapv(|v| v * v));
            }
        } else {
            let mut sqdist = Array2::zeros(k.dim());
            for d in diffs.iter() {
                sqdist += &d.mapv(|v| v * v);
            }
            grads.push(&k * &sqdist);
        }
        grads
    }

    fn grad_diag(&self, a: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Vec<Array1<F>> {
        let mut grads = vec![Array1::zeros(a.nrows()); self.nhyper()];
        grads[0] = Array1::from_elem(a.nrows(), self.variance() * F::cast(2.));
        grads
    }

    fn grad_x(
        &self,
        a: &ArrayBase<impl Data<Elem = F>, Ix2>,
        b: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Vec<Array2<F>> {
        let ell = self.lengthscales();
        let (diffs, k) = self.scaled_differences(a, b);
        diffs
            .into_iter()
            .zip(ell.iter())
            .map(|(d, &l)| &k * &d / l)
            .collect()
    }

    fn sample_spectrum<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> (Array2<F>, F) {
        let ell = self.lengthscales();
        let w = Array2::<f64>::random_using((n, self.ndim), StandardNormal, rng).mapv(|v| F::cast(v))
            / &ell.view().insert_axis(Axis(0));
        (w, self.variance())
    }
}

/// Builds a [`SquaredExponential`] kernel, isotropic when `ndim` is given
/// otherwise ARD with the dimension given by `ell` length.
pub fn squared_exponential<F: Float>(
    sf: F,
    ell: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ndim: Option<usize>,
) -> Result<SquaredExponential<F>> {
    match ndim {
        Some(ndim) => {
            if ell.len() != 1 {
                return Err(GpError::InvalidValueError(
                    "isotropic kernel expects a single lengthscale".to_string(),
                ));
            }
            SquaredExponential::isotropic(sf, ell[0], ndim)
        }
        None => SquaredExponential::ard(sf, ell),
    }
}
