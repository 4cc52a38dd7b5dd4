use crate::errors::{GpError, Result};
use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{s, Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2, Zip};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Cached posterior statistics of a model.
///
/// `Empty` when the model holds no data, `Invalidated` when hyperparameters
/// changed and the refresh did not succeed.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub(crate) enum Cache<S> {
    Empty,
    Invalidated,
    Valid(S),
}

impl<S> Cache<S> {
    /// Cached statistics, `None` when the model has no data
    pub fn get(&self) -> Result<Option<&S>> {
        match self {
            Cache::Empty => Ok(None),
            Cache::Invalidated => Err(GpError::InvalidCache),
            Cache::Valid(stats) => Ok(Some(stats)),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Cache::Valid(_))
    }
}

/// Check that `x` points have `ndim` components
pub(crate) fn check_dim<F: Float>(x: &ArrayBase<impl Data<Elem = F>, Ix2>, ndim: usize) -> Result<()> {
    if x.ncols() != ndim {
        return Err(GpError::DimensionError {
            expected: ndim,
            actual: x.ncols(),
        });
    }
    Ok(())
}

/// Check a training batch against the model dimension
pub(crate) fn check_data<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ndim: usize,
) -> Result<()> {
    check_dim(x, ndim)?;
    if x.nrows() != y.len() {
        return Err(GpError::LengthMismatch(x.nrows(), y.len()));
    }
    Ok(())
}

/// Stacks rows of `b` below rows of `a`
/// *Panics* if a and b have not the same column numbers
pub(crate) fn stack_rows<F: Float>(a: &Array2<F>, b: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
    let n = a.nrows();
    let mut stacked = Array2::zeros((n + b.nrows(), a.ncols()));
    stacked.slice_mut(s![..n, ..]).assign(a);
    stacked.slice_mut(s![n.., ..]).assign(b);
    stacked
}

/// Appends `b` values to `a` ones
pub(crate) fn stack<F: Float>(a: &Array1<F>, b: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Array1<F> {
    a.iter().chain(b.iter()).cloned().collect()
}

/// Computes differences between each point of x and each point of y
/// component by component, resulting in `ncols(x)` arrays of shape (nrows(x), nrows(y)).
/// *Panics* if x and y have not the same column numbers
pub fn cross_differences<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Vec<Array2<F>> {
    assert!(x.ncols() == y.ncols());
    x.columns()
        .into_iter()
        .zip(y.columns())
        .map(|(xk, yk)| {
            let mut d = Array2::zeros((xk.len(), yk.len()));
            Zip::from(d.rows_mut())
                .and(&xk)
                .for_each(|mut row, &xi| row.assign(&yk.mapv(|yj| xi - yj)));
            d
        })
        .collect()
}

/// Computes `log(sum(exp(a)))` without overflow
pub fn logsumexp<F: Float>(a: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F {
    let amax = a.fold(F::neg_infinity(), |acc, &v| acc.max(v));
    if amax == F::neg_infinity() {
        return amax;
    }
    amax + a.mapv(|v| (v - amax).exp()).sum().ln()
}

/// Extends the lower Cholesky factor `l11` of K11 to the factor of
/// `[[K11, k12], [k12^T, k22]]`.
///
/// Returns the extended factor and `L11^-1 k12` which is the transposed
/// off-diagonal block of the new factor.
pub(crate) fn cholesky_append<F: Float>(
    l11: &Array2<F>,
    k12: &Array2<F>,
    k22: &Array2<F>,
) -> Result<(Array2<F>, Array2<F>)> {
    let (n, m) = k12.dim();
    let c = l11.solve_triangular(k12, UPLO::Lower)?;
    let l22 = (k22 - &c.t().dot(&c)).cholesky()?;

    let mut l = Array2::zeros((n + m, n + m));
    l.slice_mut(s![..n, ..n]).assign(l11);
    l.slice_mut(s![n.., ..n]).assign(&c.t());
    l.slice_mut(s![n.., n..]).assign(&l22);
    Ok((l, c))
}

/// Solves `L x = b` for a vector right hand side with `L` lower triangular
pub(crate) fn solve_lower_vec<F: Float>(
    l: &ArrayBase<impl Data<Elem = F>, Ix2>,
    b: &Array1<F>,
) -> Result<Array1<F>> {
    let x = l.solve_triangular(&b.view().insert_axis(Axis(1)), UPLO::Lower)?;
    Ok(x.column(0).to_owned())
}

/// Solves `L^T x = b` for a vector right hand side with `L` lower triangular
pub(crate) fn solve_upper_vec<F: Float>(
    l: &ArrayBase<impl Data<Elem = F>, Ix2>,
    b: &Array1<F>,
) -> Result<Array1<F>> {
    let x = l
        .t()
        .solve_triangular(&b.view().insert_axis(Axis(1)), UPLO::Upper)?;
    Ok(x.column(0).to_owned())
}

/// Draws `n` standard normal values
pub(crate) fn randn<F: Float, R: Rng + ?Sized>(n: usize, rng: &mut R) -> Array1<F> {
    Array1::<f64>::random_using(n, StandardNormal, rng).mapv(|v| F::cast(v))
}

/// Draws `m` samples of the gaussian `N(mean, cov)`, one sample per row
pub(crate) fn sample_mvn<F: Float, R: Rng + ?Sized>(
    mean: &Array1<F>,
    cov: &Array2<F>,
    m: usize,
    rng: &mut R,
) -> Result<Array2<F>> {
    let n = mean.len();
    // jitter to cope with rank deficient covariance (ie repeated points)
    let jitter = Array2::eye(n) * F::cast(1e-10);
    let l = (cov + &jitter).cholesky()?;
    let z = Array2::<f64>::random_using((m, n), StandardNormal, rng).mapv(|v| F::cast(v));
    Ok(z.dot(&l.t()) + mean)
}

/// Moments of the mixture of gaussians given their normalized `weights`
/// and their (mean, variance) predictions
pub(crate) fn mixture_moments<F: Float>(
    weights: &Array1<F>,
    parts: &[(Array1<F>, Array1<F>)],
) -> (Array1<F>, Array1<F>) {
    let nq = parts.first().map(|(mu, _)| mu.len()).unwrap_or(0);
    let mut mu = Array1::zeros(nq);
    for ((mu_i, _), &w) in parts.iter().zip(weights) {
        mu.scaled_add(w, mu_i);
    }
    let mut s2 = Array1::zeros(nq);
    for ((mu_i, s2_i), &w) in parts.iter().zip(weights) {
        let dev = mu_i - &mu;
        s2.scaled_add(w, &(s2_i + &(&dev * &dev)));
    }
    (mu, s2)
}

/// Moments of the mixture of gaussians and their gradients wrt query points
#[allow(clippy::type_complexity)]
pub(crate) fn mixture_moments_grad<F: Float>(
    weights: &Array1<F>,
    parts: &[(Array1<F>, Array1<F>, Array2<F>, Array2<F>)],
) -> (Array1<F>, Array1<F>, Array2<F>, Array2<F>) {
    let (nq, d) = parts
        .first()
        .map(|(_, _, dmu, _)| dmu.dim())
        .unwrap_or((0, 0));
    let mut mu = Array1::zeros(nq);
    let mut dmu = Array2::zeros((nq, d));
    for ((mu_i, _, dmu_i, _), &w) in parts.iter().zip(weights) {
        mu.scaled_add(w, mu_i);
        dmu.scaled_add(w, dmu_i);
    }
    let mut s2 = Array1::zeros(nq);
    let mut ds2 = Array2::zeros((nq, d));
    let two = F::cast(2.);
    for ((mu_i, s2_i, dmu_i, ds2_i), &w) in parts.iter().zip(weights) {
        let dev = mu_i - &mu;
        s2.scaled_add(w, &(s2_i + &(&dev * &dev)));
        let ddev = (dmu_i - &dmu) * &dev.view().insert_axis(Axis(1)) * two;
        ds2.scaled_add(w, &(ds2_i + &ddev));
    }
    (mu, s2, dmu, ds2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_cross_differences() {
        let x = array![[-0.9486833], [-0.82219219]];
        let y = array![
            [-1.26491106],
            [-0.63245553],
            [0.],
            [0.63245553],
            [1.26491106]
        ];
        let d = cross_differences(&x, &y);
        assert_eq!(d.len(), 1);
        assert_abs_diff_eq!(
            &d[0],
            &array![
                [0.31622776, -0.31622777, -0.9486833, -1.58113883, -2.21359436],
                [0.44271887, -0.18973666, -0.82219219, -1.45464772, -2.08710325]
            ],
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_cross_differences_multi_dim() {
        let x = array![[1., 2.], [3., 5.]];
        let y = array![[0., 1.]];
        let d = cross_differences(&x, &y);
        assert_eq!(d.len(), 2);
        assert_abs_diff_eq!(&d[0], &array![[1.], [3.]]);
        assert_abs_diff_eq!(&d[1], &array![[1.], [4.]]);
    }

    #[test]
    fn test_logsumexp() {
        let a = array![1000., 1000.];
        assert_abs_diff_eq!(logsumexp(&a), 1000. + 2f64.ln(), epsilon = 1e-12);
        let a = array![0.1f64.ln(), 0.2f64.ln(), 0.7f64.ln()];
        assert_abs_diff_eq!(logsumexp(&a), 0., epsilon = 1e-12);
        let a = Array1::<f64>::from_elem(3, f64::NEG_INFINITY);
        assert_eq!(logsumexp(&a), f64::NEG_INFINITY);
    }

    #[test]
    fn test_cholesky_append() {
        let k = array![[4., 2., 0.4], [2., 5., 1.], [0.4, 1., 3.]];
        let l11 = k.slice(s![..2, ..2]).cholesky().unwrap();
        let k12 = k.slice(s![..2, 2..]).to_owned();
        let k22 = k.slice(s![2.., 2..]).to_owned();
        let (l, _) = cholesky_append(&l11, &k12, &k22).unwrap();
        assert_abs_diff_eq!(l, k.cholesky().unwrap(), epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_cache() {
        let cache: Cache<f64> = Cache::Invalidated;
        assert!(matches!(cache.get(), Err(GpError::InvalidCache)));
        let cache: Cache<f64> = Cache::Empty;
        assert!(cache.get().unwrap().is_none());
    }
}
