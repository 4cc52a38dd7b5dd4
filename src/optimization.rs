//! Hyperparameters point estimation by maximizing the (penalized) log marginal likelihood.

use crate::errors::{GpError, Result};
use crate::priors::Priors;
use crate::surrogate::GpSurrogate;

use linfa::Float;
use log::debug;
use ndarray::{arr1, s, Array1, Array2, Zip};
use ndarray_rand::rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use std::time::Instant;

/// Default number of multistart for hyperparameters optimization
pub const GP_OPTIM_N_START: usize = 10;
/// Minimum of function evaluations for COBYLA optimizer
pub const GP_COBYLA_MIN_EVAL: usize = 25;
/// Maximum of function evaluations for COBYLA optimizer
pub const GP_COBYLA_MAX_EVAL: usize = 1000;
/// Half width of the search interval of a hyperparameter without bounded prior
pub const GP_OPTIM_BOUND_WIDTH: f64 = 3.;

pub(crate) struct CobylaParams {
    pub rhobeg: f64,
    pub ftol_rel: f64,
    pub maxeval: usize,
}

impl Default for CobylaParams {
    fn default() -> Self {
        CobylaParams {
            rhobeg: 0.5,
            ftol_rel: 1e-4,
            maxeval: 200,
        }
    }
}

/// Starting points of the multistart optimization: `x0` followed by
/// `n_start` points drawn uniformly within `bounds`
pub(crate) fn prepare_multistart<F: Float>(
    n_start: usize,
    x0: &Array1<F>,
    bounds: &[(F, F)],
    rng: &mut Xoshiro256Plus,
) -> Array2<F> {
    let mut x0s = Array2::zeros((n_start + 1, x0.len()));
    x0s.row_mut(0).assign(x0);
    for mut row in x0s.slice_mut(s![1.., ..]).rows_mut() {
        Zip::from(&mut row)
            .and(bounds)
            .for_each(|v, (lo, up)| *v = F::cast(rng.gen_range(into_f64(lo)..into_f64(up))));
    }
    x0s
}

/// Optimize hyperparameters given an initial guess and bounds with cobyla
pub(crate) fn optimize_params<ObjF, F>(
    objfn: ObjF,
    param0: &Array1<F>,
    bounds: &[(F, F)],
    cobyla: CobylaParams,
) -> (f64, Array1<f64>)
where
    ObjF: Fn(&[f64], Option<&mut [f64]>, &mut ()) -> f64,
    F: Float,
{
    use cobyla::{minimize, Func, StopTols};

    let cons: Vec<&dyn Func<()>> = vec![];
    let param0 = param0.map(|v| into_f64(v)).into_raw_vec();

    let bounds: Vec<_> = bounds
        .iter()
        .map(|(lo, up)| (into_f64(lo), into_f64(up)))
        .collect();

    match minimize(
        |x, u| objfn(x, None, u),
        &param0,
        &bounds,
        &cons,
        (),
        cobyla.maxeval,
        cobyla::RhoBeg::All(cobyla.rhobeg),
        Some(StopTols {
            ftol_rel: cobyla.ftol_rel,
            ..StopTols::default()
        }),
    ) {
        Ok((_, x_opt, fval)) => {
            let params_opt = arr1(&x_opt);
            let fval = if f64::is_nan(fval) {
                f64::INFINITY
            } else {
                fval
            };
            (fval, params_opt)
        }
        Err((status, x_opt, _)) => {
            log::warn!("ERROR Cobyla optimizer in GP status={status:?}");
            (f64::INFINITY, arr1(&x_opt))
        }
    }
}

#[inline(always)]
pub(crate) fn into_f64<F: Float>(v: &F) -> f64 {
    v.to_f64().unwrap_or(f64::NAN)
}

/// Set `model` hyperparameters to the maximum of its log marginal likelihood
/// plus the log density of `priors` if any.
///
/// Blocks marked as fixed in `priors` are not optimized. Blocks having a uniform
/// prior are searched within its support, others within
/// [GP_OPTIM_BOUND_WIDTH] of their current value.
/// Returns the reached maximum.
pub fn optimize<F: Float, M: GpSurrogate<F>>(
    model: &mut M,
    priors: Option<&Priors<F>>,
    n_start: usize,
    seed: Option<u64>,
) -> Result<F> {
    optimize_with(model, priors, n_start, GP_COBYLA_MAX_EVAL, seed)
}

/// Same as [optimize] with a given max number of likelihood evaluations per start
pub fn optimize_with<F: Float, M: GpSurrogate<F>>(
    model: &mut M,
    priors: Option<&Priors<F>>,
    n_start: usize,
    max_eval: usize,
    seed: Option<u64>,
) -> Result<F> {
    let no_priors = Priors::new();
    let priors = priors.unwrap_or(&no_priors);
    let blocks = model.params();
    priors.check(&blocks)?;
    let hyper0 = model.hyper();

    let mut active = vec![];
    let mut bounds = vec![];
    for block in blocks.iter().filter(|b| !priors.is_fixed(&b.name)) {
        for i in block.range.clone() {
            active.push(i);
            let width = F::cast(GP_OPTIM_BOUND_WIDTH);
            let bound = priors
                .get(&block.name)
                .and_then(|p| p.bounds(block.logged))
                .unwrap_or((hyper0[i] - width, hyper0[i] + width));
            bounds.push(bound);
        }
    }
    if active.is_empty() {
        return model.loglikelihood().map(|ll| ll + priors.logprior(&hyper0, &blocks));
    }

    let model_ref: &M = model;
    let objfn = |x: &[f64], _gradient: Option<&mut [f64]>, _params: &mut ()| -> f64 {
        // check as optimizer may return nan values
        if x.iter().any(|v| v.is_nan()) {
            return f64::INFINITY;
        }
        let mut hyper = hyper0.to_owned();
        active
            .iter()
            .zip(x)
            .for_each(|(&i, &xi)| hyper[i] = F::cast(xi));
        let mut trial = model_ref.clone();
        match trial.set_hyper(&hyper).and_then(|_| trial.loglikelihood()) {
            Ok(ll) => -into_f64(&(ll + priors.logprior(&hyper, &blocks))),
            Err(_) => f64::INFINITY,
        }
    };

    let mut rng = match seed {
        Some(seed) => Xoshiro256Plus::seed_from_u64(seed),
        None => Xoshiro256Plus::from_entropy(),
    };
    // start from current values clipped into the search space
    let x0 = Array1::from_iter(
        active
            .iter()
            .zip(bounds.iter())
            .map(|(&i, &(lo, up))| hyper0[i].max(lo).min(up)),
    );
    let x0s = prepare_multistart(n_start, &x0, &bounds, &mut rng);
    debug!("Optimize with multistart hyper = {x0s:?} and bounds = {bounds:?}");
    let now = Instant::now();
    let (fmin, xopt) = (0..x0s.nrows())
        .into_par_iter()
        .map(|i| {
            optimize_params(
                objfn,
                &x0s.row(i).to_owned(),
                &bounds,
                CobylaParams {
                    maxeval: (10 * x0s.ncols()).clamp(GP_COBYLA_MIN_EVAL, max_eval),
                    ..CobylaParams::default()
                },
            )
        })
        .reduce(
            || (f64::INFINITY, Array1::zeros(x0s.ncols())),
            |a, b| if b.0 < a.0 { b } else { a },
        );
    debug!("elapsed optim = {:?}", now.elapsed().as_millis());

    if !fmin.is_finite() {
        return Err(GpError::InvalidValueError(
            "hyperparameters optimization failed to find a finite log likelihood".to_string(),
        ));
    }
    let mut hyper = hyper0;
    active
        .iter()
        .zip(xopt.iter())
        .for_each(|(&i, &xi)| hyper[i] = F::cast(xi));
    model.set_hyper(&hyper)?;
    Ok(F::cast(-fmin))
}
