use crate::errors::{GpError, Result};
use crate::priors::Priors;
use crate::sampling::{McmcKernel, SliceSampler};
use crate::surrogate::GpSurrogate;
use linfa::{Float, ParamGuard};

/// Default number of particles
pub const SMC_N_PARTICLES: usize = 100;
/// Default number of MCMC steps applied to each particle after each observation
pub const SMC_REJUVENATION_STEPS: usize = 1;

/// A set of validated SMC meta model parameters.
#[derive(Clone, Debug)]
pub struct SmcValidParams<F: Float, M: GpSurrogate<F>, S: McmcKernel<F> = SliceSampler> {
    /// Template model, its current hyperparameters are kept for blocks without prior
    pub(crate) model: M,
    /// Hyperparameters priors
    pub(crate) priors: Priors<F>,
    /// Number of particles
    pub(crate) n_particles: usize,
    /// Whether particles are resampled when weights degenerate
    pub(crate) resample: bool,
    /// Number of MCMC steps per particle after each observation
    pub(crate) rejuvenation_steps: usize,
    /// MCMC kernel used for rejuvenation
    pub(crate) sampler: S,
    /// Random generator seed
    pub(crate) seed: Option<u64>,
}

impl<F: Float, M: GpSurrogate<F>, S: McmcKernel<F>> SmcValidParams<F, M, S> {
    /// Get template model
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Get hyperparameters priors
    pub fn priors(&self) -> &Priors<F> {
        &self.priors
    }

    /// Get number of particles
    pub fn n_particles(&self) -> usize {
        self.n_particles
    }

    /// Whether resampling is enabled
    pub fn resample(&self) -> bool {
        self.resample
    }

    /// Get number of rejuvenation steps
    pub fn rejuvenation_steps(&self) -> usize {
        self.rejuvenation_steps
    }

    /// Get MCMC kernel
    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    /// Get seed
    pub fn seed(&self) -> Option<&u64> {
        self.seed.as_ref()
    }
}

#[derive(Clone, Debug)]
/// The set of parameters that can be specified for the execution of
/// the [SMC meta model](struct.Smc.html).
pub struct SmcParams<F: Float, M: GpSurrogate<F>, S: McmcKernel<F> = SliceSampler>(
    SmcValidParams<F, M, S>,
);

impl<F: Float, M: GpSurrogate<F>> SmcParams<F, M, SliceSampler> {
    /// A constructor for SMC parameters given the template model and hyperparameters priors
    pub fn new(model: M, priors: Priors<F>) -> Self {
        Self(SmcValidParams {
            model,
            priors,
            n_particles: SMC_N_PARTICLES,
            resample: true,
            rejuvenation_steps: SMC_REJUVENATION_STEPS,
            sampler: SliceSampler::default(),
            seed: None,
        })
    }
}

impl<F: Float, M: GpSurrogate<F>, S: McmcKernel<F>> SmcParams<F, M, S> {
    /// A constructor for SMC parameters from validated parameters
    pub fn new_from_valid(params: &SmcValidParams<F, M, S>) -> Self {
        Self(params.clone())
    }

    /// Set the number of particles
    pub fn n_particles(mut self, n_particles: usize) -> Self {
        self.0.n_particles = n_particles;
        self
    }

    /// Enable or disable resampling of degenerated particles
    pub fn resample(mut self, resample: bool) -> Self {
        self.0.resample = resample;
        self
    }

    /// Set the number of MCMC steps per particle after each observation, 0 disables rejuvenation
    pub fn rejuvenation_steps(mut self, steps: usize) -> Self {
        self.0.rejuvenation_steps = steps;
        self
    }

    /// Set the random generator seed
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.0.seed = seed;
        self
    }

    /// Set the MCMC kernel used for rejuvenation
    pub fn sampler<S2: McmcKernel<F>>(self, sampler: S2) -> SmcParams<F, M, S2> {
        SmcParams(SmcValidParams {
            model: self.0.model,
            priors: self.0.priors,
            n_particles: self.0.n_particles,
            resample: self.0.resample,
            rejuvenation_steps: self.0.rejuvenation_steps,
            sampler,
            seed: self.0.seed,
        })
    }
}

impl<F: Float, M: GpSurrogate<F>, S: McmcKernel<F>> From<SmcValidParams<F, M, S>>
    for SmcParams<F, M, S>
{
    fn from(valid: SmcValidParams<F, M, S>) -> Self {
        SmcParams(valid)
    }
}

impl<F: Float, M: GpSurrogate<F>, S: McmcKernel<F>> ParamGuard for SmcParams<F, M, S> {
    type Checked = SmcValidParams<F, M, S>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if self.0.n_particles == 0 {
            return Err(GpError::InvalidValueError(
                "SMC requires at least one particle".to_string(),
            ));
        }
        self.0.priors.check(&self.0.model.params())?;
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
