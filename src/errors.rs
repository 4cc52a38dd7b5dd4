use thiserror::Error;

/// A result type for GP regression algorithms
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when using [`GaussianProcess`](crate::GaussianProcess), [`SparseGaussianProcess`](crate::SparseGaussianProcess)
/// or one of the meta models built on top of them
#[derive(Error, Debug)]
pub enum GpError {
    /// When inference requires a Gaussian observation model
    #[error("Unsupported likelihood: {0} (exact inference requires a Gaussian likelihood)")]
    UnsupportedLikelihood(String),
    /// When linear algebra computation fails (ie matrix not positive definite)
    #[error("Numerical instability: {0}")]
    NumericalInstability(#[from] linfa_linalg::LinalgError),
    /// When input points do not match the model dimension
    #[error("Dimension error: expected {expected} columns, got {actual}")]
    DimensionError {
        /// model input dimension
        expected: usize,
        /// given input dimension
        actual: usize,
    },
    /// When inputs and targets do not have the same number of rows
    #[error("Length mismatch: {0} points vs {1} targets")]
    LengthMismatch(usize, usize),
    /// When a query hits a cache left invalidated by a failed update
    #[error("Invalid cache: hyperparameters changed without a successful refresh")]
    InvalidCache,
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When error during saving
    #[cfg(feature = "persistent")]
    #[error("Save error: {0}")]
    SaveError(#[from] serde_json::Error),
    /// When error during loading
    #[error("Load IO error")]
    LoadIoError(#[from] std::io::Error),
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}
