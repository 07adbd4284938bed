use thiserror::Error;

/// Errors raised by the risk calibration core.
///
/// `InsufficientData` and `UnstableFit` are recoverable at the calibrator
/// boundary (it substitutes conservative defaults and continues);
/// `NotFitted` and `BadArgument` are programmer errors, raised eagerly.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("unstable fit: {0}")]
    UnstableFit(String),

    #[error("model not fitted: {0}")]
    NotFitted(String),

    #[error("bad argument: {0}")]
    BadArgument(String),
}

pub type CalibrationResult<T> = Result<T, CalibrationError>;
