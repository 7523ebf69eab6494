use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("No energy meter available: {0}")]
    Unavailable(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Acquisition failure: {0}")]
    AcquisitionFailure(String),
    #[error("Invalid meter state: {0}")]
    InvalidState(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A single poll iteration that produced no reading.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Sample lost: {0}")]
pub struct SampleLoss(pub String);
