use thiserror::Error;

use crate::controller::AdjustmentOutcome;
use crate::plat::PlatFailed;

// These messages end up on stderr next to the machine-parsed startup line, which is the only
// stderr line allowed to contain a comma.
#[derive(Debug, Error)]
pub enum MemLoadError {
    #[error("percent must be > 0 and <= 99 (got {0})")]
    InvalidPercent(f64),

    // Exits with its own status rather than aborting, so the mapping is still released.
    #[error(transparent)]
    Platform(#[from] PlatFailed),

    #[error("failed to get memory to the desired load of {desired_percent}% after {attempts} attempts (last outcome: {last_outcome})")]
    ConvergenceFailed {
        desired_percent: f64,
        attempts: u32,
        last_outcome: AdjustmentOutcome,
    },
}

impl MemLoadError {
    pub fn exit_code(&self) -> i32 {
        match self {
            MemLoadError::ConvergenceFailed { .. } => 1,
            MemLoadError::InvalidPercent(_) => 2,
            MemLoadError::Platform(_) => 3,
        }
    }
}
