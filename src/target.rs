use crate::error::MemLoadError;
use crate::units::fraction_to_percent;

/// What a run is trying to achieve. Fixed for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetState {
    desired_fraction: f64,
    desired_available_bytes: usize,
    never_release: bool,
    readjust: bool,
}

impl TargetState {
    /// `percent` must be in (0, 99].
    pub fn new(percent: f64, total_physical_bytes: usize, never_release: bool, readjust: bool) -> Result<Self, MemLoadError> {
        if !(percent.is_finite() && 0.0 < percent && percent <= 99.0) {
            return Err(MemLoadError::InvalidPercent(percent));
        }
        let desired_fraction = percent / 100.0;
        let desired_available_bytes = ((1.0 - desired_fraction) * total_physical_bytes as f64).round() as usize;
        Ok(Self { desired_fraction, desired_available_bytes, never_release, readjust })
    }

    pub fn desired_fraction(&self) -> f64 {
        self.desired_fraction
    }

    pub fn desired_percent(&self) -> f64 {
        fraction_to_percent(self.desired_fraction)
    }

    pub fn desired_available_bytes(&self) -> usize {
        self.desired_available_bytes
    }

    /// If set, the process only ever grows its footprint.
    pub fn never_release(&self) -> bool {
        self.never_release
    }

    /// If unset, the steady state stops adjusting once startup has converged.
    pub fn readjust(&self) -> bool {
        self.readjust
    }
}
