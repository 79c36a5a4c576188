//! One step of the feedback loop: look at the system, compare with the target, commit or release
//! memory to close the gap.

use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::plat::PlatFailed;
use crate::reservation::{Backing, Reservation};
use crate::target::TargetState;
use crate::telemetry::{Memory, MemoryStatus};
use crate::units::{conv, fraction_to_percent, round_to_nearest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentOutcome {
    /// Close enough to the target, or told by policy not to release.
    NoAdjustmentNeeded,
    /// Not converged, but within tolerance on the last startup attempt.
    WithinTolerance,
    Grew,
    Shrank,
    NothingToShrink,
}

impl fmt::Display for AdjustmentOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdjustmentOutcome::NoAdjustmentNeeded => "no adjustment needed",
            AdjustmentOutcome::WithinTolerance => "within acceptable tolerance",
            AdjustmentOutcome::Grew => "grew",
            AdjustmentOutcome::Shrank => "shrank",
            AdjustmentOutcome::NothingToShrink => "shrink requested but nothing available to shrink",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Below this gap (in fractions of total memory) we call it converged.
    pub epsilon: f64,
    /// On the last startup attempt, a gap below this many percent is accepted.
    pub tolerance_pct: f64,
    pub max_attempts: u32,
    /// Steady-state cadence. Polling faster only feeds measurement noise back into the loop.
    pub poll_interval: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.0001,
            tolerance_pct: 5.0,
            max_attempts: 5,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// What one iteration saw and did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Iteration {
    pub outcome: AdjustmentOutcome,
    pub observed: Memory,
}

impl Iteration {
    pub fn achieved_percent(&self) -> f64 {
        fraction_to_percent(self.observed.used_fraction())
    }
}

#[derive(Debug)]
pub struct Controller<T: MemoryStatus, B: Backing> {
    telemetry: T,
    reservation: Reservation<B>,
    target: TargetState,
    config: ControlConfig,
}

impl<T: MemoryStatus, B: Backing> Controller<T, B> {
    pub fn new(telemetry: T, reservation: Reservation<B>, target: TargetState, config: ControlConfig) -> Self {
        Self { telemetry, reservation, target, config }
    }

    pub fn reservation(&self) -> &Reservation<B> {
        &self.reservation
    }

    pub fn target(&self) -> &TargetState {
        &self.target
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn telemetry_mut(&mut self) -> &mut T {
        &mut self.telemetry
    }

    /// Run one control iteration. `last_attempt` enables the tolerance check, which only the
    /// final bounded startup attempt may use.
    pub fn iterate(&mut self, last_attempt: bool) -> Result<Iteration, PlatFailed> {
        let observed = self.telemetry.read()?;
        let outcome = self.decide_and_apply(observed, last_attempt)?;
        Ok(Iteration { outcome, observed })
    }

    fn decide_and_apply(&mut self, observed: Memory, last_attempt: bool) -> Result<AdjustmentOutcome, PlatFailed> {
        let current_used_fraction = observed.used_fraction();
        let delta = (self.target.desired_fraction() - current_used_fraction).abs();

        if delta < self.config.epsilon {
            return Ok(AdjustmentOutcome::NoAdjustmentNeeded);
        }

        let gap = observed.available_bytes as isize - self.target.desired_available_bytes() as isize;
        let to_allocate = round_to_nearest(gap, self.reservation.granularity());

        debug!(
            available = %conv(observed.available_bytes),
            desired = %conv(self.target.desired_available_bytes()),
            to_allocate,
            "memory gap"
        );

        if last_attempt && to_allocate != 0 && delta * 100.0 < self.config.tolerance_pct {
            return Ok(AdjustmentOutcome::WithinTolerance);
        }

        if to_allocate > 0 {
            let n = to_allocate as usize;
            if self.reservation.reset_bytes() != 0 {
                let grown = self.reservation.grow_from_discardable(n);
                debug!(requested = %conv(n), grown = %conv(grown), "unreset memory");
            } else {
                let grown = self.reservation.grow_fresh(n)?;
                debug!(requested = %conv(n), grown = %conv(grown), "committed more memory");
            }
            Ok(AdjustmentOutcome::Grew)
        } else if to_allocate < 0 {
            if self.target.never_release() {
                return Ok(AdjustmentOutcome::NoAdjustmentNeeded);
            }
            let n = to_allocate.unsigned_abs();
            let released = self.reservation.shrink(n)?;
            debug!(requested = %conv(n), released = %conv(released), "reset memory");
            if released == 0 {
                Ok(AdjustmentOutcome::NothingToShrink)
            } else {
                Ok(AdjustmentOutcome::Shrank)
            }
        } else {
            Ok(AdjustmentOutcome::NoAdjustmentNeeded)
        }
    }
}
