//! Startup convergence followed by holding the load forever.

use std::convert::Infallible;
use std::thread;

use tracing::{debug, info, warn};

use crate::controller::{AdjustmentOutcome, Controller};
use crate::error::MemLoadError;
use crate::reservation::Backing;
use crate::telemetry::MemoryStatus;

// NOTE: the test driver blocks until exactly one of these lines shows up on stderr.
pub const CONVERGED_LINE: &str = "make_memory_load finished starting up";
pub const TOLERATED_LABEL: &str = "threshold memory achieved";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    Converging { attempt: u32 },
    Converged,
    ToleratedWithinBound { achieved_percent: f64 },
    Steady,
}

/// How startup ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StartupState {
    Converged,
    Tolerated { achieved_percent: f64 },
}

impl StartupState {
    /// The line to print on stderr for the test driver.
    pub fn signal_line(&self) -> String {
        match self {
            StartupState::Converged => CONVERGED_LINE.to_string(),
            StartupState::Tolerated { achieved_percent } => format!("{TOLERATED_LABEL},{achieved_percent}"),
        }
    }
}

#[derive(Debug)]
pub struct Maintainer<T: MemoryStatus, B: Backing> {
    controller: Controller<T, B>,
    phase: Phase,
}

impl<T: MemoryStatus, B: Backing> Maintainer<T, B> {
    pub fn new(controller: Controller<T, B>) -> Self {
        Self { controller, phase: Phase::Converging { attempt: 0 } }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn controller(&self) -> &Controller<T, B> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut Controller<T, B> {
        &mut self.controller
    }

    /// Run the bounded startup attempts. The first pass may take a while since it writes to
    /// every page it commits.
    pub fn converge(&mut self) -> Result<StartupState, MemLoadError> {
        let max_attempts = self.controller.config().max_attempts;
        let mut last_outcome = AdjustmentOutcome::NoAdjustmentNeeded;

        for attempt in 1..=max_attempts {
            self.phase = Phase::Converging { attempt };
            let iteration = self.controller.iterate(attempt == max_attempts)?;
            last_outcome = iteration.outcome;
            debug!(attempt, outcome = %last_outcome, load = iteration.achieved_percent(), "startup attempt");

            match iteration.outcome {
                AdjustmentOutcome::NoAdjustmentNeeded => {
                    self.phase = Phase::Converged;
                    return Ok(StartupState::Converged);
                }
                AdjustmentOutcome::WithinTolerance => {
                    let achieved_percent = iteration.achieved_percent();
                    self.phase = Phase::ToleratedWithinBound { achieved_percent };
                    return Ok(StartupState::Tolerated { achieved_percent });
                }
                AdjustmentOutcome::Grew | AdjustmentOutcome::Shrank | AdjustmentOutcome::NothingToShrink => {}
            }
        }

        Err(MemLoadError::ConvergenceFailed {
            desired_percent: self.controller.target().desired_percent(),
            attempts: max_attempts,
            last_outcome,
        })
    }

    /// One steady-state tick, without the sleep. Returns `None` when re-adjustment is turned
    /// off, in which case nothing is read or changed.
    pub fn steady_step(&mut self) -> Result<Option<AdjustmentOutcome>, MemLoadError> {
        self.phase = Phase::Steady;
        if !self.controller.target().readjust() {
            return Ok(None);
        }
        let iteration = self.controller.iterate(false)?;
        if iteration.outcome != AdjustmentOutcome::NoAdjustmentNeeded {
            debug!(outcome = %iteration.outcome, load = iteration.achieved_percent(), "steady-state adjustment");
        }
        if iteration.outcome == AdjustmentOutcome::NothingToShrink {
            warn!(load = iteration.achieved_percent(), "load is above target but nothing is left to release");
        }
        Ok(Some(iteration.outcome))
    }

    /// Hold the load until the process is killed. Only a platform failure gets us out of here.
    pub fn hold(mut self) -> Result<Infallible, MemLoadError> {
        let poll_interval = self.controller.config().poll_interval;
        if !self.controller.target().readjust() {
            info!("re-adjustment disabled, holding the current footprint");
        }
        loop {
            thread::sleep(poll_interval);
            self.steady_step()?;
        }
    }
}
