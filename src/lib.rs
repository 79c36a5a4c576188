//! Synthetic memory pressure for performance tests.
//!
//! `make_memory_load` drives system-wide memory utilization to a target percentage and holds it
//! there so that other processes (say, a garbage collector under test) see a controlled,
//! reproducible scarcity of memory. It works by committing, reusing, and releasing parts of one
//! big address reservation, re-reading the system's available memory before every decision.
//!
//! Data flow: telemetry -> controller (decide) -> reservation (apply) -> telemetry (next read).
//! Everything happens on one thread.

pub mod controller;
pub mod error;
pub mod maintainer;
pub mod plat;
pub mod reservation;
pub mod target;
pub mod telemetry;
pub mod topology;
pub mod units;

#[cfg(target_os = "linux")]
pub mod job;

pub use controller::{AdjustmentOutcome, ControlConfig, Controller, Iteration};
pub use error::MemLoadError;
pub use maintainer::{Maintainer, Phase, StartupState};
pub use plat::PlatFailed;
pub use reservation::{Backing, Reservation};
pub use target::TargetState;
pub use telemetry::{Memory, MemoryStatus, ProcMeminfo};
