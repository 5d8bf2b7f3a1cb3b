//! Engage simulator
//!
//! Seeded, concurrent end-to-end runs of the engagement engine with
//! invariant checking, used by the `engage-sim` binary.

#![allow(missing_docs)]

pub mod simulator;

pub use simulator::{
    run_simulator, run_stress, InvariantCheck, SimulationStats, SimulatorConfig, SimulatorReport,
    StressReport, Violation,
};
