//! Execution engine for stackup
//!
//! The engine orchestrates:
//! 1. Planning - Build the dependency-ordered resource list from config and mode
//! 2. Diffing - Preview current vs desired state for `--dry-run`
//! 3. Executing - Install, migrate, build, place, (re)start and reload

pub mod differ;
pub mod executor;
pub mod planner;

pub use executor::{ExecutionOutcome, execute};
pub use planner::Plan;
