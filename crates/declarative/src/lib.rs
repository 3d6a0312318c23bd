//! # Declarative
//!
//! A framework for declarative resource reconciliation.
//!
//! This crate provides the core abstractions for declaring desired state,
//! detecting current state, and converging a host to match it one resource
//! at a time.
//!
//! ## Core Concepts
//!
//! - **Resource**: Something with state that can be probed and applied
//!   (a database, a role, an environment file, a vhost, a supervised process)
//! - **ResourceState**: The current or desired state of a resource
//! - **ExecutionPlan**: An explicit, dependency-checked ordering of resources
//! - **Executor**: Reconciles the plan sequentially and stops at the first failure
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{ExecutionPlan, execute_simple};
//!
//! let mut plan = ExecutionPlan::new();
//! plan.push(Box::new(database));
//! plan.push(Box::new(role));
//! plan.push(Box::new(grant)); // requires database and role
//!
//! let report = execute_simple(&plan)?;
//! if let Some(failed) = report.failure() {
//!     eprintln!("{} failed", failed.id);
//! }
//! ```
//!
//! ## Provider Traits
//!
//! - [`ProgressCallback`]: Receives progress updates
//! - [`ConfirmCallback`]: Handles user confirmations
//!
//! This allows the crate to be used without hard dependencies on
//! specific UI frameworks.

pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod planner;
pub mod resource;
pub mod types;

// Re-export main types at crate root
pub use context::{
    status_symbol, ApplyContext, AutoConfirm, AutoDecline, ConfirmCallback, NoProgress,
    ProgressCallback,
};
pub use diff::{compute_diffs, DiffSummary, ResourceDiff};
pub use error::PlanError;
pub use executor::{execute, execute_simple, reconcile};
pub use planner::ExecutionPlan;
pub use resource::{BoxedResource, Resource};
pub use types::{
    CommandOutput, ExecuteOptions, ExecuteSummary, ReconcileOutcome, ReconcileReport,
    ResourceKind, ResourceOutcome, ResourceState, ResourceStatus,
};
