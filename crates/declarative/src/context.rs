//! Apply context and provider traits
//!
//! These traits allow the declarative crate to be used without
//! depending on a specific terminal UI or prompt implementation.

use crate::types::{ReconcileOutcome, ResourceStatus};
use anyhow::Result;

/// Progress callback for execution operations
///
/// Implement this trait to receive progress updates during execution.
pub trait ProgressCallback {
    /// Called before the first resource is reconciled
    fn on_batch_start(&mut self, count: usize);

    /// Called when starting to reconcile a single resource
    fn on_resource_start(&mut self, id: &str, description: &str);

    /// Called when a resource reconciliation completes or fails
    fn on_resource_complete(&mut self, id: &str, status: &ResourceStatus);

    /// Called when the batch completes (also after a failure)
    fn on_batch_complete(&mut self);
}

/// Confirmation callback for user interaction
pub trait ConfirmCallback {
    /// Ask the user to confirm an action
    ///
    /// Returns `true` if the user confirmed, `false` otherwise.
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_batch_start(&mut self, _count: usize) {}
    fn on_resource_start(&mut self, _id: &str, _description: &str) {}
    fn on_resource_complete(&mut self, _id: &str, _status: &ResourceStatus) {}
    fn on_batch_complete(&mut self) {}
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Context passed to resource apply operations
#[derive(Debug, Default)]
pub struct ApplyContext {
    /// Whether to output verbose information
    pub verbose: bool,
    /// Follow-up actions requested by applied resources (e.g. "reload:nginx")
    pub post_actions: Vec<String>,
}

impl ApplyContext {
    /// Create a new apply context
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            post_actions: Vec::new(),
        }
    }

    /// Request a follow-up action once, keeping first-request order
    pub fn request(&mut self, action: impl Into<String>) {
        let action = action.into();
        if !self.post_actions.contains(&action) {
            self.post_actions.push(action);
        }
    }
}

/// Outcome label helper for callbacks that print results
pub fn status_symbol(status: &ResourceStatus) -> &'static str {
    match status {
        ResourceStatus::Done(ReconcileOutcome::Unchanged) => "○",
        ResourceStatus::Done(_) => "✓",
        ResourceStatus::Failed { .. } => "✗",
    }
}
