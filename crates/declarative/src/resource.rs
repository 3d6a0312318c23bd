//! Resource trait for declarative state management
//!
//! A Resource represents something that can be in a certain state,
//! and can be changed to reach a desired state.

use crate::context::ApplyContext;
use crate::types::{ResourceKind, ResourceState};
use anyhow::Result;
use std::fmt;

/// Core trait for declarative resources
///
/// Every resource provides:
/// - Identity (id, description, kind)
/// - Ordering (ids of resources that must reconcile first)
/// - State detection (current vs desired)
/// - State convergence (apply)
///
/// # Example
///
/// ```ignore
/// use declarative::{ApplyContext, Resource, ResourceKind, ResourceState};
///
/// #[derive(Debug)]
/// struct EnvFile {
///     path: String,
///     content: String,
/// }
///
/// impl Resource for EnvFile {
///     fn id(&self) -> String {
///         format!("env-file:{}", self.path)
///     }
///
///     fn description(&self) -> String {
///         format!("Environment file {}", self.path)
///     }
///
///     fn kind(&self) -> ResourceKind {
///         ResourceKind::EnvFile
///     }
///
///     fn current_state(&self) -> anyhow::Result<ResourceState> {
///         match std::fs::read_to_string(&self.path) {
///             Ok(c) => Ok(ResourceState::Present { details: Some(c) }),
///             Err(_) => Ok(ResourceState::Absent),
///         }
///     }
///
///     fn desired_state(&self) -> ResourceState {
///         ResourceState::Present { details: Some(self.content.clone()) }
///     }
///
///     fn apply(&self, _ctx: &mut ApplyContext) -> anyhow::Result<()> {
///         std::fs::write(&self.path, &self.content)?;
///         Ok(())
///     }
/// }
/// ```
pub trait Resource: Send + Sync + fmt::Debug {
    /// Unique identifier for this resource
    ///
    /// Stable within a plan; other resources name it in [`Resource::requires`].
    /// Examples: "database:app", "role:app_user", "vhost:app".
    fn id(&self) -> String;

    /// Human-readable description of what this resource does
    fn description(&self) -> String;

    /// Resource kind, used for grouping and reporting
    fn kind(&self) -> ResourceKind;

    /// Ids of resources that must reconcile before this one
    fn requires(&self) -> Vec<String> {
        Vec::new()
    }

    /// Detect the current state of this resource
    fn current_state(&self) -> Result<ResourceState>;

    /// Get the desired state for this resource
    fn desired_state(&self) -> ResourceState;

    /// Check if the resource needs changes to reach desired state
    fn needs_apply(&self) -> Result<bool> {
        let current = self.current_state()?;
        let desired = self.desired_state();
        Ok(current != desired)
    }

    /// Mutate the system so the resource reaches its desired state
    ///
    /// Only called when the probe differs from the desired state. Must be
    /// safe to re-run and must not touch anything but this resource.
    fn apply(&self, ctx: &mut ApplyContext) -> Result<()>;
}

/// A boxed resource for type-erased storage
pub type BoxedResource = Box<dyn Resource>;
