//! Diff computation for resources

use crate::resource::Resource;
use crate::types::{ResourceKind, ResourceState};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A diff between current and desired state of a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDiff {
    /// Unique identifier of the resource
    pub resource_id: String,
    /// Kind of the resource
    pub kind: ResourceKind,
    /// Human-readable description
    pub description: String,
    /// Current state
    pub current: ResourceState,
    /// Desired state
    pub desired: ResourceState,
}

impl ResourceDiff {
    /// Create a diff from a resource, returning None if no changes needed
    pub fn from_resource(resource: &dyn Resource) -> Result<Option<Self>> {
        let current = resource.current_state()?;
        let desired = resource.desired_state();

        if current == desired {
            return Ok(None);
        }

        Ok(Some(Self {
            resource_id: resource.id(),
            kind: resource.kind(),
            description: resource.description(),
            current,
            desired,
        }))
    }

    /// Check if this diff represents an addition
    pub fn is_addition(&self) -> bool {
        matches!(
            (&self.current, &self.desired),
            (ResourceState::Absent, ResourceState::Present { .. })
        )
    }
}

/// Compute diffs for a list of resources
///
/// Resources whose probe fails are reported with an `Unknown` current state
/// rather than dropped, so the plan never hides a resource it cannot read.
pub fn compute_diffs<'a, I>(resources: I) -> Vec<ResourceDiff>
where
    I: IntoIterator<Item = &'a dyn Resource>,
{
    resources
        .into_iter()
        .filter_map(|r| match ResourceDiff::from_resource(r) {
            Ok(diff) => diff,
            Err(_) => Some(ResourceDiff {
                resource_id: r.id(),
                kind: r.kind(),
                description: r.description(),
                current: ResourceState::Unknown,
                desired: r.desired_state(),
            }),
        })
        .collect()
}

/// Diff summary statistics
#[derive(Debug, Clone, Default)]
pub struct DiffSummary {
    /// Number of resources to create
    pub additions: usize,
    /// Number of resources to modify
    pub modifications: usize,
}

impl DiffSummary {
    /// Create a summary from a list of diffs
    pub fn from_diffs(diffs: &[ResourceDiff]) -> Self {
        let mut summary = Self::default();
        for diff in diffs {
            if diff.is_addition() {
                summary.additions += 1;
            } else {
                summary.modifications += 1;
            }
        }
        summary
    }

    /// Total number of changes
    pub fn total(&self) -> usize {
        self.additions + self.modifications
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}
