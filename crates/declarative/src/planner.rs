//! Execution planner - builds dependency-ordered resource plans

use crate::error::PlanError;
use crate::resource::{BoxedResource, Resource};
use crate::types::ResourceKind;
use std::collections::HashSet;
use std::fmt;

/// An explicit, ordered list of resources to reconcile
///
/// Resources are declared in the order the caller intends to reconcile them.
/// [`ExecutionPlan::ordered`] checks that order against each resource's
/// [`Resource::requires`] and moves a resource after its dependencies when
/// it was declared too early, keeping declaration order otherwise.
#[derive(Default)]
pub struct ExecutionPlan {
    /// Resources in declaration order
    pub resources: Vec<BoxedResource>,
}

impl fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.resources.iter().map(|r| r.id()))
            .finish()
    }
}

impl ExecutionPlan {
    /// Create a new empty plan
    pub fn new() -> Self {
        Self {
            resources: Vec::new(),
        }
    }

    /// Append a resource
    pub fn push(&mut self, resource: BoxedResource) {
        self.resources.push(resource);
    }

    /// Keep only resources matching a predicate
    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&dyn Resource) -> bool,
    {
        Self {
            resources: self
                .resources
                .into_iter()
                .filter(|r| predicate(r.as_ref()))
                .collect(),
        }
    }

    /// Keep only resources of the given kinds
    pub fn filter_kinds(self, kinds: &[ResourceKind]) -> Self {
        self.filter(|r| kinds.contains(&r.kind()))
    }

    /// Total number of resources in the plan
    pub fn total_resources(&self) -> usize {
        self.resources.len()
    }

    /// Check if plan is empty
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resolve the reconciliation order
    ///
    /// Stable: a resource only moves when one of its dependencies was
    /// declared after it. Unknown dependencies, duplicate ids and cycles
    /// are rejected.
    pub fn ordered(&self) -> Result<Vec<&dyn Resource>, PlanError> {
        let ids: Vec<String> = self.resources.iter().map(|r| r.id()).collect();

        let mut seen = HashSet::new();
        for id in &ids {
            if !seen.insert(id.as_str()) {
                return Err(PlanError::DuplicateId(id.clone()));
            }
        }

        let deps: Vec<Vec<String>> = self.resources.iter().map(|r| r.requires()).collect();
        for (i, resource_deps) in deps.iter().enumerate() {
            for dep in resource_deps {
                if !seen.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        resource: ids[i].clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut emitted: HashSet<&str> = HashSet::new();
        let mut placed = vec![false; ids.len()];
        let mut order: Vec<&dyn Resource> = Vec::with_capacity(ids.len());

        while order.len() < ids.len() {
            let next = (0..ids.len()).find(|&i| {
                !placed[i] && deps[i].iter().all(|d| emitted.contains(d.as_str()))
            });

            match next {
                Some(i) => {
                    placed[i] = true;
                    emitted.insert(ids[i].as_str());
                    order.push(self.resources[i].as_ref());
                }
                None => {
                    let stuck = (0..ids.len())
                        .filter(|&i| !placed[i])
                        .map(|i| ids[i].clone())
                        .collect();
                    return Err(PlanError::Cycle(stuck));
                }
            }
        }

        Ok(order)
    }
}
