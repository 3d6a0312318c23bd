//! Plan validation errors

/// Errors raised while ordering an execution plan
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// Two resources share an id
    #[error("duplicate resource id in plan: {0}")]
    DuplicateId(String),

    /// A resource requires an id that is not part of the plan
    #[error("resource {resource} requires {dependency}, which is not in the plan")]
    UnknownDependency {
        /// Resource declaring the dependency
        resource: String,
        /// Missing dependency id
        dependency: String,
    },

    /// The dependency graph has a cycle
    #[error("dependency cycle between: {}", .0.join(", "))]
    Cycle(Vec<String>),
}
