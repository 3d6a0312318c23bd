//! Deployment error taxonomy

use thiserror::Error;

/// Errors that end a deployment run
///
/// Verification problems are reported through the health report and only
/// surface here as [`DeployError::Unhealthy`] once the report has printed.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Required tools that are missing and could not be installed
    #[error("missing required tools: {}", missing.join(", "))]
    Precondition { missing: Vec<String> },

    /// A resource did not reach its desired state
    #[error("could not reconcile {resource}: {message}")]
    Reconcile { resource: String, message: String },

    /// An install, build or service step failed
    #[error("{step} failed: {message}")]
    Step { step: String, message: String },

    /// A migration failed with something other than "already applied"
    #[error("migration {file} failed: {message}")]
    Migration { file: String, message: String },

    /// The frontend build did not produce its entry artifact
    #[error("build artifact missing: {path}")]
    MissingArtifact { path: String },

    /// The operator declined the confirmation prompt
    #[error("aborted by operator")]
    Aborted,

    /// Verification finished with unhealthy layers
    #[error("unhealthy layers: {}", layers.join(", "))]
    Unhealthy { layers: Vec<String> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeployError {
    pub fn step(step: &str, err: impl std::fmt::Display) -> Self {
        Self::Step {
            step: step.to_string(),
            message: err.to_string(),
        }
    }

    /// Short category label used in the final report
    pub fn category(&self) -> &'static str {
        match self {
            Self::Precondition { .. } => "precondition",
            Self::Reconcile { .. } => "reconciliation",
            Self::Step { .. } => "execution",
            Self::Migration { .. } => "migration",
            Self::MissingArtifact { .. } => "build",
            Self::Aborted => "aborted",
            Self::Unhealthy { .. } => "verification",
            Self::Other(_) => "error",
        }
    }
}
