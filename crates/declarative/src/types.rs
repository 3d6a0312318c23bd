//! Core types for declarative resource management

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Output;

/// Category of a managed resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// OS or runtime package
    Package,
    /// Database inside the database server
    Database,
    /// Database login role
    Role,
    /// Privileges of a role on a database
    Grant,
    /// Client authentication rule (e.g. a pg_hba.conf line)
    AuthRule,
    /// Environment file consumed by the backend
    EnvFile,
    /// Reverse-proxy virtual host
    Vhost,
    /// Process-supervisor entry
    Process,
}

impl ResourceKind {
    /// Short label used in diffs and reports
    pub fn label(&self) -> &'static str {
        match self {
            Self::Package => "package",
            Self::Database => "database",
            Self::Role => "role",
            Self::Grant => "grant",
            Self::AuthRule => "auth-rule",
            Self::EnvFile => "env-file",
            Self::Vhost => "vhost",
            Self::Process => "process",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Current or desired state of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    /// Resource exists/is configured
    Present { details: Option<String> },
    /// Resource does not exist/is not configured
    Absent,
    /// Resource exists but differs from desired
    Modified { from: String, to: String },
    /// State cannot be determined
    Unknown,
}

impl ResourceState {
    /// Check if state represents presence
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present { .. })
    }

    /// Check if state represents absence
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Result of reconciling one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileOutcome {
    /// Already in the desired state; nothing was applied
    Unchanged,
    /// Resource did not exist and was created
    Created,
    /// Resource existed and was brought to the desired state
    Updated,
}

impl ReconcileOutcome {
    /// Check if the outcome represents a change
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unchanged => "unchanged",
            Self::Created => "created",
            Self::Updated => "updated",
        })
    }
}

/// Status recorded for a processed resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    /// Reconciliation completed
    Done(ReconcileOutcome),
    /// Reconciliation failed; later resources were not attempted
    Failed { error: String },
}

impl ResourceStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Outcome of one resource within a run, in processing order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOutcome {
    pub id: String,
    pub kind: ResourceKind,
    pub description: String,
    pub status: ResourceStatus,
}

/// Ordered per-resource results of a reconciliation pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Outcomes of every resource processed, up to and including a failure
    pub outcomes: Vec<ResourceOutcome>,
}

impl ReconcileReport {
    /// The failed resource, if the pass stopped early
    pub fn failure(&self) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.status.is_failed())
    }

    /// Check if every processed resource reconciled
    pub fn is_success(&self) -> bool {
        self.failure().is_none()
    }

    /// Tally outcomes by type
    pub fn summary(&self) -> ExecuteSummary {
        let mut summary = ExecuteSummary::default();
        for outcome in &self.outcomes {
            summary.add_status(&outcome.status);
        }
        summary
    }
}

/// Summary of execution results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated
    }

    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Total number of resources processed
    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged + self.failed
    }

    /// Add a status to the summary
    pub fn add_status(&mut self, status: &ResourceStatus) {
        match status {
            ResourceStatus::Done(ReconcileOutcome::Unchanged) => self.unchanged += 1,
            ResourceStatus::Done(ReconcileOutcome::Created) => self.created += 1,
            ResourceStatus::Done(ReconcileOutcome::Updated) => self.updated += 1,
            ResourceStatus::Failed { .. } => self.failed += 1,
        }
    }
}

/// Options for execution
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Don't make changes, just compute what would happen
    pub dry_run: bool,
    /// Verbose output
    pub verbose: bool,
}

/// Output from an external command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub success: bool,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            success: output.status.success(),
        }
    }
}

impl CommandOutput {
    /// Get stdout as a string
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as a string
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// stdout followed by stderr, for tools that print versions on either
    pub fn combined(&self) -> String {
        let mut out = self.stdout_str();
        out.push_str(&self.stderr_str());
        out
    }
}
