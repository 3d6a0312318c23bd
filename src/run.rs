//! Deployment run context
//!
//! A [`DeploymentRun`] is built once from the CLI flags and handed by
//! reference through every stage. It owns the snapshot, per-resource
//! outcomes, the execution record and the health report of one run.

use chrono::{DateTime, Local};
use declarative::ReconcileReport;
use std::fmt;

use crate::engine::executor::ExecutionOutcome;
use crate::error::DeployError;
use crate::health::HealthReport;
use crate::snapshot::Snapshot;

/// Which procedure the run follows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// First-time or repeated provisioning of the whole stack
    Deploy,
    /// Pull the latest revision, rebuild and restart
    Update,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deploy => "deploy",
            Self::Update => "update",
        })
    }
}

/// Operator-selected flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mode {
    pub skip_backup: bool,
    pub skip_proxy: bool,
    pub fresh: bool,
    pub backend_only: bool,
    pub frontend_only: bool,
    pub assume_yes: bool,
    pub dry_run: bool,
}

impl Mode {
    /// Backend component selected
    pub fn backend(&self) -> bool {
        !self.frontend_only
    }

    /// Frontend component selected
    pub fn frontend(&self) -> bool {
        !self.backend_only
    }

    /// Reverse-proxy configuration selected
    pub fn proxy(&self) -> bool {
        !self.skip_proxy
    }

    /// Comma-separated active flags for the report
    pub fn describe(&self) -> String {
        let flags: Vec<&str> = [
            (self.skip_backup, "skip-backup"),
            (self.skip_proxy, "skip-proxy"),
            (self.fresh, "fresh"),
            (self.backend_only, "backend-only"),
            (self.frontend_only, "frontend-only"),
            (self.dry_run, "dry-run"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect();

        if flags.is_empty() {
            "default".to_string()
        } else {
            flags.join(", ")
        }
    }
}

/// One deployment run, from flag parsing to the final report
#[derive(Debug)]
pub struct DeploymentRun {
    pub flow: Flow,
    pub mode: Mode,
    pub started_at: DateTime<Local>,
    /// Hostname interpolated into the vhost and CORS origin
    pub public_host: String,
    pub snapshot: Option<Snapshot>,
    pub resources: ReconcileReport,
    /// Follow-up actions requested by reconciled resources
    pub post_actions: Vec<String>,
    pub execution: ExecutionOutcome,
    pub health: Option<HealthReport>,
    pub failure: Option<DeployError>,
}

impl DeploymentRun {
    pub fn new(flow: Flow, mode: Mode) -> Self {
        Self {
            flow,
            mode,
            started_at: Local::now(),
            public_host: "_".to_string(),
            snapshot: None,
            resources: ReconcileReport::default(),
            post_actions: Vec::new(),
            execution: ExecutionOutcome::default(),
            health: None,
            failure: None,
        }
    }

    /// Whether the run finished without a fatal error and with a healthy report
    pub fn succeeded(&self) -> bool {
        self.failure.is_none() && self.health.as_ref().is_none_or(|h| h.overall)
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Local::now() - self.started_at
    }
}
