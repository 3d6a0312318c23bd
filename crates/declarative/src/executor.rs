//! Execution engine - reconciles resources in dependency order, fail-fast

use crate::context::{ApplyContext, NoProgress, ProgressCallback};
use crate::error::PlanError;
use crate::planner::ExecutionPlan;
use crate::resource::Resource;
use crate::types::{
    ExecuteOptions, ReconcileOutcome, ReconcileReport, ResourceOutcome, ResourceStatus,
};
use anyhow::{Result, bail};

/// Reconcile a single resource
///
/// Probes first and returns [`ReconcileOutcome::Unchanged`] without calling
/// `apply` when the resource is already in its desired state. After applying,
/// probes again and fails if the resource still differs.
pub fn reconcile(resource: &dyn Resource, ctx: &mut ApplyContext) -> Result<ReconcileOutcome> {
    let desired = resource.desired_state();
    let current = resource.current_state()?;

    if current == desired {
        log::debug!("{} already in desired state", resource.id());
        return Ok(ReconcileOutcome::Unchanged);
    }

    log::debug!(
        "{}: {:?} -> {:?}",
        resource.id(),
        current,
        desired
    );
    resource.apply(ctx)?;

    let after = resource.current_state()?;
    if after != desired {
        bail!(
            "{} did not reach its desired state (now {:?})",
            resource.id(),
            after
        );
    }

    Ok(if current.is_absent() {
        ReconcileOutcome::Created
    } else {
        ReconcileOutcome::Updated
    })
}

/// Execute a plan
///
/// Resources run one at a time in the order returned by
/// [`ExecutionPlan::ordered`]. The first failure stops the pass; the report
/// then holds outcomes for every resource up to and including the failed
/// one and nothing after it. Nothing is rolled back.
///
/// With `opts.dry_run` the order is validated and an empty report returned.
pub fn execute<P: ProgressCallback>(
    plan: &ExecutionPlan,
    opts: &ExecuteOptions,
    ctx: &mut ApplyContext,
    progress: &mut P,
) -> Result<ReconcileReport, PlanError> {
    let ordered = plan.ordered()?;
    let mut report = ReconcileReport::default();

    if opts.dry_run || ordered.is_empty() {
        return Ok(report);
    }

    progress.on_batch_start(ordered.len());

    for resource in ordered {
        let id = resource.id();
        progress.on_resource_start(&id, &resource.description());

        let status = match reconcile(resource, ctx) {
            Ok(outcome) => ResourceStatus::Done(outcome),
            Err(e) => ResourceStatus::Failed {
                error: format!("{e:#}"),
            },
        };

        progress.on_resource_complete(&id, &status);
        let failed = status.is_failed();

        report.outcomes.push(ResourceOutcome {
            id,
            kind: resource.kind(),
            description: resource.description(),
            status,
        });

        if failed {
            break;
        }
    }

    progress.on_batch_complete();
    Ok(report)
}

/// Simple execution without callbacks
pub fn execute_simple(plan: &ExecutionPlan) -> Result<ReconcileReport, PlanError> {
    let mut ctx = ApplyContext::default();
    execute(plan, &ExecuteOptions::default(), &mut ctx, &mut NoProgress)
}
