use anyhow::Result;

use crate::Context;
use crate::cli::RunArgs;
use crate::discovery;
use crate::pipeline::{Pipeline, PromptConfirm};
use crate::run::{DeploymentRun, Flow};
use crate::runner::{Shell, SystemRunner};
use crate::ui;

/// Run the deploy or update flow; returns whether the run succeeded
pub fn run(ctx: &Context, flow: Flow, args: &RunArgs) -> Result<bool> {
    let config = ctx.load_config()?;
    let mut run = DeploymentRun::new(flow, args.mode());
    run.public_host = discovery::public_host(
        args.domain.as_deref(),
        config.proxy.server_name.as_deref(),
    );
    log::info!("{flow} for {} on {}", config.app.name, run.public_host);

    if !ctx.quiet {
        ui::header(&format!("stackup {flow}: {}", config.app.name));
        ui::kv("Mode", &run.mode.describe());
        ui::kv("Host", &run.public_host);
    }

    Pipeline::new(
        &config,
        Shell::new(SystemRunner::new()),
        Box::new(PromptConfirm),
    )
    .run(&mut run);

    Ok(run.succeeded())
}
