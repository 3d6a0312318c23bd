use anyhow::Result;

use crate::Context;
use crate::cli::VerifyArgs;
use crate::health::HealthVerifier;
use crate::report;
use crate::runner::{Shell, SystemRunner};
use crate::ui;

/// Probe the running stack; returns whether every probed layer is healthy
pub fn run(ctx: &Context, args: &VerifyArgs) -> Result<bool> {
    let config = ctx.load_config()?;
    let mode = args.mode();

    ui::header(&format!("stackup verify: {}", config.app.name));
    ui::kv("Mode", &mode.describe());

    let verifier = HealthVerifier::new(&config, Shell::new(SystemRunner::new()));
    let health = verifier.verify(&mode);
    report::print_health(&health);

    Ok(health.overall)
}
