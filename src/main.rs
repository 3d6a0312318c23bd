mod cli;
mod commands;
mod config;
mod discovery;
mod engine;
mod error;
mod health;
mod paths;
mod pipeline;
mod progress;
mod prober;
mod report;
mod resource;
mod run;
mod runner;
mod snapshot;
#[cfg(test)]
mod testutil;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use config::StackConfig;
use run::Flow;

/// Global context for the application
pub struct Context {
    pub quiet: bool,
    /// Explicit config file from `--config` / `STACKUP_CONFIG`
    pub config: Option<PathBuf>,
}

impl Context {
    /// Load and validate the config this invocation points at
    pub fn load_config(&self) -> Result<StackConfig> {
        let (config, path) = StackConfig::load(self.config.as_deref())?;
        match path {
            Some(path) => log::info!("Loaded config from {}", path.display()),
            None => log::info!("Using built-in config defaults"),
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        quiet: cli.quiet,
        config: cli.config,
    };

    match dispatch(&ctx, cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            ui::error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

/// Run a subcommand; `Ok(false)` means it finished but reported failure
fn dispatch(ctx: &Context, command: Command) -> Result<bool> {
    match command {
        Command::Deploy(args) => commands::deploy::run(ctx, Flow::Deploy, &args),
        Command::Update(args) => commands::deploy::run(ctx, Flow::Update, &args),
        Command::Verify(args) => commands::verify::run(ctx, &args),
        Command::Doctor => commands::doctor::run(ctx),
        Command::Snapshots(cmd) => commands::snapshots::run(ctx, cmd),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "stackup", &mut io::stdout());
            Ok(true)
        }
    }
}
