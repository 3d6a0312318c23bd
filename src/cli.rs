use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::paths::ENV_CONFIG;
use crate::run::Mode;

#[derive(Parser)]
#[command(name = "stackup")]
#[command(version)]
#[command(about = "Provision and update a single-host web stack (nginx, Node/PM2, PostgreSQL)", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ./stackup.toml, then /etc/stackup/stackup.toml)
    #[arg(short, long, global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Provision the whole stack: packages, database, env, build, processes, proxy
    Deploy(RunArgs),

    /// Pull the latest revision, rebuild and restart
    Update(RunArgs),

    /// Probe every layer of a running stack
    Verify(VerifyArgs),

    /// Check tools, services and paths without changing anything
    Doctor,

    /// Manage restore points
    #[command(subcommand)]
    Snapshots(SnapshotsCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Deploy / Update
// ============================================================================

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Skip the pre-run snapshot
    #[arg(long, alias = "skip-backup")]
    pub no_backup: bool,

    /// Only the backend and database
    #[arg(long, conflicts_with = "frontend_only")]
    pub backend_only: bool,

    /// Only the frontend build and web root
    #[arg(long)]
    pub frontend_only: bool,

    /// Leave the nginx site untouched
    #[arg(long, alias = "skip-proxy")]
    pub skip_nginx: bool,

    /// Reinstall dependencies from scratch
    #[arg(long)]
    pub fresh: bool,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Show what would change and exit
    #[arg(long)]
    pub dry_run: bool,

    /// Public hostname (default: proxy.server_name, then instance metadata)
    #[arg(long)]
    pub domain: Option<String>,
}

impl RunArgs {
    pub fn mode(&self) -> Mode {
        Mode {
            skip_backup: self.no_backup,
            skip_proxy: self.skip_nginx,
            fresh: self.fresh,
            backend_only: self.backend_only,
            frontend_only: self.frontend_only,
            assume_yes: self.yes,
            dry_run: self.dry_run,
        }
    }
}

// ============================================================================
// Verify
// ============================================================================

#[derive(Args, Debug, Clone, Default)]
pub struct VerifyArgs {
    /// Only probe the database and backend
    #[arg(long, conflicts_with = "frontend_only")]
    pub backend_only: bool,

    /// Only probe the proxy and served assets
    #[arg(long)]
    pub frontend_only: bool,

    /// Skip the proxy probe
    #[arg(long, alias = "skip-proxy")]
    pub skip_nginx: bool,
}

impl VerifyArgs {
    pub fn mode(&self) -> Mode {
        Mode {
            skip_proxy: self.skip_nginx,
            backend_only: self.backend_only,
            frontend_only: self.frontend_only,
            ..Mode::default()
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Subcommand)]
pub enum SnapshotsCommand {
    /// List snapshots, newest first
    List,

    /// Show a snapshot's contents and restore steps
    Show {
        /// Snapshot id (as printed by `list`)
        id: String,
    },

    /// Delete all but the newest snapshots
    Prune {
        /// Snapshots to keep (default: snapshots.retain)
        #[arg(long)]
        retain: Option<usize>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_map_to_mode() {
        let cli = Cli::parse_from([
            "stackup",
            "deploy",
            "--skip-backup",
            "--backend-only",
            "--skip-proxy",
            "-y",
        ]);
        let Command::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        let mode = args.mode();
        assert!(mode.skip_backup && mode.backend_only && mode.skip_proxy && mode.assume_yes);
        assert!(!mode.frontend());
    }

    #[test]
    fn test_only_flags_conflict() {
        let result =
            Cli::try_parse_from(["stackup", "update", "--backend-only", "--frontend-only"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_snapshot_prune_retain() {
        let cli = Cli::parse_from(["stackup", "snapshots", "prune", "--retain", "2"]);
        assert!(matches!(
            cli.command,
            Command::Snapshots(SnapshotsCommand::Prune { retain: Some(2) })
        ));
    }
}
