//! Deployment executor
//!
//! Runs after reconciliation, strictly in this order:
//! 1. Update flow only: bring the checkout to the declared branch
//! 2. Backend: dependencies, then migrations in file-name order
//! 3. Frontend: dependencies, build, entry-artifact check, placement
//! 4. Backend process (re)start, supervisor persistence, boot hook
//! 5. Proxy validation and reload
//!
//! Every failure is fatal and returned at once. The frontend artifact is
//! checked before anything is restarted or reloaded.

use colored::Colorize;
use declarative::{ApplyContext, ReconcileOutcome, Resource};
use serde::Serialize;
use std::fs;
use std::path::Path;

use super::planner;
use crate::config::StackConfig;
use crate::error::DeployError;
use crate::progress;
use crate::run::{DeploymentRun, Flow};
use crate::runner::{Cmd, Shell, stderr_tail};
use crate::snapshot::copy_tree;

/// SQLSTATEs meaning a migration's objects are already there
///
/// duplicate_table, duplicate_object, duplicate_column, duplicate_schema,
/// duplicate_function
const DUPLICATE_STATES: &[&str] = &["42P07", "42710", "42701", "42P06", "42723"];

/// One completed executor step
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStatus {
    Applied,
    AlreadyApplied,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationRecord {
    pub file: String,
    pub status: MigrationStatus,
}

/// What the executor did, filled in as it goes
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionOutcome {
    pub steps: Vec<StepRecord>,
    pub migrations: Vec<MigrationRecord>,
    /// Reconcile outcome of the backend process
    pub process: Option<ReconcileOutcome>,
    /// Checked-out revision after an update pull
    pub revision: Option<String>,
}

impl ExecutionOutcome {
    fn record(&mut self, name: &str, detail: impl Into<String>) {
        let detail = detail.into();
        println!("  {} {} {}", "✓".green(), name, detail.dimmed());
        self.steps.push(StepRecord {
            name: name.to_string(),
            detail,
        });
    }
}

/// Run the executor for a reconciled run
pub fn execute(
    config: &StackConfig,
    shell: &Shell,
    run: &mut DeploymentRun,
) -> Result<(), DeployError> {
    let flow = run.flow;
    let mode = run.mode.clone();
    let exec = Executor { config, shell };
    let outcome = &mut run.execution;

    if flow == Flow::Update {
        exec.pull(outcome)?;
    }

    if mode.backend() {
        exec.install_backend(mode.fresh, outcome)?;
        exec.migrate(outcome)?;
    }

    if mode.frontend() {
        exec.build_frontend(mode.fresh, outcome)?;
        exec.place_frontend(outcome)?;
    }

    if mode.backend() {
        exec.start_backend(outcome)?;
        exec.persist_supervisor(outcome)?;
    }

    if mode.proxy() {
        exec.reload_proxy(outcome)?;
    }

    Ok(())
}

struct Executor<'a> {
    config: &'a StackConfig,
    shell: &'a Shell,
}

impl Executor<'_> {
    fn user(&self) -> &str {
        &self.config.app.service_user
    }

    /// Run a command under a spinner, mapping failure to a step error
    fn checked(&self, step: &str, cmd: &Cmd) -> Result<String, DeployError> {
        let pb = progress::spinner(&format!("{step}..."));
        match self.shell.run_checked(cmd) {
            Ok(out) => {
                pb.finish_and_clear();
                Ok(out)
            }
            Err(e) => {
                progress::finish_error(&pb, &format!("{step} failed"));
                Err(DeployError::step(step, format!("{e:#}")))
            }
        }
    }

    fn git(&self) -> Cmd {
        Cmd::new("git")
            .as_user(self.user())
            .current_dir(self.config.app.root_path())
    }

    /// Fetch the declared branch; hard reset a clean tree, fast-forward a dirty one
    fn pull(&self, outcome: &mut ExecutionOutcome) -> Result<(), DeployError> {
        let app = &self.config.app;
        self.checked(
            "git fetch",
            &self.git().args(["fetch", &app.remote, &app.branch]),
        )?;

        let status = self.checked(
            "git status",
            &self.git().args(["status", "--porcelain", "--untracked-files=no"]),
        )?;
        let upstream = format!("{}/{}", app.remote, app.branch);
        if status.is_empty() {
            self.checked("git reset", &self.git().args(["reset", "--hard", &upstream]))?;
        } else {
            log::warn!("Working tree has local changes; fast-forwarding only");
            self.checked(
                "git pull",
                &self.git().args(["pull", "--ff-only", &app.remote, &app.branch]),
            )?;
        }

        let revision = self.checked(
            "git rev-parse",
            &self.git().args(["rev-parse", "--short", "HEAD"]),
        )?;
        outcome.record("source", format!("{upstream} at {revision}"));
        outcome.revision = Some(revision);
        Ok(())
    }

    fn remove_node_modules(&self, dir: &Path) -> Result<(), DeployError> {
        let modules = dir.join("node_modules");
        if modules.exists() {
            log::info!("Removing {}", modules.display());
            fs::remove_dir_all(&modules)
                .map_err(|e| DeployError::step("clean install", format!("{}: {e}", modules.display())))?;
        }
        Ok(())
    }

    /// `npm ci` when a lockfile exists, `npm install` otherwise
    fn npm_install(&self, dir: &Path, production: bool) -> Cmd {
        let verb = if dir.join("package-lock.json").exists() {
            "ci"
        } else {
            "install"
        };
        let cmd = Cmd::new("npm")
            .arg(verb)
            .as_user(self.user())
            .current_dir(dir);
        if production { cmd.arg("--omit=dev") } else { cmd }
    }

    fn install_backend(&self, fresh: bool, outcome: &mut ExecutionOutcome) -> Result<(), DeployError> {
        let dir = self.config.app.backend_path();
        if fresh {
            self.remove_node_modules(&dir)?;
        }
        self.checked("backend dependency install", &self.npm_install(&dir, true))?;
        outcome.record("backend dependencies", dir.display().to_string());
        Ok(())
    }

    /// Apply `*.sql` files in lexicographic order
    fn migrate(&self, outcome: &mut ExecutionOutcome) -> Result<(), DeployError> {
        let dir = self.config.migrations_path();
        let files = migration_files(&dir).map_err(|e| DeployError::step("migrations", e))?;
        if files.is_empty() {
            log::info!("No migrations in {}", dir.display());
            return Ok(());
        }

        let db = &self.config.database;
        let password = db.password()?;
        for file in files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let cmd = Cmd::new("psql")
                .args(["-X", "-q", "-v", "ON_ERROR_STOP=1", "-v", "VERBOSITY=verbose"])
                .args(["-h", &db.host, "-p", &db.port.to_string()])
                .args(["-U", &db.user, "-d", &db.name])
                .arg("-f")
                .arg(file.display().to_string())
                .env("PGPASSWORD", password.clone());

            let output = self.shell.output(&cmd)?;
            let status = if output.success {
                MigrationStatus::Applied
            } else if already_applied(&output.stderr_str()) {
                log::info!("{name}: already applied");
                MigrationStatus::AlreadyApplied
            } else {
                return Err(DeployError::Migration {
                    file: name,
                    message: stderr_tail(&output.stderr_str()),
                });
            };
            outcome.migrations.push(MigrationRecord { file: name, status });
        }

        let applied = outcome
            .migrations
            .iter()
            .filter(|m| m.status == MigrationStatus::Applied)
            .count();
        outcome.record(
            "migrations",
            format!("{applied} applied, {} total", outcome.migrations.len()),
        );
        Ok(())
    }

    fn build_frontend(&self, fresh: bool, outcome: &mut ExecutionOutcome) -> Result<(), DeployError> {
        let frontend = &self.config.frontend;
        let dir = self.config.app.frontend_path();
        if fresh {
            self.remove_node_modules(&dir)?;
        }
        self.checked("frontend dependency install", &self.npm_install(&dir, false))?;

        let mut build = Cmd::new("npm")
            .args(["run", &frontend.build_script])
            .as_user(self.user())
            .current_dir(&dir);
        for (key, value) in &frontend.build_env {
            build = build.env(key, value.clone());
        }
        self.checked("frontend build", &build)?;

        let entry = self.config.build_path().join(&frontend.entry_artifact);
        if !entry.is_file() {
            return Err(DeployError::MissingArtifact {
                path: entry.display().to_string(),
            });
        }
        outcome.record("frontend build", entry.display().to_string());
        Ok(())
    }

    /// Replace the served tree with the build output
    fn place_frontend(&self, outcome: &mut ExecutionOutcome) -> Result<(), DeployError> {
        let frontend = &self.config.frontend;
        let build = self.config.build_path();
        let web_root = frontend.web_root_path();
        let place = |e: std::io::Error| {
            DeployError::step("artifact placement", format!("{}: {e}", web_root.display()))
        };

        if web_root.exists() {
            fs::remove_dir_all(&web_root).map_err(place)?;
        }
        fs::create_dir_all(&web_root).map_err(place)?;
        let bytes = copy_tree(&build, &web_root, &[])
            .map_err(|e| DeployError::step("artifact placement", format!("{e:#}")))?;

        let owner = format!("{0}:{0}", frontend.serving_user);
        self.checked(
            "artifact ownership",
            &Cmd::new("chown")
                .args(["-R", &owner])
                .arg(web_root.display().to_string()),
        )?;
        outcome.record(
            "frontend artifacts",
            format!(
                "{} to {}",
                crate::ui::format_size(bytes),
                web_root.display()
            ),
        );
        Ok(())
    }

    /// Register or restart the backend process
    fn start_backend(&self, outcome: &mut ExecutionOutcome) -> Result<(), DeployError> {
        let process = planner::backend_process(self.config, self.shell);
        let mut ctx = ApplyContext::default();
        let result = declarative::reconcile(&process, &mut ctx).map_err(|e| {
            DeployError::Reconcile {
                resource: process.id(),
                message: format!("{e:#}"),
            }
        })?;

        // Already online: restart to pick up new code and environment
        if result == ReconcileOutcome::Unchanged {
            process
                .restart()
                .map_err(|e| DeployError::step("backend restart", format!("{e:#}")))?;
            outcome.record("backend process", format!("{} restarted", process.name));
        } else {
            outcome.record("backend process", format!("{} {result}", process.name));
        }
        outcome.process = Some(result);
        Ok(())
    }

    /// Save the PM2 process list and install the boot hook once
    fn persist_supervisor(&self, outcome: &mut ExecutionOutcome) -> Result<(), DeployError> {
        let user = self.user();
        self.checked("pm2 save", &Cmd::new("pm2").arg("save").as_user(user))?;

        let unit = format!("pm2-{user}");
        if self
            .shell
            .succeeds(&Cmd::new("systemctl").args(["is-enabled", &unit]))
        {
            outcome.record("boot hook", format!("{unit} already enabled"));
            return Ok(());
        }

        let home = self.config.app.service_home().display().to_string();
        self.checked(
            "pm2 startup",
            &Cmd::new("pm2").args(["startup", "systemd", "-u", user, "--hp", &home]),
        )?;
        outcome.record("boot hook", format!("{unit} enabled"));
        Ok(())
    }

    fn reload_proxy(&self, outcome: &mut ExecutionOutcome) -> Result<(), DeployError> {
        let validate = self.shell.output(&Cmd::new("nginx").arg("-t"))?;
        if !validate.success {
            return Err(DeployError::step(
                "proxy validation",
                stderr_tail(&validate.stderr_str()),
            ));
        }
        self.checked(
            "proxy reload",
            &Cmd::new("systemctl").args(["reload-or-restart", "nginx"]),
        )?;
        outcome.record("proxy", "configuration valid, nginx reloaded");
        Ok(())
    }
}

/// Whether a failed migration only hit objects that already exist
///
/// Only the `ERROR:` line counts; NOTICE lines such as
/// `relation "users" already exists, skipping` do not. With
/// `VERBOSITY=verbose` the line carries the SQLSTATE, otherwise the message
/// text decides.
fn already_applied(stderr: &str) -> bool {
    let Some(error) = stderr
        .lines()
        .find_map(|line| line.split_once("ERROR:").map(|(_, rest)| rest.trim()))
    else {
        return false;
    };

    match error.split_once(':') {
        Some((state, _)) if is_sqlstate(state) => DUPLICATE_STATES.contains(&state),
        _ => error.contains("already exists"),
    }
}

fn is_sqlstate(text: &str) -> bool {
    text.len() == 5 && text.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
}

/// Migration scripts of a directory, sorted by file name
fn migration_files(dir: &Path) -> anyhow::Result<Vec<std::path::PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<_> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}
