//! Deployment pipeline
//!
//! probe -> confirm -> snapshot -> prune -> reconcile -> post actions ->
//! connection test -> execute -> settle -> verify -> report
//!
//! The first fatal error halts the run. The report is printed on every
//! path, including the snapshot location when one was taken.

use colored::Colorize;
use declarative::{
    ApplyContext, ConfirmCallback, ExecuteOptions, ProgressCallback, ResourceStatus,
    status_symbol,
};
use std::thread;
use std::time::Duration;

use crate::config::StackConfig;
use crate::engine::{Plan, differ, executor, planner};
use crate::error::DeployError;
use crate::health::{HealthStatus, HealthVerifier, Layer};
use crate::paths;
use crate::prober::{Prober, required_tools};
use crate::progress;
use crate::report;
use crate::resource::Psql;
use crate::resource::auth_rule::{self, RELOAD_POSTGRES};
use crate::run::{DeploymentRun, Flow};
use crate::runner::{Cmd, Shell, is_root};
use crate::snapshot::{BACKEND, CaptureTarget, PG_HBA, SnapshotManager};
use crate::ui;

/// Interactive confirmation through dialoguer
pub struct PromptConfirm;

impl ConfirmCallback for PromptConfirm {
    fn confirm(&mut self, prompt: &str) -> anyhow::Result<bool> {
        Ok(dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()?)
    }
}

/// Prints one line per reconciled resource
struct ReconcileProgress;

impl ProgressCallback for ReconcileProgress {
    fn on_batch_start(&mut self, count: usize) {
        ui::section(&format!("Reconciling {count} resources"));
    }

    fn on_resource_start(&mut self, id: &str, description: &str) {
        log::debug!("reconcile {id}: {description}");
    }

    fn on_resource_complete(&mut self, id: &str, status: &ResourceStatus) {
        let label = match status {
            ResourceStatus::Done(outcome) => outcome.to_string().normal(),
            ResourceStatus::Failed { error } => error.red(),
        };
        println!("  {} {:<44} {label}", status_symbol(status), id);
    }

    fn on_batch_complete(&mut self) {}
}

/// Mutable state the snapshot captures for a run
pub fn capture_targets(
    config: &StackConfig,
    run: &DeploymentRun,
    shell: &Shell,
) -> Vec<CaptureTarget> {
    let mut targets = Vec::new();
    if run.mode.backend() {
        targets.push(CaptureTarget::path(BACKEND, config.app.backend_path()));
        if config.snapshots.include_database {
            targets.push(CaptureTarget::database("database", &config.database.name));
        }
        if run.flow == Flow::Deploy {
            let db = &config.database;
            let configured = db.hba_file.as_deref().map(paths::expand);
            let psql = Psql::new(shell.clone(), &db.superuser);
            match auth_rule::locate(configured.as_deref(), &psql) {
                Ok(path) => targets.push(CaptureTarget::path(PG_HBA, path)),
                Err(e) => log::warn!("Not capturing pg_hba.conf: {e:#}"),
            }
        }
    }
    if run.mode.frontend() {
        targets.push(CaptureTarget::path(
            "web-root",
            config.frontend.web_root_path(),
        ));
    }
    if run.mode.proxy() {
        targets.push(CaptureTarget::path("vhost", config.proxy.site_path()));
    }
    targets
}

pub struct Pipeline<'a> {
    config: &'a StackConfig,
    shell: Shell,
    confirm: Box<dyn ConfirmCallback + 'a>,
    require_root: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a StackConfig, shell: Shell, confirm: Box<dyn ConfirmCallback + 'a>) -> Self {
        Self {
            config,
            shell,
            confirm,
            require_root: true,
        }
    }

    /// Skip the root precondition (used against scripted hosts)
    pub fn without_root_check(mut self) -> Self {
        self.require_root = false;
        self
    }

    /// Run every stage, record the outcome on `run`, and print the report
    pub fn run(&mut self, run: &mut DeploymentRun) {
        match self.stages(run) {
            Err(e) => run.failure = Some(e),
            Ok(()) => {
                if let Some(health) = &run.health
                    && !health.overall
                {
                    run.failure = Some(DeployError::Unhealthy {
                        layers: health.unhealthy_layers(),
                    });
                }
            }
        }
        report::print(run, self.config);
    }

    fn stages(&mut self, run: &mut DeploymentRun) -> Result<(), DeployError> {
        self.probe(run)?;
        let plan = planner::build(self.config, run, &self.shell)?;

        if run.mode.dry_run {
            preview(&plan);
            return Ok(());
        }

        self.confirm(run)?;
        if run.mode.skip_backup {
            ui::warn("Skipping snapshot (--no-backup)");
        } else {
            self.snapshot(run)?;
        }

        self.reconcile(&plan, run)?;
        self.post_actions(run)?;
        if run.flow == Flow::Deploy && run.mode.backend() {
            self.connection_test()?;
        }

        ui::section("Executing");
        executor::execute(self.config, &self.shell, run)?;

        self.settle();
        ui::section("Verifying");
        let verifier = HealthVerifier::new(self.config, self.shell.clone());
        run.health = Some(verifier.verify(&run.mode));
        Ok(())
    }

    fn probe(&self, run: &DeploymentRun) -> Result<(), DeployError> {
        ui::section("Checking preconditions");
        let tools = required_tools(run.flow, &run.mode);
        let mut report = Prober::new(self.shell.clone(), !run.mode.dry_run).probe(&tools);
        if self.require_root && !is_root() {
            report.push_fatal(
                "root",
                "stackup must run as root",
                Some(&format!("sudo stackup {}", run.flow)),
            );
        }
        report.print();

        if run.mode.dry_run {
            if !report.missing().is_empty() {
                ui::warn("Preconditions unmet; a real run would stop here");
            }
            return Ok(());
        }
        report.ensure_ok()
    }

    fn confirm(&mut self, run: &DeploymentRun) -> Result<(), DeployError> {
        if run.mode.assume_yes {
            return Ok(());
        }
        let prompt = format!(
            "Run {} of {} on {} ({})?",
            run.flow,
            self.config.app.name,
            run.public_host,
            run.mode.describe()
        );
        if self.confirm.confirm(&prompt)? {
            Ok(())
        } else {
            Err(DeployError::Aborted)
        }
    }

    fn snapshot(&self, run: &mut DeploymentRun) -> Result<(), DeployError> {
        let settings = &self.config.snapshots;
        let manager = SnapshotManager::new(
            paths::expand(&settings.dir),
            self.shell.clone(),
            &self.config.database.superuser,
        );

        let pb = progress::spinner("Capturing snapshot...");
        let snapshot = match manager.snapshot(&capture_targets(self.config, run, &self.shell)) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                progress::finish_error(&pb, "Snapshot failed");
                return Err(DeployError::step("snapshot", format!("{e:#}")));
            }
        };
        let message = format!(
            "Snapshot {} ({})",
            snapshot.id,
            ui::format_size(snapshot.size())
        );
        if snapshot.skipped.is_empty() {
            progress::finish_success(&pb, &message);
        } else {
            progress::finish_warn(
                &pb,
                &format!("{message}, {} target(s) skipped", snapshot.skipped.len()),
            );
        }
        for skipped in &snapshot.skipped {
            ui::dim(&format!("skipped {}: {}", skipped.label, skipped.reason));
        }
        run.snapshot = Some(snapshot);

        match manager.prune(settings.retain) {
            Ok(removed) if !removed.is_empty() => {
                ui::dim(&format!("pruned {} old snapshot(s)", removed.len()));
            }
            Ok(_) => {}
            Err(e) => ui::warn(&format!("Could not prune snapshots: {e:#}")),
        }
        Ok(())
    }

    fn reconcile(&self, plan: &Plan, run: &mut DeploymentRun) -> Result<(), DeployError> {
        let mut ctx = ApplyContext::new(log::log_enabled!(log::Level::Debug));
        let opts = ExecuteOptions::default();
        let report = declarative::execute(&plan.resources, &opts, &mut ctx, &mut ReconcileProgress)
            .map_err(|e| DeployError::Reconcile {
                resource: "plan".to_string(),
                message: e.to_string(),
            })?;

        let failure = report.failure().map(|f| {
            let message = match &f.status {
                ResourceStatus::Failed { error } => error.clone(),
                ResourceStatus::Done(_) => String::new(),
            };
            DeployError::Reconcile {
                resource: f.id.clone(),
                message,
            }
        });
        run.resources = report;
        run.post_actions = ctx.post_actions;
        failure.map_or(Ok(()), Err)
    }

    fn post_actions(&self, run: &DeploymentRun) -> Result<(), DeployError> {
        for action in &run.post_actions {
            match action.as_str() {
                RELOAD_POSTGRES => {
                    self.shell
                        .run_checked(&Cmd::new("systemctl").args(["reload", "postgresql"]))
                        .map_err(|e| DeployError::step("postgresql reload", format!("{e:#}")))?;
                    ui::success("PostgreSQL reloaded");
                }
                other => log::warn!("Ignoring unknown post action {other}"),
            }
        }
        Ok(())
    }

    /// Log in as the application role over TCP, as the backend will
    fn connection_test(&self) -> Result<(), DeployError> {
        let result = HealthVerifier::new(self.config, self.shell.clone()).probe(Layer::Database);
        if result.status == HealthStatus::Ok {
            ui::success(&format!("Connection test: {}", result.detail));
            Ok(())
        } else {
            Err(DeployError::Reconcile {
                resource: format!("connection:{}", self.config.database.user),
                message: result.detail,
            })
        }
    }

    fn settle(&self) {
        let secs = self.config.health.settle_secs;
        if secs == 0 {
            return;
        }
        let pb = progress::spinner(&format!("Waiting {secs}s for processes to settle..."));
        thread::sleep(Duration::from_secs(secs));
        pb.finish_and_clear();
    }
}

fn preview(plan: &Plan) {
    let diffs = differ::compute(plan);
    differ::display_diff(&diffs);
    differ::display_file_diffs(plan);
    println!();
    ui::info("Dry run - no changes made");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::Mode;
    use crate::runner::fake::{FakeRunner, ok};
    use crate::testutil::{get, serve};
    use declarative::{AutoConfirm, AutoDecline, CommandOutput};
    use std::collections::HashSet;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::{Arc, Mutex};

    const ONLINE: &str = r#"[{"name":"backend","pm2_env":{"status":"online"}}]"#;
    const FULL: &str = "CONNECT,CREATE,TEMP,public:CREATE";

    /// A scripted host whose database and supervisor keep state across calls
    struct FakeHost {
        _dir: tempfile::TempDir,
        config: StackConfig,
        fake: Arc<FakeRunner>,
    }

    impl FakeHost {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path();
            let mut config = StackConfig::default();
            config.app.root = root.join("app").display().to_string();
            config.database.password = Some("s3cret".into());
            config.database.hba_file = Some(root.join("pg_hba.conf").display().to_string());
            config.frontend.web_root = root.join("www").display().to_string();
            config.proxy.sites_available = root.join("sites-available").display().to_string();
            config.proxy.sites_enabled = root.join("sites-enabled").display().to_string();
            config.snapshots.dir = root.join("backups").display().to_string();
            config.health.settle_secs = 0;
            config.health.timeout_secs = 2;
            config.health.load_requests = 3;
            config.backend.port = serve(vec![get("/api/health", 200, "{\"status\":\"ok\"}")]);
            config.proxy.listen_port = serve(vec![get("/", 200, "<html></html>")]);

            fs::write(root.join("pg_hba.conf"), "local all postgres peer\n").unwrap();
            fs::create_dir_all(config.app.backend_path()).unwrap();
            fs::write(config.app.backend_path().join("server.js"), "").unwrap();
            let build = config.build_path();
            fs::create_dir_all(&build).unwrap();
            fs::write(build.join("index.html"), "<html></html>").unwrap();

            Self {
                _dir: dir,
                config,
                fake: Arc::new(stateful_runner()),
            }
        }

        fn deploy(&self, mode: Mode, confirm: Box<dyn ConfirmCallback>) -> DeploymentRun {
            let mut run = DeploymentRun::new(Flow::Deploy, mode);
            run.public_host = "203.0.113.7".to_string();
            Pipeline::new(&self.config, Shell::shared(self.fake.clone()), confirm)
                .without_root_check()
                .run(&mut run);
            run
        }
    }

    type State = Arc<Mutex<HashSet<&'static str>>>;

    /// Answer `yes` once `name` was set, `no` before
    fn when(
        state: &State,
        name: &'static str,
        yes: &'static str,
        no: &'static str,
    ) -> impl Fn(&Cmd) -> CommandOutput + Send + Sync + 'static {
        let state = state.clone();
        move |_: &Cmd| ok(if state.lock().unwrap().contains(name) { yes } else { no })
    }

    fn set(
        state: &State,
        name: &'static str,
    ) -> impl Fn(&Cmd) -> CommandOutput + Send + Sync + 'static {
        let state = state.clone();
        move |_: &Cmd| {
            state.lock().unwrap().insert(name);
            ok("")
        }
    }

    fn stateful_runner() -> FakeRunner {
        let fake = FakeRunner::new();
        fake.with_binaries(&["node", "npm", "pm2", "psql", "nginx"]);
        fake.reply("node --version", "v20.11.1\n");

        let state = State::default();
        fake.on("FROM pg_database", when(&state, "db", "1", ""));
        fake.on("CREATE DATABASE", set(&state, "db"));
        fake.on("SELECT 1 FROM pg_roles", when(&state, "role", "1", ""));
        fake.on("SELECT rolcanlogin", when(&state, "role", "t", ""));
        fake.on("CREATE ROLE", set(&state, "role"));
        fake.on("concat_ws", when(&state, "grant", FULL, "CONNECT,TEMP"));
        fake.on("GRANT ALL", set(&state, "grant"));
        fake.on("pm2 jlist", when(&state, "pm2", ONLINE, "[]"));
        fake.on("pm2 start", set(&state, "pm2"));
        fake.reply("-c SELECT 1", "1\n");
        fake
    }

    #[test]
    fn test_fresh_deploy_end_to_end() {
        let host = FakeHost::new();
        let mode = Mode {
            fresh: true,
            ..Mode::default()
        };
        let run = host.deploy(mode, Box::new(AutoConfirm));

        assert!(run.failure.is_none(), "{:?}", run.failure);
        assert!(run.succeeded());

        let summary = run.resources.summary();
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.created, 6);
        assert_eq!(run.post_actions, vec![RELOAD_POSTGRES.to_string()]);

        let env = fs::metadata(host.config.env_file_path()).unwrap();
        assert_eq!(env.permissions().mode() & 0o777, 0o600);
        let content = fs::read_to_string(host.config.env_file_path()).unwrap();
        assert!(content.contains("CORS_ORIGIN=http://203.0.113.7"));

        assert_eq!(
            run.execution.process,
            Some(declarative::ReconcileOutcome::Created)
        );
        assert!(host.config.frontend.served_entry().is_file());

        let health = run.health.as_ref().unwrap();
        assert!(health.overall);
        assert_eq!(health.results.len(), 4);
        assert_eq!(health.load.as_ref().unwrap().succeeded, 3);

        let snapshot = run.snapshot.as_ref().unwrap();
        assert!(snapshot.dir.join("snapshot.json").is_file());
        let hba = snapshot.contents.iter().find(|c| c.label == "pg-hba").unwrap();
        assert_eq!(
            fs::read_to_string(snapshot.stored_path(hba)).unwrap(),
            "local all postgres peer\n"
        );

        let calls = &host.fake;
        let reload = calls.position("systemctl reload postgresql").unwrap();
        let connect = calls.position("-c SELECT 1").unwrap();
        let install = calls.position("npm install --omit=dev").unwrap();
        assert!(reload < connect && connect < install);
    }

    #[test]
    fn test_second_deploy_changes_nothing() {
        let host = FakeHost::new();
        let first = host.deploy(Mode::default(), Box::new(AutoConfirm));
        assert!(first.succeeded(), "{:?}", first.failure);

        let second = host.deploy(Mode::default(), Box::new(AutoConfirm));
        assert!(second.succeeded(), "{:?}", second.failure);
        let summary = second.resources.summary();
        assert_eq!(summary.total_changes(), 0);
        assert_eq!(summary.unchanged, 7);
        assert!(second.post_actions.is_empty());
        assert_eq!(
            second.execution.process,
            Some(declarative::ReconcileOutcome::Unchanged)
        );
    }

    #[test]
    fn test_declined_confirmation_mutates_nothing() {
        let host = FakeHost::new();
        let run = host.deploy(Mode::default(), Box::new(AutoDecline));

        assert!(matches!(run.failure, Some(DeployError::Aborted)));
        assert!(run.snapshot.is_none());
        assert!(!host.fake.called("CREATE DATABASE"));
        assert!(!host.config.env_file_path().exists());
        assert!(!paths::expand(&host.config.snapshots.dir).exists());
    }

    #[test]
    fn test_assume_yes_skips_prompt() {
        let host = FakeHost::new();
        let mode = Mode {
            assume_yes: true,
            skip_backup: true,
            ..Mode::default()
        };
        let run = host.deploy(mode, Box::new(AutoDecline));
        assert!(run.succeeded(), "{:?}", run.failure);
        assert!(run.snapshot.is_none());
        assert!(!host.fake.called("pg_dump"));
    }

    #[test]
    fn test_partial_failure_stops_and_reports() {
        let host = FakeHost::new();
        host.fake
            .reject("GRANT ALL", "ERROR:  permission denied for database app_db");
        let run = host.deploy(Mode::default(), Box::new(AutoConfirm));

        match &run.failure {
            Some(DeployError::Reconcile { resource, message }) => {
                assert_eq!(resource, "grant:app_user@app_db");
                assert!(message.contains("permission denied"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let ids: Vec<_> = run.resources.outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["database:app_db", "role:app_user", "grant:app_user@app_db"]);
        assert!(run.snapshot.is_some());
        assert!(run.health.is_none());
        for step in ["npm install", "npm ci", "npm run"] {
            assert!(!host.fake.called(step), "{step} ran");
        }
    }

    #[test]
    fn test_missing_tools_are_all_reported() {
        let host = FakeHost::new();
        let bare = Arc::new(FakeRunner::new());
        bare.reject("apt-get", "E: Unable to locate package");
        let mut run = DeploymentRun::new(Flow::Deploy, Mode::default());
        Pipeline::new(&host.config, Shell::shared(bare.clone()), Box::new(AutoConfirm))
            .without_root_check()
            .run(&mut run);

        match &run.failure {
            Some(DeployError::Precondition { missing }) => {
                assert_eq!(missing, &["node", "npm", "pm2", "psql", "nginx"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!bare.called("CREATE DATABASE"));
        assert!(run.snapshot.is_none());
    }

    #[test]
    fn test_unhealthy_verification_fails_run() {
        let mut host = FakeHost::new();
        host.config.backend.port = serve(vec![get("/api/health", 503, "starting")]);
        let run = host.deploy(Mode::default(), Box::new(AutoConfirm));

        match &run.failure {
            Some(DeployError::Unhealthy { layers }) => assert_eq!(layers, &["backend"]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!run.succeeded());
    }

    #[test]
    fn test_dry_run_does_not_mutate() {
        let host = FakeHost::new();
        let mode = Mode {
            dry_run: true,
            ..Mode::default()
        };
        let run = host.deploy(mode, Box::new(AutoDecline));

        assert!(run.failure.is_none());
        assert!(run.resources.outcomes.is_empty());
        assert!(!host.fake.called("CREATE DATABASE"));
        for step in ["npm install", "npm ci", "npm run"] {
            assert!(!host.fake.called(step), "{step} ran");
        }
        assert!(!host.config.env_file_path().exists());
    }

    #[test]
    fn test_capture_targets_follow_mode() {
        let config = StackConfig::default();
        let run = DeploymentRun::new(
            Flow::Update,
            Mode {
                frontend_only: true,
                skip_proxy: true,
                ..Mode::default()
            },
        );
        let shell = Shell::shared(Arc::new(FakeRunner::new()));
        let labels = |config: &StackConfig, run: &DeploymentRun| -> Vec<String> {
            capture_targets(config, run, &shell)
                .iter()
                .map(|t| t.label().to_string())
                .collect()
        };
        assert_eq!(labels(&config, &run), vec!["web-root"]);

        let mut config = StackConfig::default();
        config.database.hba_file = Some("/etc/postgresql/16/main/pg_hba.conf".into());
        let deploy = DeploymentRun::new(Flow::Deploy, Mode::default());
        assert_eq!(
            labels(&config, &deploy),
            vec!["backend", "database", "pg-hba", "web-root", "vhost"]
        );
        let targets = capture_targets(&config, &deploy, &shell);
        assert!(matches!(
            &targets[2],
            CaptureTarget::Path { path, .. } if path.ends_with("main/pg_hba.conf")
        ));

        let update = DeploymentRun::new(Flow::Update, Mode::default());
        assert_eq!(
            labels(&config, &update),
            vec!["backend", "database", "web-root", "vhost"]
        );
    }

    #[test]
    fn test_capture_asks_server_for_pg_hba() {
        let fake = Arc::new(FakeRunner::new());
        fake.reply("SHOW hba_file", "/var/lib/pgsql/data/pg_hba.conf\n");
        let run = DeploymentRun::new(
            Flow::Deploy,
            Mode {
                backend_only: true,
                skip_proxy: true,
                ..Mode::default()
            },
        );

        let shell = Shell::shared(fake.clone());
        let targets = capture_targets(&StackConfig::default(), &run, &shell);
        assert!(matches!(
            &targets[2],
            CaptureTarget::Path { path, .. } if path.ends_with("data/pg_hba.conf")
        ));
        assert!(fake.called("SHOW hba_file"));
    }
}
