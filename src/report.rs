//! Final run report and restore advice
//!
//! The report is printed on every exit path. Restore steps are text for
//! the operator; nothing here executes them.

use colored::Colorize;
use declarative::{ResourceStatus, status_symbol};

use crate::config::StackConfig;
use crate::engine::executor::MigrationStatus;
use crate::health::{HealthReport, HealthStatus};
use crate::run::DeploymentRun;
use crate::snapshot::{BACKEND, CapturedKind, PG_HBA, Snapshot};
use crate::ui;

/// Commands that put the host back to a snapshot, in execution order
///
/// Lines starting with `#` are notes for the operator.
pub fn restore_steps(snapshot: &Snapshot, config: &StackConfig) -> Vec<String> {
    let mut steps = Vec::new();

    for item in &snapshot.contents {
        let stored = quote(&snapshot.stored_path(item).display().to_string());
        let source = quote(&item.source);
        match item.kind {
            CapturedKind::Directory => {
                steps.push(format!("rm -rf {source} && cp -a {stored} {source}"));
                if item.label == BACKEND {
                    let verb = if snapshot.stored_path(item).join("package-lock.json").exists() {
                        "ci"
                    } else {
                        "install"
                    };
                    steps.push(format!(
                        "cd {source} && sudo -u {} npm {verb} --omit=dev",
                        config.app.service_user
                    ));
                }
            }
            CapturedKind::File => {
                steps.push(format!("cp -a {stored} {source}"));
                if item.label == PG_HBA {
                    steps.push("systemctl reload postgresql".to_string());
                }
            }
            CapturedKind::DatabaseDump => {
                steps.push(format!(
                    "# Review first: replaces database {} with the snapshot, dropping later data and migrations",
                    item.source
                ));
                steps.push(format!(
                    "sudo -u {} psql -v ON_ERROR_STOP=1 -d {} -f {stored}",
                    config.database.superuser, item.source
                ));
            }
        }
    }

    steps.push(format!(
        "sudo -u {} pm2 restart {} --update-env",
        config.app.service_user, config.backend.process_name
    ));
    steps.push("nginx -t && systemctl reload nginx".to_string());
    steps
}

fn quote(text: &str) -> String {
    if text
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'))
    {
        text.to_string()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}

/// Print the report for a finished (or halted) run
pub fn print(run: &DeploymentRun, config: &StackConfig) {
    ui::header(&format!("stackup {} report", run.flow));
    ui::kv("Mode", &run.mode.describe());
    ui::kv("Host", &run.public_host);
    ui::kv(
        "Started",
        &run.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
    );
    ui::kv("Duration", &format!("{}s", run.elapsed().num_seconds()));

    print_resources(run);
    print_execution(run);
    if let Some(health) = &run.health {
        print_health(health);
    }

    if let Some(failure) = &run.failure {
        ui::section("Failure");
        ui::error(&format!("[{}] {failure}", failure.category()));
    }

    if let Some(snapshot) = &run.snapshot {
        ui::section("Restore point");
        ui::kv("Snapshot", &snapshot.dir.display().to_string());
        ui::kv("Size", &ui::format_size(snapshot.size()));
        println!();
        println!("  To restore manually:");
        for step in restore_steps(snapshot, config) {
            ui::restore_step(&step);
        }
    }

    println!();
    if run.succeeded() {
        ui::success(&format!("{} completed", run.flow));
    } else {
        ui::error(&format!("{} failed", run.flow));
    }
}

fn print_resources(run: &DeploymentRun) {
    if run.resources.outcomes.is_empty() {
        return;
    }
    ui::section("Resources");
    for outcome in &run.resources.outcomes {
        let symbol = status_symbol(&outcome.status);
        let status = match &outcome.status {
            ResourceStatus::Done(result) => result.to_string().normal(),
            ResourceStatus::Failed { error } => format!("failed: {error}").red(),
        };
        println!("  {symbol} {:<44} {status}", outcome.id);
    }

    let summary = run.resources.summary();
    ui::dim(&format!(
        "{} created, {} updated, {} unchanged, {} failed",
        summary.created, summary.updated, summary.unchanged, summary.failed
    ));
}

fn print_execution(run: &DeploymentRun) {
    let execution = &run.execution;
    if execution.steps.is_empty() && execution.migrations.is_empty() {
        return;
    }
    ui::section("Execution");
    for step in &execution.steps {
        println!("  {} {:<22} {}", "✓".green(), step.name, step.detail.dimmed());
    }
    for migration in &execution.migrations {
        let status = match migration.status {
            MigrationStatus::Applied => "applied".green(),
            MigrationStatus::AlreadyApplied => "already applied".dimmed(),
        };
        println!("    {:<40} {status}", migration.file);
    }
}

/// Print per-layer health lines and the overall verdict
pub fn print_health(health: &HealthReport) {
    ui::section("Health");
    for result in &health.results {
        let label = format!("{:<9}", result.status.to_string());
        let status = match result.status {
            HealthStatus::Ok => label.green(),
            HealthStatus::Degraded => label.yellow(),
            HealthStatus::Fail => label.red(),
        };
        println!(
            "  {:<16} {status} {}",
            result.layer.to_string(),
            result.detail.dimmed()
        );
    }
    if let Some(load) = &health.load {
        ui::dim(&format!(
            "load probe: {}/{} requests ok in {} ms",
            load.succeeded,
            load.requests,
            load.elapsed.as_millis()
        ));
    }
    if health.overall {
        ui::success("All probed layers healthy");
    } else {
        ui::warn(&format!(
            "Unhealthy: {}",
            health.unhealthy_layers().join(", ")
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Captured;
    use chrono::Local;
    use std::path::PathBuf;

    fn snapshot() -> Snapshot {
        let item = |label: &str, source: &str, stored: &str, kind| Captured {
            label: label.to_string(),
            source: source.to_string(),
            stored: stored.to_string(),
            kind,
            bytes: 10,
        };
        Snapshot {
            id: "20260101_120000".to_string(),
            created_at: Local::now(),
            contents: vec![
                item("web-root", "/var/www/webapp", "web-root", CapturedKind::Directory),
                item("env-file", "/home/ubuntu/app/backend/.env", "env-file", CapturedKind::File),
                item("database", "app_db", "database.sql", CapturedKind::DatabaseDump),
            ],
            skipped: Vec::new(),
            dir: PathBuf::from("/var/backups/stackup/20260101_120000"),
        }
    }

    #[test]
    fn test_restore_steps() {
        let steps = restore_steps(&snapshot(), &StackConfig::default());
        assert_eq!(
            steps[0],
            "rm -rf /var/www/webapp && cp -a /var/backups/stackup/20260101_120000/web-root /var/www/webapp"
        );
        assert_eq!(
            steps[1],
            "cp -a /var/backups/stackup/20260101_120000/env-file /home/ubuntu/app/backend/.env"
        );
        assert!(steps[2].starts_with("# Review first"));
        assert_eq!(
            steps[3],
            "sudo -u postgres psql -v ON_ERROR_STOP=1 -d app_db -f /var/backups/stackup/20260101_120000/database.sql"
        );
        assert_eq!(steps[4], "sudo -u ubuntu pm2 restart backend --update-env");
        assert_eq!(steps[5], "nginx -t && systemctl reload nginx");
    }

    #[test]
    fn test_restored_backend_gets_dependencies_before_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let mut snap = snapshot();
        snap.dir = tmp.path().to_path_buf();
        snap.contents = vec![
            Captured {
                label: BACKEND.to_string(),
                source: "/home/ubuntu/app/backend".to_string(),
                stored: BACKEND.to_string(),
                kind: CapturedKind::Directory,
                bytes: 10,
            },
            Captured {
                label: PG_HBA.to_string(),
                source: "/etc/postgresql/16/main/pg_hba.conf".to_string(),
                stored: PG_HBA.to_string(),
                kind: CapturedKind::File,
                bytes: 10,
            },
        ];
        std::fs::create_dir_all(tmp.path().join(BACKEND)).unwrap();
        std::fs::write(tmp.path().join(BACKEND).join("package-lock.json"), "{}").unwrap();

        let steps = restore_steps(&snap, &StackConfig::default());
        let install = steps
            .iter()
            .position(|s| s == "cd /home/ubuntu/app/backend && sudo -u ubuntu npm ci --omit=dev")
            .unwrap();
        let copy = steps
            .iter()
            .position(|s| s.starts_with("rm -rf /home/ubuntu/app/backend"))
            .unwrap();
        let restart = steps.iter().position(|s| s.contains("pm2 restart")).unwrap();
        assert!(copy < install && install < restart);
        assert_eq!(steps[3], "systemctl reload postgresql");

        std::fs::remove_file(tmp.path().join(BACKEND).join("package-lock.json")).unwrap();
        let steps = restore_steps(&snap, &StackConfig::default());
        assert_eq!(
            steps[1],
            "cd /home/ubuntu/app/backend && sudo -u ubuntu npm install --omit=dev"
        );
    }

    #[test]
    fn test_restore_steps_quote_paths() {
        let mut snap = snapshot();
        snap.contents.truncate(1);
        snap.contents[0].source = "/srv/my app".to_string();
        let steps = restore_steps(&snap, &StackConfig::default());
        assert!(steps[0].starts_with("rm -rf '/srv/my app' && "));
    }

    #[test]
    fn test_empty_snapshot_still_restarts() {
        let mut snap = snapshot();
        snap.contents.clear();
        let steps = restore_steps(&snap, &StackConfig::default());
        assert_eq!(steps.len(), 2);
    }
}
