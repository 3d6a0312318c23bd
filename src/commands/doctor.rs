use anyhow::Result;
use colored::Colorize;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::Context;
use crate::config::StackConfig;
use crate::paths;
use crate::prober::{Prober, ToolStatus, required_tools};
use crate::run::{Flow, Mode};
use crate::runner::{Cmd, Shell, SystemRunner, is_root};
use crate::ui;

#[derive(Debug)]
struct Issue {
    category: &'static str,
    summary: String,
    detail: Option<String>,
    fix: Option<String>,
    fix_cmd: Option<String>,
}

/// Check the host without changing it; returns whether no issues were found
pub fn run(ctx: &Context) -> Result<bool> {
    ui::header("stackup Health Check");

    let mut issues: Vec<Issue> = Vec::new();
    let config = check_config(ctx, &mut issues);
    let shell = Shell::new(SystemRunner::new());

    check_privileges(is_root(), &mut issues);
    check_tools(&shell, &mut issues);
    check_services(&config, &shell, &mut issues);
    check_paths(&config, &mut issues);
    check_secrets(&config, &mut issues);

    println!();
    if issues.is_empty() {
        ui::success("Host is ready for a deployment");
    } else {
        print_issue_summary(&issues);
    }

    Ok(issues.is_empty())
}

fn print_issue_summary(issues: &[Issue]) {
    let count = issues.len();
    let label = if count == 1 { "Issue" } else { "Issues" };
    ui::header(&format!("{count} {label} Found"));

    for (i, issue) in issues.iter().enumerate() {
        let num = i + 1;
        println!(
            "  {}  {} {}",
            format!("{num}.").bold(),
            issue.summary,
            format!("[{}]", issue.category).dimmed()
        );
        if let Some(detail) = &issue.detail {
            for line in detail.lines() {
                println!("      {}", line.dimmed());
            }
        }
        if let Some(fix) = &issue.fix {
            println!("      {} {}", "Fix:".cyan(), fix);
        }
        if let Some(cmd) = &issue.fix_cmd {
            println!("      {} {}", "$".dimmed(), cmd.bold());
        }
        println!();
    }

    let fix_cmds = quick_fixes(issues);
    if !fix_cmds.is_empty() {
        ui::section("Quick Fixes");
        println!(
            "  {}",
            "Run these commands to resolve the issues above:".dimmed()
        );
        println!();
        for cmd in &fix_cmds {
            println!("    {}", cmd.bold());
        }
    }
}

/// Fix commands in issue order, without repeats
fn quick_fixes(issues: &[Issue]) -> Vec<&str> {
    let mut cmds: Vec<&str> = Vec::new();
    for cmd in issues.iter().filter_map(|i| i.fix_cmd.as_deref()) {
        if !cmds.contains(&cmd) {
            cmds.push(cmd);
        }
    }
    cmds
}

fn check_config(ctx: &Context, issues: &mut Vec<Issue>) -> StackConfig {
    ui::section("Configuration");

    match StackConfig::load(ctx.config.as_deref()) {
        Ok((config, Some(path))) => {
            println!("  {} {}", "✓".green(), path.display());
            config
        }
        Ok((config, None)) => {
            println!(
                "  {} {} {}",
                "○".dimmed(),
                paths::CONFIG_FILE,
                "(not found, using defaults)".dimmed()
            );
            config
        }
        Err(e) => {
            println!("  {} {}", "✗".red(), "config could not be loaded".red());
            issues.push(Issue {
                category: "Configuration",
                summary: "Config file is invalid".into(),
                detail: Some(format!("{e:#}")),
                fix: Some("Fix the file; checks below use defaults".into()),
                fix_cmd: None,
            });
            StackConfig::default()
        }
    }
}

fn check_privileges(root: bool, issues: &mut Vec<Issue>) {
    ui::section("Privileges");

    if root {
        println!("  {} running as root", "✓".green());
    } else {
        println!("  {} not running as root", "⚠".yellow());
        issues.push(Issue {
            category: "Privileges",
            summary: "deploy and update need root".into(),
            detail: Some("Packages, services and /etc/nginx are changed by a run".into()),
            fix: Some("Run stackup through sudo".into()),
            fix_cmd: Some("sudo stackup deploy".into()),
        });
    }
}

fn check_tools(shell: &Shell, issues: &mut Vec<Issue>) {
    ui::section("Required Tools");

    let tools = required_tools(Flow::Update, &Mode::default());
    let report = Prober::new(shell.clone(), false).probe(&tools);

    for result in &report.results {
        match &result.status {
            ToolStatus::Present { version } | ToolStatus::Installed { version } => {
                let version = version.map(|v| v.to_string()).unwrap_or_default();
                println!("  {} {} {}", "✓".green(), result.name, version.dimmed());
            }
            ToolStatus::MissingFatal { reason } => {
                println!("  {} {} {}", "✗".red(), result.name, format!("({reason})").red());
                issues.push(Issue {
                    category: "Required Tools",
                    summary: format!("{} is not usable", result.name),
                    detail: Some(reason.clone()),
                    fix: Some(format!("Install {}", result.name)),
                    fix_cmd: result.hint.clone(),
                });
            }
        }
    }
}

fn check_services(config: &StackConfig, shell: &Shell, issues: &mut Vec<Issue>) {
    ui::section("Services");

    for (service, desc) in [("postgresql", "Database server"), ("nginx", "Reverse proxy")] {
        let active = shell.succeeds(&Cmd::new("systemctl").args(["is-active", "--quiet", service]));
        if active {
            println!("  {} {} - {}", "✓".green(), service, desc.dimmed());
        } else {
            println!("  {} {} - {} {}", "✗".red(), service, desc, "(inactive)".red());
            issues.push(Issue {
                category: "Services",
                summary: format!("{service} is not running"),
                detail: None,
                fix: Some(format!("Start and enable {service}")),
                fix_cmd: Some(format!("sudo systemctl enable --now {service}")),
            });
        }
    }

    let user = &config.app.service_user;
    let unit = format!("pm2-{user}");
    if shell.succeeds(&Cmd::new("systemctl").args(["is-enabled", unit.as_str()])) {
        println!("  {} {} - {}", "✓".green(), unit, "PM2 boot hook".dimmed());
    } else {
        println!(
            "  {} {} - PM2 boot hook {}",
            "○".dimmed(),
            unit,
            "(not installed, deploy adds it)".dimmed()
        );
    }
}

fn check_paths(config: &StackConfig, issues: &mut Vec<Issue>) {
    ui::section("Application Paths");

    let root = config.app.root_path();
    if !root.is_dir() {
        println!("  {} {} {}", "✗".red(), root.display(), "(missing)".red());
        issues.push(Issue {
            category: "Application Paths",
            summary: "Application checkout is missing".into(),
            detail: Some(format!("Expected at {}", root.display())),
            fix: Some("Clone the application repository".into()),
            fix_cmd: Some(format!(
                "sudo -u {} git clone <repository> {}",
                config.app.service_user,
                root.display()
            )),
        });
        return;
    }
    println!("  {} {}", "✓".green(), root.display());

    for (dir, label) in [
        (config.app.backend_path(), "backend"),
        (config.app.frontend_path(), "frontend"),
    ] {
        let manifest = dir.join("package.json");
        if manifest.is_file() {
            println!("  {} {} {}", "✓".green(), label, manifest.display().to_string().dimmed());
        } else {
            println!("  {} {} {}", "✗".red(), label, "(no package.json)".red());
            issues.push(Issue {
                category: "Application Paths",
                summary: format!("{label} has no package.json"),
                detail: Some(format!("Looked in {}", dir.display())),
                fix: Some(format!("Check app.{label}_dir in the config")),
                fix_cmd: None,
            });
        }
    }

    optional_dir("migrations", &config.migrations_path());
    optional_dir("snapshots", &paths::expand(&config.snapshots.dir));
}

fn optional_dir(label: &str, path: &Path) {
    if path.is_dir() {
        println!("  {} {} {}", "✓".green(), label, path.display().to_string().dimmed());
    } else {
        println!(
            "  {} {} {}",
            "○".dimmed(),
            label,
            format!("({} not found)", path.display()).dimmed()
        );
    }
}

fn check_secrets(config: &StackConfig, issues: &mut Vec<Issue>) {
    ui::section("Secrets");

    match config.database.password() {
        Ok(_) => println!("  {} database password available", "✓".green()),
        Err(e) => {
            println!("  {} database password {}", "✗".red(), "(not set)".red());
            issues.push(Issue {
                category: "Secrets",
                summary: "No database password".into(),
                detail: Some(format!("{e:#}")),
                fix: Some(format!(
                    "Export ${} before running (keep it out of the config file)",
                    config.database.password_env
                )),
                fix_cmd: None,
            });
        }
    }

    let env_file = config.env_file_path();
    match std::fs::metadata(&env_file) {
        Ok(meta) if meta.permissions().mode() & 0o077 != 0 => {
            println!(
                "  {} {} {}",
                "⚠".yellow(),
                env_file.display(),
                "(readable by others)".yellow()
            );
            issues.push(Issue {
                category: "Secrets",
                summary: "Backend env file is readable by other users".into(),
                detail: Some(format!(
                    "Mode {:o}, contains the database password",
                    meta.permissions().mode() & 0o777
                )),
                fix: Some("Restrict it to the owner".into()),
                fix_cmd: Some(format!("chmod 600 {}", env_file.display())),
            });
        }
        Ok(_) => println!("  {} {}", "✓".green(), env_file.display()),
        Err(_) => println!(
            "  {} {} {}",
            "○".dimmed(),
            env_file.display(),
            "(not written yet)".dimmed()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;
    use std::fs;
    use std::sync::Arc;

    fn config_in(root: &Path) -> StackConfig {
        let mut config = StackConfig::default();
        config.app.root = root.display().to_string();
        config.database.password = Some("secret".to_string());
        config
    }

    #[test]
    fn test_missing_tools_become_issues_with_fix_commands() {
        let fake = Arc::new(FakeRunner::new());
        fake.with_binaries(&["git", "node", "npm"]);
        fake.reply("node --version", "v20.11.1\n");
        let mut issues = Vec::new();

        check_tools(&Shell::shared(fake), &mut issues);

        let names: Vec<&str> = issues.iter().map(|i| i.summary.as_str()).collect();
        assert_eq!(
            names,
            vec!["pm2 is not usable", "psql is not usable", "nginx is not usable"]
        );
        assert_eq!(
            issues[0].fix_cmd.as_deref(),
            Some("sudo npm install -g pm2")
        );
    }

    #[test]
    fn test_old_node_is_an_issue() {
        let fake = Arc::new(FakeRunner::new());
        fake.with_binaries(&["git", "node", "npm", "pm2", "psql", "nginx"]);
        fake.reply("node --version", "v16.20.0\n");
        let mut issues = Vec::new();

        check_tools(&Shell::shared(fake), &mut issues);

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].summary, "node is not usable");
    }

    #[test]
    fn test_inactive_service_is_an_issue() {
        let fake = Arc::new(FakeRunner::new());
        fake.reject("is-active --quiet nginx", "");
        let mut issues = Vec::new();

        check_services(&StackConfig::default(), &Shell::shared(fake), &mut issues);

        assert_eq!(issues.len(), 1);
        assert_eq!(
            issues[0].fix_cmd.as_deref(),
            Some("sudo systemctl enable --now nginx")
        );
    }

    #[test]
    fn test_missing_checkout() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir.path().join("absent"));
        let mut issues = Vec::new();

        check_paths(&config, &mut issues);

        assert_eq!(issues.len(), 1);
        assert!(issues[0].fix_cmd.as_deref().unwrap().contains("git clone"));
    }

    #[test]
    fn test_checkout_without_frontend_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        fs::create_dir_all(config.app.backend_path()).unwrap();
        fs::write(config.app.backend_path().join("package.json"), "{}").unwrap();
        let mut issues = Vec::new();

        check_paths(&config, &mut issues);

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].summary, "frontend has no package.json");
    }

    #[test]
    fn test_world_readable_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let env_file = config.env_file_path();
        fs::create_dir_all(env_file.parent().unwrap()).unwrap();
        fs::write(&env_file, "DB_PASSWORD=x\n").unwrap();
        fs::set_permissions(&env_file, fs::Permissions::from_mode(0o644)).unwrap();
        let mut issues = Vec::new();

        check_secrets(&config, &mut issues);

        assert_eq!(issues.len(), 1);
        assert_eq!(
            issues[0].fix_cmd,
            Some(format!("chmod 600 {}", env_file.display()))
        );
    }

    #[test]
    fn test_privileges() {
        let mut issues = Vec::new();
        check_privileges(true, &mut issues);
        assert!(issues.is_empty());
        check_privileges(false, &mut issues);
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn test_quick_fixes_are_deduplicated() {
        let issue = |cmd: Option<&str>| Issue {
            category: "Services",
            summary: String::new(),
            detail: None,
            fix: None,
            fix_cmd: cmd.map(str::to_string),
        };
        let issues = vec![issue(Some("a")), issue(None), issue(Some("b")), issue(Some("a"))];
        assert_eq!(quick_fixes(&issues), vec!["a", "b"]);
    }
}
