//! PM2 process resource

use anyhow::{Context, Result};
use declarative::{ApplyContext, Resource, ResourceKind, ResourceState};
use serde::Deserialize;
use std::path::PathBuf;

use crate::runner::{Cmd, Shell};

const ONLINE: &str = "online";

/// Entry of `pm2 jlist`
#[derive(Debug, Deserialize)]
struct Pm2Entry {
    name: String,
    #[serde(default)]
    pm2_env: Pm2Env,
}

#[derive(Debug, Default, Deserialize)]
struct Pm2Env {
    #[serde(default)]
    status: String,
}

/// Parse `pm2 jlist`
///
/// The JSON array is printed on one line, possibly after `[PM2]` banner
/// lines when the daemon had to be spawned.
fn parse_jlist(stdout: &str) -> Result<Vec<(String, String)>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<Pm2Entry> = stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('['))
        .find_map(|line| serde_json::from_str(line).ok())
        .context("Could not parse `pm2 jlist` output")?;
    Ok(entries
        .into_iter()
        .map(|e| (e.name, e.pm2_env.status))
        .collect())
}

/// A named backend process supervised by PM2, running as the service user
#[derive(Debug, Clone)]
pub struct Pm2Process {
    pub name: String,
    pub script: String,
    pub cwd: PathBuf,
    pub user: String,
    /// Env-file resource that must be in place before the process starts
    pub env_file: Option<String>,
    shell: Shell,
}

impl Pm2Process {
    pub fn new(name: &str, script: &str, cwd: PathBuf, user: &str, shell: Shell) -> Self {
        Self {
            name: name.to_string(),
            script: script.to_string(),
            cwd,
            user: user.to_string(),
            env_file: None,
            shell,
        }
    }

    pub fn after_env_file(mut self, id: String) -> Self {
        self.env_file = Some(id);
        self
    }

    fn pm2(&self) -> Cmd {
        Cmd::new("pm2").as_user(&self.user)
    }

    /// PM2 status of the process, `None` if it is not registered
    pub fn status(&self) -> Result<Option<String>> {
        let out = self.shell.run_checked(&self.pm2().arg("jlist"))?;
        Ok(parse_jlist(&out)?
            .into_iter()
            .find(|(name, _)| *name == self.name)
            .map(|(_, status)| status))
    }

    /// Restart with the current environment file
    pub fn restart(&self) -> Result<()> {
        self.shell.run_checked(
            &self
                .pm2()
                .args(["restart", &self.name, "--update-env"])
                .current_dir(&self.cwd),
        )?;
        Ok(())
    }
}

impl Resource for Pm2Process {
    fn id(&self) -> String {
        format!("process:{}", self.name)
    }

    fn description(&self) -> String {
        format!("PM2 process {} ({})", self.name, self.script)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Process
    }

    fn requires(&self) -> Vec<String> {
        self.env_file.iter().cloned().collect()
    }

    fn current_state(&self) -> Result<ResourceState> {
        Ok(match self.status()? {
            None => ResourceState::Absent,
            Some(status) if status == ONLINE => self.desired_state(),
            Some(status) => ResourceState::Modified {
                from: status,
                to: ONLINE.to_string(),
            },
        })
    }

    fn desired_state(&self) -> ResourceState {
        ResourceState::Present {
            details: Some(ONLINE.to_string()),
        }
    }

    fn apply(&self, _ctx: &mut ApplyContext) -> Result<()> {
        if self.status()?.is_some() {
            return self.restart();
        }
        self.shell.run_checked(
            &self
                .pm2()
                .args(["start", &self.script, "--name", &self.name, "--time"])
                .current_dir(&self.cwd),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::{FakeRunner, ok};
    use declarative::{ReconcileOutcome, reconcile};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_parse_jlist_with_banner() {
        let out = "[PM2] Spawning PM2 daemon\n[PM2] PM2 Successfully daemonized\n[{\"name\":\"backend\",\"pm2_env\":{\"status\":\"errored\"}}]";
        assert_eq!(
            parse_jlist(out).unwrap(),
            vec![("backend".to_string(), "errored".to_string())]
        );
        assert!(parse_jlist("[PM2] garbage").is_err());
        let clean = r#"[{"name":"backend","pm2_env":{"status":"online"}},{"name":"worker"}]"#;
        let parsed = parse_jlist(clean).unwrap();
        assert_eq!(parsed[0], ("backend".to_string(), "online".to_string()));
        assert_eq!(parsed[1].1, "");
        assert!(parse_jlist("").unwrap().is_empty());
    }

    #[test]
    fn test_registers_missing_process() {
        let fake = Arc::new(FakeRunner::new());
        let started = Arc::new(AtomicBool::new(false));
        let flag = started.clone();
        fake.on("pm2 jlist", move |_| {
            ok(if flag.load(Ordering::SeqCst) {
                r#"[{"name":"backend","pm2_env":{"status":"online"}}]"#
            } else {
                "[]"
            })
        });
        let flag = started.clone();
        fake.on("pm2 start", move |_| {
            flag.store(true, Ordering::SeqCst);
            ok("")
        });

        let proc = Pm2Process::new(
            "backend",
            "server.js",
            PathBuf::from("/srv/app/backend"),
            "ubuntu",
            Shell::shared(fake.clone()),
        )
        .after_env_file("env-file:/srv/app/backend/.env".into());

        assert_eq!(proc.requires(), vec!["env-file:/srv/app/backend/.env"]);
        let mut ctx = ApplyContext::default();
        assert_eq!(reconcile(&proc, &mut ctx).unwrap(), ReconcileOutcome::Created);

        let start = fake
            .commands()
            .into_iter()
            .find(|c| c.line().starts_with("pm2 start"))
            .unwrap();
        assert_eq!(start.user.as_deref(), Some("ubuntu"));
        assert_eq!(start.cwd, Some(PathBuf::from("/srv/app/backend")));
        assert!(start.line().contains("--name backend"));
    }

    #[test]
    fn test_stopped_process_is_restarted() {
        let fake = Arc::new(FakeRunner::new());
        let restarted = Arc::new(AtomicBool::new(false));
        let flag = restarted.clone();
        fake.on("pm2 jlist", move |_| {
            let status = if flag.load(Ordering::SeqCst) { "online" } else { "stopped" };
            ok(&format!(r#"[{{"name":"backend","pm2_env":{{"status":"{status}"}}}}]"#))
        });
        let flag = restarted.clone();
        fake.on("pm2 restart backend --update-env", move |_| {
            flag.store(true, Ordering::SeqCst);
            ok("")
        });

        let proc = Pm2Process::new(
            "backend",
            "server.js",
            PathBuf::from("/srv/app/backend"),
            "ubuntu",
            Shell::shared(fake.clone()),
        );
        let mut ctx = ApplyContext::default();
        assert_eq!(reconcile(&proc, &mut ctx).unwrap(), ReconcileOutcome::Updated);
        assert!(!fake.called("pm2 start"));
    }
}
