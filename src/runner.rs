//! External command execution
//!
//! Every collaborator stackup drives (apt, npm, pm2, nginx, psql, git,
//! systemctl) is reached through [`CommandRunner`], so stages can be tested
//! against a scripted runner instead of a real host.

use anyhow::{Context, Result, bail};
use declarative::CommandOutput;
use std::io::Write;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Lines of stderr kept in error messages
const STDERR_TAIL_LINES: usize = 15;

/// A command invocation
#[derive(Debug, Clone, Default)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    /// Run as this user (via `sudo -u`) when it differs from the current one
    pub user: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin (SQL, never passed on argv)
    pub stdin: Option<String>,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn as_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Printable form; env values and stdin are left out (they carry secrets)
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        if let Some(user) = &self.user {
            line = format!("[{user}] {line}");
        }
        line
    }

    /// Full form used for matching in tests
    pub fn line(&self) -> String {
        let mut line = format!("{} {}", self.program, self.args.join(" "));
        if let Some(input) = &self.stdin {
            line.push_str(" <<< ");
            line.push_str(input);
        }
        line
    }
}

/// Executes commands on the host
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output
    fn output(&self, cmd: &Cmd) -> Result<CommandOutput>;

    /// Locate an executable on `$PATH`
    fn which(&self, binary: &str) -> Option<PathBuf>;

    /// Run a command and return trimmed stdout, failing on non-zero exit
    fn run_checked(&self, cmd: &Cmd) -> Result<String> {
        let output = self.output(cmd)?;
        if !output.success {
            bail!(
                "`{}` failed: {}",
                cmd.display(),
                stderr_tail(&output.stderr_str())
            );
        }
        Ok(output.stdout_str().trim().to_string())
    }

    /// Run a command, returning success/failure
    fn succeeds(&self, cmd: &Cmd) -> bool {
        self.output(cmd).map(|o| o.success).unwrap_or(false)
    }
}

/// Shared runner handle held by resources and stages
#[derive(Clone)]
pub struct Shell(Arc<dyn CommandRunner>);

impl Shell {
    pub fn new(runner: impl CommandRunner + 'static) -> Self {
        Self(Arc::new(runner))
    }

    pub fn shared(runner: Arc<dyn CommandRunner>) -> Self {
        Self(runner)
    }
}

impl Deref for Shell {
    type Target = dyn CommandRunner;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Shell")
    }
}

/// Last few lines of stderr, for error messages
pub fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Runner backed by real processes
pub struct SystemRunner {
    current_user: Option<String>,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self {
            current_user: std::env::var("USER").ok(),
        }
    }

    fn build(&self, cmd: &Cmd) -> Command {
        let needs_sudo = match (&cmd.user, &self.current_user) {
            (Some(target), Some(current)) => target != current,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let mut command = if needs_sudo {
            let mut c = Command::new("sudo");
            if !cmd.env.is_empty() {
                // sudo resets the environment; keep ours off argv
                let keys: Vec<&str> = cmd.env.iter().map(|(k, _)| k.as_str()).collect();
                c.arg(format!("--preserve-env={}", keys.join(",")));
                c.envs(cmd.env.iter().map(|(k, v)| (k, v)));
            }
            c.args(["-u", cmd.user.as_deref().unwrap_or("root"), "-H"]);
            c.arg("--").arg(&cmd.program);
            c
        } else {
            let mut c = Command::new(&cmd.program);
            c.envs(cmd.env.iter().map(|(k, v)| (k, v)));
            c
        };

        command.args(&cmd.args);
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }
        command
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for SystemRunner {
    fn output(&self, cmd: &Cmd) -> Result<CommandOutput> {
        log::debug!("exec: {}", cmd.display());
        let mut command = self.build(cmd);

        let output = match &cmd.stdin {
            None => command
                .stdin(Stdio::null())
                .output()
                .with_context(|| format!("Failed to execute: {}", cmd.display()))?,
            Some(input) => {
                let mut child = command
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .with_context(|| format!("Failed to execute: {}", cmd.display()))?;
                if let Some(mut stdin) = child.stdin.take() {
                    stdin
                        .write_all(input.as_bytes())
                        .with_context(|| format!("Failed to write stdin of {}", cmd.program))?;
                }
                child
                    .wait_with_output()
                    .with_context(|| format!("Failed to wait for: {}", cmd.display()))?
            }
        };

        log::trace!("exit {:?}: {}", output.status.code(), cmd.program);
        Ok(output.into())
    }

    fn which(&self, binary: &str) -> Option<PathBuf> {
        which::which(binary).ok()
    }
}

/// Whether the process runs with root privileges
#[allow(unsafe_code)]
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}


#[cfg(test)]
mod tests {
    use super::fake::{FakeRunner, fail};
    use super::*;

    #[test]
    fn test_display_hides_env_and_stdin() {
        let cmd = Cmd::new("psql")
            .args(["-d", "app"])
            .env("PGPASSWORD", "secret")
            .stdin("ALTER ROLE x PASSWORD 'secret'")
            .as_user("postgres");
        let shown = cmd.display();
        assert_eq!(shown, "[postgres] psql -d app");
        assert!(!shown.contains("secret"));
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let stderr: String = (1..=40).map(|i| format!("line {i}\n")).collect();
        let tail = stderr_tail(&stderr);
        assert!(tail.starts_with("line 26"));
        assert!(tail.ends_with("line 40"));
    }

    #[test]
    fn test_run_checked_reports_stderr() {
        let runner = FakeRunner::new();
        runner.on("nginx -t", |_| fail("emerg: unknown directive"));
        let err = runner.run_checked(&Cmd::new("nginx").arg("-t")).unwrap_err();
        assert!(err.to_string().contains("unknown directive"));
    }

    #[test]
    fn test_sudo_prefix_only_for_other_user() {
        let runner = SystemRunner {
            current_user: Some("root".into()),
        };
        let same = runner.build(&Cmd::new("id").as_user("root"));
        assert_eq!(same.get_program(), "id");

        let other = runner.build(&Cmd::new("pm2").arg("save").as_user("ubuntu"));
        assert_eq!(other.get_program(), "sudo");
        let args: Vec<_> = other.get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(args, vec!["-u", "ubuntu", "-H", "--", "pm2", "save"]);
    }
}
