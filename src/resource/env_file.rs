//! Backend environment file resource

use anyhow::Result;
use declarative::{ApplyContext, Resource, ResourceKind, ResourceState};
use std::fmt;
use std::path::PathBuf;

use super::{file_fingerprint, fingerprint, write_atomic};
use crate::runner::{Cmd, Shell};

/// Owner-only permissions; the file carries database credentials
pub const ENV_FILE_MODE: u32 = 0o600;

/// An ordered `KEY=value` file written with mode `0600`
#[derive(Clone)]
pub struct EnvFile {
    pub path: PathBuf,
    entries: Vec<(String, String)>,
    /// Hand the file to this user after writing
    owner: Option<String>,
    shell: Shell,
}

impl fmt::Debug for EnvFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.entries.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("EnvFile")
            .field("path", &self.path)
            .field("keys", &keys)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl EnvFile {
    pub fn new(path: PathBuf, entries: Vec<(String, String)>, shell: Shell) -> Self {
        Self {
            path,
            entries,
            owner: None,
            shell,
        }
    }

    pub fn owned_by(mut self, user: &str) -> Self {
        self.owner = Some(user.to_string());
        self
    }

    pub fn id_for(path: &std::path::Path) -> String {
        format!("env-file:{}", path.display())
    }

    /// Rendered file content
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|(key, value)| format!("{key}={}\n", quote_value(value)))
            .collect()
    }
}

/// Quote a value when a dotenv parser would otherwise split or truncate it
fn quote_value(value: &str) -> String {
    let plain = !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '\\' | '$' | '`'));
    if plain {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

impl Resource for EnvFile {
    fn id(&self) -> String {
        Self::id_for(&self.path)
    }

    fn description(&self) -> String {
        format!("Environment file {}", self.path.display())
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::EnvFile
    }

    fn current_state(&self) -> Result<ResourceState> {
        let desired = fingerprint(self.render().as_bytes(), ENV_FILE_MODE);
        Ok(match file_fingerprint(&self.path)? {
            None => ResourceState::Absent,
            Some(current) if current == desired => self.desired_state(),
            Some(current) => ResourceState::Modified {
                from: current,
                to: desired,
            },
        })
    }

    fn desired_state(&self) -> ResourceState {
        ResourceState::Present {
            details: Some(fingerprint(self.render().as_bytes(), ENV_FILE_MODE)),
        }
    }

    fn apply(&self, _ctx: &mut ApplyContext) -> Result<()> {
        write_atomic(&self.path, self.render().as_bytes(), ENV_FILE_MODE)?;
        if let Some(owner) = &self.owner {
            self.shell.run_checked(
                &Cmd::new("chown")
                    .arg(format!("{owner}:{owner}"))
                    .arg(self.path.display().to_string()),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;
    use declarative::{ReconcileOutcome, reconcile};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    fn entries() -> Vec<(String, String)> {
        vec![
            ("PORT".into(), "5000".into()),
            ("DB_PASSWORD".into(), "p@ss word".into()),
            ("NODE_ENV".into(), "production".into()),
        ]
    }

    #[test]
    fn test_render_keeps_order_and_quotes() {
        let fake = Arc::new(FakeRunner::new());
        let env = EnvFile::new(PathBuf::from("/tmp/.env"), entries(), Shell::shared(fake));
        assert_eq!(
            env.render(),
            "PORT=5000\nDB_PASSWORD=\"p@ss word\"\nNODE_ENV=production\n"
        );
        assert!(!format!("{env:?}").contains("p@ss"));
    }

    #[test]
    fn test_written_owner_only_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend").join(".env");
        let fake = Arc::new(FakeRunner::new());
        let env = EnvFile::new(path.clone(), entries(), Shell::shared(fake.clone()));

        let mut ctx = ApplyContext::default();
        assert_eq!(reconcile(&env, &mut ctx).unwrap(), ReconcileOutcome::Created);
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        assert_eq!(reconcile(&env, &mut ctx).unwrap(), ReconcileOutcome::Unchanged);
        assert!(!fake.called("chown"));
    }

    #[test]
    fn test_loose_permissions_are_tightened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let fake = Arc::new(FakeRunner::new());
        let env = EnvFile::new(path.clone(), entries(), Shell::shared(fake.clone()))
            .owned_by("ubuntu");
        fs::write(&path, env.render()).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let mut ctx = ApplyContext::default();
        assert_eq!(reconcile(&env, &mut ctx).unwrap(), ReconcileOutcome::Updated);
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert!(fake.called("chown ubuntu:ubuntu"));
    }
}
