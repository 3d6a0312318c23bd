//! pg_hba.conf rule resource
//!
//! Password authentication for the application role is added as a marked
//! block above the first active rule, since pg_hba.conf is first-match.
//! Existing rules are never edited or removed.

use anyhow::{Context, Result, bail};
use declarative::{ApplyContext, Resource, ResourceKind, ResourceState};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use super::role::PgRole;
use super::{MAINTENANCE_DB, Psql, write_atomic};

/// Post action requested after the file changes
pub const RELOAD_POSTGRES: &str = "reload:postgresql";

/// Managed password-auth lines for one role on one database
#[derive(Debug, Clone)]
pub struct PgHbaRule {
    pub database: String,
    pub role: String,
    hba_file: Option<PathBuf>,
    psql: Psql,
}

impl PgHbaRule {
    pub fn new(database: &str, role: &str, hba_file: Option<PathBuf>, psql: Psql) -> Self {
        Self {
            database: database.to_string(),
            role: role.to_string(),
            hba_file,
            psql,
        }
    }

    fn key(&self) -> String {
        format!("{}@{}", self.role, self.database)
    }

    fn begin_marker(&self) -> String {
        format!("# BEGIN stackup {}", self.key())
    }

    fn end_marker(&self) -> String {
        format!("# END stackup {}", self.key())
    }

    /// The managed block, markers included
    pub fn block(&self) -> Vec<String> {
        vec![
            self.begin_marker(),
            format!("local   {:<15} {:<15} {:<18} md5", self.database, self.role, ""),
            format!("host    {:<15} {:<15} {:<18} md5", self.database, self.role, "127.0.0.1/32"),
            self.end_marker(),
        ]
    }

    fn path(&self) -> Result<PathBuf> {
        locate(self.hba_file.as_deref(), &self.psql)
    }

    fn read(path: &Path) -> Result<Vec<String>> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Ok(content.lines().map(str::to_string).collect())
    }
}

/// Location of pg_hba.conf, asked from the server when not configured
pub fn locate(configured: Option<&Path>, psql: &Psql) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    let shown = psql.query(MAINTENANCE_DB, "SHOW hba_file;")?;
    if shown.is_empty() {
        bail!("PostgreSQL did not report its hba_file");
    }
    Ok(PathBuf::from(shown))
}

fn is_active(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

/// Split out an existing managed block
///
/// Returns the remaining lines and, when found, the block with its index.
/// Without an end marker only the begin marker and the managed rules right
/// after it are taken; anything else stays in place.
fn take_block(lines: &[String], block: &[String]) -> (Vec<String>, Option<(usize, Vec<String>)>) {
    let (Some(begin), Some(end)) = (block.first(), block.last()) else {
        return (lines.to_vec(), None);
    };
    let Some(start) = lines.iter().position(|l| l.trim() == begin) else {
        return (lines.to_vec(), None);
    };

    let stop = match lines[start..].iter().position(|l| l.trim() == end) {
        Some(offset) => start + offset + 1,
        None => {
            let body = &block[1..block.len() - 1];
            let managed = lines[start + 1..]
                .iter()
                .take_while(|l| body.iter().any(|b| b.trim() == l.trim()))
                .count();
            start + 1 + managed
        }
    };

    let mut rest = lines[..start].to_vec();
    rest.extend_from_slice(&lines[stop..]);
    (rest, Some((start, lines[start..stop].to_vec())))
}

/// Insert a block above the first active rule (or at the end)
fn insert_block(lines: &[String], block: &[String]) -> Vec<String> {
    let at = lines.iter().position(|l| is_active(l)).unwrap_or(lines.len());
    let mut out = lines[..at].to_vec();
    out.extend_from_slice(block);
    out.extend_from_slice(&lines[at..]);
    out
}

impl Resource for PgHbaRule {
    fn id(&self) -> String {
        format!("auth-rule:{}", self.key())
    }

    fn description(&self) -> String {
        format!("Password login for {} on {}", self.role, self.database)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::AuthRule
    }

    fn requires(&self) -> Vec<String> {
        vec![PgRole::id_for(&self.role)]
    }

    fn current_state(&self) -> Result<ResourceState> {
        let lines = Self::read(&self.path()?)?;
        let (rest, found) = take_block(&lines, &self.block());

        let Some((start, block)) = found else {
            return Ok(ResourceState::Absent);
        };

        let first_active = rest.iter().position(|l| is_active(l)).unwrap_or(rest.len());
        if block == self.block() && start <= first_active {
            Ok(self.desired_state())
        } else {
            Ok(ResourceState::Modified {
                from: "stale or shadowed block".to_string(),
                to: "managed".to_string(),
            })
        }
    }

    fn desired_state(&self) -> ResourceState {
        ResourceState::Present {
            details: Some("managed".to_string()),
        }
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<()> {
        let path = self.path()?;
        let lines = Self::read(&path)?;
        let meta = fs::metadata(&path)?;

        let (rest, _) = take_block(&lines, &self.block());
        let mut content = insert_block(&rest, &self.block()).join("\n");
        content.push('\n');

        write_atomic(&path, content.as_bytes(), meta.permissions().mode() & 0o7777)?;
        std::os::unix::fs::chown(&path, Some(meta.uid()), Some(meta.gid()))
            .with_context(|| format!("Could not restore ownership of {}", path.display()))?;

        ctx.request(RELOAD_POSTGRES);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::Shell;
    use crate::runner::fake::FakeRunner;
    use declarative::{ReconcileOutcome, reconcile};
    use std::sync::Arc;

    const STOCK: &str = "\
# Database administrative login by Unix domain socket
local   all             postgres                                peer

# TYPE  DATABASE        USER            ADDRESS                 METHOD
local   all             all                                     peer
host    all             all             127.0.0.1/32            scram-sha-256
";

    fn rule(path: &Path) -> (PgHbaRule, Arc<FakeRunner>) {
        let fake = Arc::new(FakeRunner::new());
        let psql = Psql::new(Shell::shared(fake.clone()), "postgres");
        (
            PgHbaRule::new("app_db", "app_user", Some(path.to_path_buf()), psql),
            fake,
        )
    }

    #[test]
    fn test_inserts_above_first_active_rule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_hba.conf");
        fs::write(&path, STOCK).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
        let (rule, _) = rule(&path);

        let mut ctx = ApplyContext::default();
        assert_eq!(reconcile(&rule, &mut ctx).unwrap(), ReconcileOutcome::Created);
        assert_eq!(ctx.post_actions, vec![RELOAD_POSTGRES.to_string()]);

        let content = fs::read_to_string(&path).unwrap();
        let begin = content.find("# BEGIN stackup").unwrap();
        let peer = content.find("local   all             postgres").unwrap();
        assert!(begin < peer);
        assert!(content.contains("127.0.0.1/32"));
        assert!(content.contains("scram-sha-256"));

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);

        let mut ctx = ApplyContext::default();
        assert_eq!(reconcile(&rule, &mut ctx).unwrap(), ReconcileOutcome::Unchanged);
        assert!(ctx.post_actions.is_empty());
    }

    #[test]
    fn test_shadowed_block_is_moved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_hba.conf");
        let (rule, _) = rule(&path);
        let mut content = STOCK.to_string();
        content.push_str(&rule.block().join("\n"));
        content.push('\n');
        fs::write(&path, content).unwrap();

        assert!(matches!(
            rule.current_state().unwrap(),
            ResourceState::Modified { .. }
        ));

        let mut ctx = ApplyContext::default();
        assert_eq!(reconcile(&rule, &mut ctx).unwrap(), ReconcileOutcome::Updated);
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("# BEGIN stackup").count(), 1);
    }

    #[test]
    fn test_missing_end_marker_keeps_foreign_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_hba.conf");
        let (rule, _) = rule(&path);
        let block = rule.block();
        let content = format!(
            "{}\n{}\nlocal   all             postgres                                peer\n\
             host    all             all             127.0.0.1/32            scram-sha-256\n",
            block[0], block[1]
        );
        fs::write(&path, content).unwrap();

        let mut ctx = ApplyContext::default();
        assert_eq!(reconcile(&rule, &mut ctx).unwrap(), ReconcileOutcome::Updated);

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("local   all             postgres"));
        assert!(content.contains("scram-sha-256"));
        assert_eq!(content.matches("# BEGIN stackup").count(), 1);
        assert_eq!(content.matches("# END stackup").count(), 1);
        assert_eq!(content.matches(block[1].as_str()).count(), 1);
        assert!(content.find("# END stackup").unwrap() < content.find("postgres").unwrap());
    }

    #[test]
    fn test_asks_server_for_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_hba.conf");
        fs::write(&path, STOCK).unwrap();

        let fake = Arc::new(FakeRunner::new());
        fake.reply("SHOW hba_file", &path.display().to_string());
        let rule = PgHbaRule::new(
            "app_db",
            "app_user",
            None,
            Psql::new(Shell::shared(fake.clone()), "postgres"),
        );
        assert_eq!(rule.current_state().unwrap(), ResourceState::Absent);
        assert!(fake.called("SHOW hba_file"));
    }
}
