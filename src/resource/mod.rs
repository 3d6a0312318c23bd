//! Host resources reconciled by stackup
//!
//! Every kind is a probe/apply pair implementing [`declarative::Resource`]:
//! - State detection goes through the [`Shell`] or a plain file read
//! - Apply performs the smallest mutation reaching the desired state
//! - Nothing here deletes what it did not create
//!
//! SQL always travels on psql's stdin. Identifiers are validated at config
//! load and quoted again here; literals are quoted with [`quote_literal`].

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::runner::{Cmd, Shell};

pub mod auth_rule;
pub mod database;
pub mod env_file;
pub mod grant;
pub mod package;
pub mod process;
pub mod role;
pub mod vhost;

pub use auth_rule::PgHbaRule;
pub use database::PgDatabase;
pub use env_file::EnvFile;
pub use grant::PgGrant;
pub use package::{NpmGlobalPackage, SystemPackage};
pub use process::Pm2Process;
pub use role::PgRole;
pub use vhost::{DisabledSite, NginxSite, VhostSpec};

/// Maintenance database used for cluster-level queries
pub const MAINTENANCE_DB: &str = "postgres";

/// psql access as the database superuser (peer authentication)
#[derive(Debug, Clone)]
pub struct Psql {
    shell: Shell,
    superuser: String,
}

impl Psql {
    pub fn new(shell: Shell, superuser: &str) -> Self {
        Self {
            shell,
            superuser: superuser.to_string(),
        }
    }

    fn command(&self, database: &str, sql: &str) -> Cmd {
        Cmd::new("psql")
            .as_user(&self.superuser)
            .args(["-X", "-q", "-tA", "-v", "ON_ERROR_STOP=1", "-d", database])
            .stdin(sql)
    }

    /// Run SQL and return trimmed output
    pub fn query(&self, database: &str, sql: &str) -> Result<String> {
        self.shell.run_checked(&self.command(database, sql))
    }

    /// Whether a query returns at least one row
    pub fn exists(&self, database: &str, sql: &str) -> Result<bool> {
        Ok(!self.query(database, sql)?.is_empty())
    }

    pub fn execute(&self, database: &str, sql: &str) -> Result<()> {
        self.query(database, sql).map(|_| ())
    }
}

/// Quote a SQL string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote a SQL identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Content fingerprint used as file state details
pub fn fingerprint(content: &[u8], mode: u32) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(content);
    hasher.update(&(mode & 0o7777).to_le_bytes());
    let hash = hasher.finalize().to_hex();
    format!("{}/{:o}", &hash.as_str()[..16], mode & 0o7777)
}

/// Fingerprint of an existing file, `None` if it does not exist
pub fn file_fingerprint(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read(path).with_context(|| format!("Could not read {}", path.display()))?;
    let mode = fs::metadata(path)
        .with_context(|| format!("Could not stat {}", path.display()))?
        .permissions()
        .mode();
    Ok(Some(fingerprint(&content, mode)))
}

/// Write a file through a temporary sibling and rename it into place
///
/// The mode is set before the rename so the content is never visible with
/// wider permissions.
pub fn write_atomic(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Could not create {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.stackup-tmp"));

    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .with_context(|| format!("Could not write {}", tmp.display()))?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("Could not move {} into place", path.display()))?;
    Ok(())
}
