//! Snapshot manager
//!
//! Captures mutable state into `<root>/<YYYYMMDD_HHMMSS>[_N]/` before any
//! mutation:
//! - Files and directory trees are copied verbatim (minus `node_modules`
//!   and `.git`)
//! - Databases are dumped to `<label>.sql`
//! - `snapshot.json` records what was captured and what was skipped
//!
//! Snapshots are never modified after creation. Retention keeps the newest
//! N and deletes the rest.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use walkdir::WalkDir;

use crate::runner::{Cmd, Shell};

/// Manifest file name inside each snapshot
pub const MANIFEST: &str = "snapshot.json";

/// Label of the captured backend tree (stored without `node_modules`)
pub const BACKEND: &str = "backend";

/// Label of the captured PostgreSQL client authentication file
pub const PG_HBA: &str = "pg-hba";

/// Directories never copied into a snapshot
const SKIP_DIRS: &[&str] = &["node_modules", ".git"];

const ID_FORMAT: &str = "%Y%m%d_%H%M%S";

static SNAPSHOT_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{8}_\d{6})(?:_(\d+))?$").expect("snapshot id pattern is valid")
});

/// Something to capture
#[derive(Debug, Clone)]
pub enum CaptureTarget {
    /// A file or directory tree
    Path { label: String, path: PathBuf },
    /// A database dumped with pg_dump
    DatabaseDump { label: String, database: String },
}

impl CaptureTarget {
    pub fn path(label: &str, path: impl Into<PathBuf>) -> Self {
        Self::Path {
            label: label.to_string(),
            path: path.into(),
        }
    }

    pub fn database(label: &str, database: &str) -> Self {
        Self::DatabaseDump {
            label: label.to_string(),
            database: database.to_string(),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Path { label, .. } | Self::DatabaseDump { label, .. } => label,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapturedKind {
    File,
    Directory,
    DatabaseDump,
}

/// One captured item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Captured {
    pub label: String,
    /// Original location (path or database name)
    pub source: String,
    /// Name inside the snapshot directory
    pub stored: String,
    pub kind: CapturedKind,
    pub bytes: u64,
}

/// A target that had nothing to capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skipped {
    pub label: String,
    pub reason: String,
}

/// A point-in-time capture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub created_at: DateTime<Local>,
    pub contents: Vec<Captured>,
    #[serde(default)]
    pub skipped: Vec<Skipped>,
    #[serde(skip)]
    pub dir: PathBuf,
}

impl Snapshot {
    /// Total captured bytes
    pub fn size(&self) -> u64 {
        self.contents.iter().map(|c| c.bytes).sum()
    }

    /// Location of a captured item
    pub fn stored_path(&self, item: &Captured) -> PathBuf {
        self.dir.join(&item.stored)
    }

    /// Ordering key: creation time, then collision suffix
    fn sort_key(&self) -> (DateTime<Local>, u32) {
        let suffix = SNAPSHOT_ID
            .captures(&self.id)
            .and_then(|c| c.get(2))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        (self.created_at, suffix)
    }
}

/// Creates, lists and prunes snapshots under one root
pub struct SnapshotManager {
    root: PathBuf,
    shell: Shell,
    superuser: String,
}

impl SnapshotManager {
    pub fn new(root: PathBuf, shell: Shell, superuser: &str) -> Self {
        Self {
            root,
            shell,
            superuser: superuser.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Capture all targets into a new snapshot
    ///
    /// Missing targets are skipped with a warning. Any other failure removes
    /// the partial directory so it never counts as a restore point.
    pub fn snapshot(&self, targets: &[CaptureTarget]) -> Result<Snapshot> {
        let created_at = Local::now();
        let (id, dir) = self.create_dir(&created_at)?;

        let mut snapshot = Snapshot {
            id,
            created_at,
            contents: Vec::new(),
            skipped: Vec::new(),
            dir,
        };

        self.fill(&mut snapshot, targets)?;

        log::info!(
            "Snapshot {} captured {} item(s), skipped {}",
            snapshot.id,
            snapshot.contents.len(),
            snapshot.skipped.len()
        );
        Ok(snapshot)
    }

    /// Capture targets and write the manifest, removing the directory on failure
    fn fill(&self, snapshot: &mut Snapshot, targets: &[CaptureTarget]) -> Result<()> {
        let result = self
            .capture_all(snapshot, targets)
            .and_then(|()| write_manifest(snapshot));
        if result.is_err() {
            let _ = fs::remove_dir_all(&snapshot.dir);
        }
        result
    }

    fn create_dir(&self, now: &DateTime<Local>) -> Result<(String, PathBuf)> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Could not create {}", self.root.display()))?;
        // snapshots hold credentials
        fs::set_permissions(&self.root, fs::Permissions::from_mode(0o700))?;

        let base = now.format(ID_FORMAT).to_string();
        let mut n = 0u32;
        loop {
            let id = if n == 0 {
                base.clone()
            } else {
                format!("{base}_{n}")
            };
            let dir = self.root.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
                Err(e) => {
                    return Err(e).with_context(|| format!("Could not create {}", dir.display()));
                }
            }
        }
    }

    fn capture_all(&self, snapshot: &mut Snapshot, targets: &[CaptureTarget]) -> Result<()> {
        for target in targets {
            let stored = stored_name(target);
            let result = match target {
                CaptureTarget::Path { label, path } => {
                    capture_path(label, path, &snapshot.dir.join(&stored), &stored)?
                }
                CaptureTarget::DatabaseDump { label, database } => {
                    self.capture_database(label, database, &snapshot.dir.join(&stored), &stored)?
                }
            };
            match result {
                Ok(item) => snapshot.contents.push(item),
                Err(reason) => {
                    log::warn!("Snapshot skipped {}: {reason}", target.label());
                    snapshot.skipped.push(Skipped {
                        label: target.label().to_string(),
                        reason,
                    });
                }
            }
        }
        Ok(())
    }

    fn capture_database(
        &self,
        label: &str,
        database: &str,
        dest: &Path,
        stored: &str,
    ) -> Result<Result<Captured, String>> {
        let output = self.shell.output(
            &Cmd::new("pg_dump")
                .as_user(&self.superuser)
                .args(["--clean", "--if-exists", "-d", database]),
        )?;
        if !output.success {
            let stderr = output.stderr_str();
            if stderr.contains("does not exist") {
                return Ok(Err(format!("database {database} does not exist yet")));
            }
            bail!(
                "pg_dump of {database} failed: {}",
                crate::runner::stderr_tail(&stderr)
            );
        }
        fs::write(dest, &output.stdout)
            .with_context(|| format!("Could not write {}", dest.display()))?;
        fs::set_permissions(dest, fs::Permissions::from_mode(0o600))?;

        Ok(Ok(Captured {
            label: label.to_string(),
            source: database.to_string(),
            stored: stored.to_string(),
            kind: CapturedKind::DatabaseDump,
            bytes: output.stdout.len() as u64,
        }))
    }

    /// Existing snapshots, newest first
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Could not read {}", self.root.display()));
            }
        };

        let mut snapshots: Vec<Snapshot> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| load(&e.path()))
            .collect();

        snapshots.sort_by_key(|s| std::cmp::Reverse(s.sort_key()));
        Ok(snapshots)
    }

    /// Keep the newest `retain` snapshots and delete the rest
    ///
    /// Returns the ids removed.
    pub fn prune(&self, retain: usize) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for old in self.list()?.into_iter().skip(retain) {
            fs::remove_dir_all(&old.dir)
                .with_context(|| format!("Could not remove snapshot {}", old.id))?;
            log::info!("Pruned snapshot {}", old.id);
            removed.push(old.id);
        }
        Ok(removed)
    }
}

fn write_manifest(snapshot: &Snapshot) -> Result<()> {
    let manifest = serde_json::to_string_pretty(snapshot).context("Could not encode manifest")?;
    fs::write(snapshot.dir.join(MANIFEST), manifest)
        .with_context(|| format!("Could not write {MANIFEST}"))
}

/// Load a snapshot directory, falling back to its name when the manifest is unreadable
fn load(dir: &Path) -> Option<Snapshot> {
    let name = dir.file_name()?.to_string_lossy().to_string();
    let caps = SNAPSHOT_ID.captures(&name)?;

    if let Ok(text) = fs::read_to_string(dir.join(MANIFEST))
        && let Ok(mut snapshot) = serde_json::from_str::<Snapshot>(&text)
    {
        snapshot.dir = dir.to_path_buf();
        return Some(snapshot);
    }

    let naive = NaiveDateTime::parse_from_str(caps.get(1)?.as_str(), ID_FORMAT).ok()?;
    let created_at = Local.from_local_datetime(&naive).earliest()?;
    Some(Snapshot {
        id: name,
        created_at,
        contents: Vec::new(),
        skipped: Vec::new(),
        dir: dir.to_path_buf(),
    })
}

/// File name used inside the snapshot for a target
fn stored_name(target: &CaptureTarget) -> String {
    let safe: String = target
        .label()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    match target {
        CaptureTarget::DatabaseDump { .. } => format!("{safe}.sql"),
        CaptureTarget::Path { .. } => safe,
    }
}

fn capture_path(
    label: &str,
    path: &Path,
    dest: &Path,
    stored: &str,
) -> Result<Result<Captured, String>> {
    let Ok(meta) = fs::metadata(path) else {
        return Ok(Err(format!("{} does not exist", path.display())));
    };

    let (kind, bytes) = if meta.is_dir() {
        (CapturedKind::Directory, copy_tree(path, dest, SKIP_DIRS)?)
    } else {
        let bytes = fs::copy(path, dest)
            .with_context(|| format!("Could not copy {}", path.display()))?;
        (CapturedKind::File, bytes)
    };

    Ok(Ok(Captured {
        label: label.to_string(),
        source: path.display().to_string(),
        stored: stored.to_string(),
        kind,
        bytes,
    }))
}

/// Copy a directory tree, skipping entries named in `skip`
///
/// Symlinks are recreated rather than followed. Returns bytes copied.
pub fn copy_tree(src: &Path, dst: &Path, skip: &[&str]) -> Result<u64> {
    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !skip.iter().any(|s| e.file_name() == OsStr::new(s)));

    let mut bytes = 0;
    for entry in walker {
        let entry = entry.context("Failed to read directory entry")?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Could not create {}", target.display()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            symlink(&link, &target)
                .with_context(|| format!("Could not link {}", target.display()))?;
        } else {
            bytes += fs::copy(entry.path(), &target)
                .with_context(|| format!("Could not copy {}", entry.path().display()))?;
        }
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::{FakeRunner, fail};
    use std::sync::Arc;

    fn manager(root: &Path) -> (SnapshotManager, Arc<FakeRunner>) {
        let fake = Arc::new(FakeRunner::new());
        (
            SnapshotManager::new(root.to_path_buf(), Shell::shared(fake.clone()), "postgres"),
            fake,
        )
    }

    #[test]
    fn test_captures_files_trees_and_dumps() {
        let tmp = tempfile::tempdir().unwrap();
        let web = tmp.path().join("www");
        fs::create_dir_all(web.join("static")).unwrap();
        fs::create_dir_all(web.join("node_modules").join("x")).unwrap();
        fs::write(web.join("index.html"), "<html>").unwrap();
        fs::write(web.join("static").join("app.js"), "js").unwrap();
        fs::write(web.join("node_modules").join("x").join("big.js"), "big").unwrap();
        let env = tmp.path().join(".env");
        fs::write(&env, "PORT=5000\n").unwrap();

        let (mgr, fake) = manager(&tmp.path().join("backups"));
        fake.reply("pg_dump", "-- dump\nCREATE TABLE users ();\n");

        let snap = mgr
            .snapshot(&[
                CaptureTarget::path("web root", &web),
                CaptureTarget::path("env", &env),
                CaptureTarget::path("vhost", tmp.path().join("missing.conf")),
                CaptureTarget::database("app_db", "app_db"),
            ])
            .unwrap();

        assert_eq!(snap.contents.len(), 3);
        assert_eq!(snap.skipped.len(), 1);
        assert_eq!(snap.skipped[0].label, "vhost");
        assert!(snap.dir.join("web_root").join("static").join("app.js").exists());
        assert!(!snap.dir.join("web_root").join("node_modules").exists());
        assert_eq!(fs::read_to_string(snap.dir.join("env")).unwrap(), "PORT=5000\n");
        assert!(
            fs::read_to_string(snap.dir.join("app_db.sql"))
                .unwrap()
                .contains("CREATE TABLE")
        );
        assert!(snap.dir.join(MANIFEST).exists());

        let listed = mgr.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].contents, snap.contents);
    }

    #[test]
    fn test_missing_database_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, fake) = manager(tmp.path());
        fake.reject("pg_dump", "pg_dump: error: database \"app_db\" does not exist");

        let snap = mgr
            .snapshot(&[CaptureTarget::database("app_db", "app_db")])
            .unwrap();
        assert!(snap.contents.is_empty());
        assert_eq!(snap.skipped.len(), 1);
    }

    #[test]
    fn test_dump_failure_removes_partial_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, fake) = manager(tmp.path());
        fake.on("pg_dump", |_| fail("connection refused"));

        assert!(mgr.snapshot(&[CaptureTarget::database("db", "db")]).is_err());
        assert!(mgr.list().unwrap().is_empty());
    }

    #[test]
    fn test_manifest_failure_removes_partial_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let env = tmp.path().join(".env");
        fs::write(&env, "PORT=5000\n").unwrap();
        let (mgr, _) = manager(&tmp.path().join("backups"));

        let created_at = Local::now();
        let (id, dir) = mgr.create_dir(&created_at).unwrap();
        // occupy the manifest name so writing it fails after the capture
        fs::create_dir(dir.join(MANIFEST)).unwrap();
        let mut snapshot = Snapshot {
            id,
            created_at,
            contents: Vec::new(),
            skipped: Vec::new(),
            dir: dir.clone(),
        };

        let err = mgr
            .fill(&mut snapshot, &[CaptureTarget::path("env", &env)])
            .unwrap_err();
        assert!(err.to_string().contains(MANIFEST));
        assert!(!dir.exists());
        assert!(mgr.list().unwrap().is_empty());
    }

    #[test]
    fn test_same_second_ids_get_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, _) = manager(tmp.path());
        let now = Local::now();
        let (a, _) = mgr.create_dir(&now).unwrap();
        let (b, _) = mgr.create_dir(&now).unwrap();
        let (c, _) = mgr.create_dir(&now).unwrap();
        assert_eq!(b, format!("{a}_1"));
        assert_eq!(c, format!("{a}_2"));
    }

    #[test]
    fn test_retention_keeps_newest() {
        let tmp = tempfile::tempdir().unwrap();
        let (mgr, _) = manager(&tmp.path().join("snapshots"));

        let retain = 5;
        let extra = 3;
        let ids: Vec<String> = (0..retain + extra)
            .map(|_| mgr.snapshot(&[]).unwrap().id)
            .collect();

        let removed = mgr.prune(retain).unwrap();
        assert_eq!(removed.len(), extra);

        let mut kept: Vec<String> = mgr.list().unwrap().into_iter().map(|s| s.id).collect();
        kept.reverse();
        assert_eq!(kept, ids[extra..].to_vec());
    }

    #[test]
    fn test_list_falls_back_to_directory_name() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("20240101_120000")).unwrap();
        fs::create_dir_all(tmp.path().join("20240301_090000")).unwrap();
        fs::create_dir_all(tmp.path().join("not-a-snapshot")).unwrap();
        let (mgr, _) = manager(tmp.path());

        let ids: Vec<String> = mgr.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["20240301_090000", "20240101_120000"]);
    }

    #[test]
    fn test_stored_names() {
        assert_eq!(
            stored_name(&CaptureTarget::path("nginx site", "/etc/nginx/x")),
            "nginx_site"
        );
        assert_eq!(stored_name(&CaptureTarget::database("app-db", "app")), "app-db.sql");
    }
}
