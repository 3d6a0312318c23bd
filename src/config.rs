//! Deployment configuration (`stackup.toml`)
//!
//! Every field has a default matching a stock Ubuntu host: the application
//! checked out under `/home/ubuntu/app` with `backend/` and `frontend/`
//! subdirectories, PostgreSQL on localhost, PM2 running as `ubuntu`, Nginx
//! serving `/var/www/<app>`.

use anyhow::{Context, Result, bail};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::paths;

/// Everything but RFC 3986 unreserved characters
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
});

/// The unified stackup configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub backend: BackendConfig,
    pub frontend: FrontendConfig,
    pub proxy: ProxyConfig,
    pub snapshots: SnapshotConfig,
    pub health: HealthConfig,
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application name, used for default paths and the vhost
    pub name: String,
    /// Checkout root
    pub root: String,
    /// Backend directory, relative to `root`
    pub backend_dir: String,
    /// Frontend directory, relative to `root`
    pub frontend_dir: String,
    /// Version-control remote pulled by `update`
    pub remote: String,
    pub branch: String,
    /// Unprivileged user owning the checkout and the PM2 daemon
    pub service_user: String,
    /// Home of `service_user` (defaults to `/home/<user>`)
    pub service_home: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "webapp".to_string(),
            root: "/home/ubuntu/app".to_string(),
            backend_dir: "backend".to_string(),
            frontend_dir: "frontend".to_string(),
            remote: "origin".to_string(),
            branch: "main".to_string(),
            service_user: "ubuntu".to_string(),
            service_home: None,
        }
    }
}

impl AppConfig {
    pub fn root_path(&self) -> PathBuf {
        paths::expand(&self.root)
    }

    pub fn backend_path(&self) -> PathBuf {
        paths::resolve(&self.root_path(), &self.backend_dir)
    }

    pub fn frontend_path(&self) -> PathBuf {
        paths::resolve(&self.root_path(), &self.frontend_dir)
    }

    pub fn service_home(&self) -> PathBuf {
        match &self.service_home {
            Some(home) => paths::expand(home),
            None if self.service_user == "root" => PathBuf::from("/root"),
            None => PathBuf::from("/home").join(&self.service_user),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub name: String,
    pub user: String,
    /// Plain password; prefer `password_env`
    pub password: Option<String>,
    /// Environment variable holding the password
    pub password_env: String,
    pub host: String,
    pub port: u16,
    /// OS user and role with superuser rights (peer auth)
    pub superuser: String,
    /// Directory of `.sql` migrations, relative to the backend directory
    pub migrations_dir: String,
    /// pg_hba.conf location (asked from the server when unset)
    pub hba_file: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "app_db".to_string(),
            user: "app_user".to_string(),
            password: None,
            password_env: "STACKUP_DB_PASSWORD".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            superuser: "postgres".to_string(),
            migrations_dir: "migrations".to_string(),
            hba_file: None,
        }
    }
}

impl DatabaseConfig {
    /// Resolve the password from config or environment
    pub fn password(&self) -> Result<String> {
        if let Some(password) = &self.password {
            return Ok(password.clone());
        }
        std::env::var(&self.password_env).with_context(|| {
            format!(
                "No database password: set [database].password or ${}",
                self.password_env
            )
        })
    }

    /// `postgresql://` connection URL, with user and password percent-encoded
    pub fn url(&self, password: &str) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            utf8_percent_encode(&self.user, USERINFO),
            utf8_percent_encode(password, USERINFO),
            self.host,
            self.port,
            self.name
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// PM2 process name
    pub process_name: String,
    /// Entry script, relative to the backend directory
    pub entry: String,
    pub port: u16,
    /// Liveness endpoint on the backend
    pub health_path: String,
    /// Environment file, relative to the backend directory
    pub env_file: String,
    pub node_env: String,
    /// Allowed cross-origin value (defaults to `http://<public host>`)
    pub cors_origin: Option<String>,
    /// Extra entries appended to the environment file
    pub extra_env: BTreeMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            process_name: "backend".to_string(),
            entry: "server.js".to_string(),
            port: 5000,
            health_path: "/api/health".to_string(),
            env_file: ".env".to_string(),
            node_env: "production".to_string(),
            cors_origin: None,
            extra_env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Build output directory, relative to the frontend directory
    pub build_dir: String,
    /// File the build must produce
    pub entry_artifact: String,
    /// Directory served by the reverse proxy
    pub web_root: String,
    /// Owner of the served files
    pub serving_user: String,
    /// npm script producing the build
    pub build_script: String,
    /// Environment passed to the build (e.g. `REACT_APP_API_URL`)
    pub build_env: BTreeMap<String, String>,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            build_dir: "build".to_string(),
            entry_artifact: "index.html".to_string(),
            web_root: "/var/www/webapp".to_string(),
            serving_user: "www-data".to_string(),
            build_script: "build".to_string(),
            build_env: BTreeMap::new(),
        }
    }
}

impl FrontendConfig {
    pub fn web_root_path(&self) -> PathBuf {
        paths::expand(&self.web_root)
    }

    pub fn served_entry(&self) -> PathBuf {
        self.web_root_path().join(&self.entry_artifact)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub site_name: String,
    pub sites_available: String,
    pub sites_enabled: String,
    /// Public hostname; discovered when unset
    pub server_name: Option<String>,
    pub listen_port: u16,
    /// Path prefix forwarded to the backend
    pub api_prefix: String,
    pub client_max_body_size: String,
    /// Remove the stock `default` site from sites-enabled
    pub disable_default_site: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            site_name: "webapp".to_string(),
            sites_available: "/etc/nginx/sites-available".to_string(),
            sites_enabled: "/etc/nginx/sites-enabled".to_string(),
            server_name: None,
            listen_port: 80,
            api_prefix: "/api".to_string(),
            client_max_body_size: "10m".to_string(),
            disable_default_site: true,
        }
    }
}

impl ProxyConfig {
    pub fn site_path(&self) -> PathBuf {
        paths::expand(&self.sites_available).join(&self.site_name)
    }

    pub fn enabled_path(&self) -> PathBuf {
        paths::expand(&self.sites_enabled).join(&self.site_name)
    }

    pub fn default_site_link(&self) -> PathBuf {
        paths::expand(&self.sites_enabled).join("default")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub dir: String,
    /// Snapshots kept after pruning
    pub retain: usize,
    /// Include a database dump
    pub include_database: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: "/var/backups/stackup".to_string(),
            retain: 5,
            include_database: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Wait before probing, for process-manager startup
    pub settle_secs: u64,
    /// Per-probe timeout
    pub timeout_secs: u64,
    /// Concurrent requests of the load probe (0 disables it)
    pub load_requests: usize,
    /// Worker threads for the load probe
    pub load_concurrency: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            settle_secs: 5,
            timeout_secs: 5,
            load_requests: 10,
            load_concurrency: 5,
        }
    }
}

// ============================================================================
// Loading & validation
// ============================================================================

impl StackConfig {
    /// Load config from an explicit path, the standard locations, or defaults
    ///
    /// Returns the file used, if any.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let path = match explicit {
            Some(p) => {
                if !p.is_file() {
                    bail!("Config file not found: {}", p.display());
                }
                Some(p.to_path_buf())
            }
            None => paths::find_config_file(),
        };

        let config = match &path {
            Some(p) => Self::from_file(p)?,
            None => {
                log::info!("No config file found, using built-in defaults");
                Self::default()
            }
        };

        config.validate()?;
        Ok((config, path))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid TOML in config file: {}", path.display()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("database.name", &self.database.name),
            ("database.user", &self.database.user),
            ("database.superuser", &self.database.superuser),
        ] {
            if !IDENTIFIER.is_match(value) {
                bail!("{field} must be a plain SQL identifier, got '{value}'");
            }
        }

        if self.backend.process_name.trim().is_empty() {
            bail!("backend.process_name must not be empty");
        }
        if self.snapshots.retain == 0 {
            bail!("snapshots.retain must be at least 1");
        }
        if self.health.load_requests > 0 && self.health.load_concurrency == 0 {
            bail!("health.load_concurrency must be at least 1");
        }
        for (field, value) in [
            ("backend.health_path", &self.backend.health_path),
            ("proxy.api_prefix", &self.proxy.api_prefix),
        ] {
            if !value.starts_with('/') {
                bail!("{field} must start with '/', got '{value}'");
            }
        }
        if self.proxy.site_name.contains('/') {
            bail!("proxy.site_name must be a file name");
        }

        Ok(())
    }

    /// Backend environment file location
    pub fn env_file_path(&self) -> PathBuf {
        paths::resolve(&self.app.backend_path(), &self.backend.env_file)
    }

    /// Migrations directory location
    pub fn migrations_path(&self) -> PathBuf {
        paths::resolve(&self.app.backend_path(), &self.database.migrations_dir)
    }

    /// Frontend build output location
    pub fn build_path(&self) -> PathBuf {
        paths::resolve(&self.app.frontend_path(), &self.frontend.build_dir)
    }
}
