//! Reconciliation planning
//!
//! Turns the configuration and the selected mode into an
//! [`ExecutionPlan`] whose resources declare their dependencies explicitly.

use anyhow::Result;
use declarative::ExecutionPlan;
use std::path::PathBuf;

use crate::config::StackConfig;
use crate::resource::{
    DisabledSite, EnvFile, NginxSite, PgDatabase, PgGrant, PgHbaRule, PgRole, Pm2Process, Psql,
    VhostSpec, vhost,
};
use crate::run::{DeploymentRun, Flow};
use crate::runner::{Shell, is_root};

/// A managed file with its rendered content
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub path: PathBuf,
    pub content: String,
    /// Values must not be printed
    pub secret: bool,
}

/// Resources of one run plus the files they write, for previews
#[derive(Debug)]
pub struct Plan {
    pub resources: ExecutionPlan,
    pub files: Vec<PlannedFile>,
}

/// Build the plan for a run
///
/// Deploy: database, role, grant, auth rule and environment file when the
/// backend is selected; vhost unless the proxy is skipped.
/// Update: environment file and vhost only.
pub fn build(config: &StackConfig, run: &DeploymentRun, shell: &Shell) -> Result<Plan> {
    let mut resources = ExecutionPlan::new();
    let mut files = Vec::new();
    let mode = &run.mode;

    if mode.backend() {
        let password = config.database.password()?;
        let db = &config.database;

        if run.flow == Flow::Deploy {
            let psql = Psql::new(shell.clone(), &db.superuser);
            resources.push(Box::new(PgDatabase::new(&db.name, psql.clone())));
            resources.push(Box::new(PgRole::new(&db.user, &password, psql.clone())));
            resources.push(Box::new(PgGrant::new(&db.name, &db.user, psql.clone())));
            resources.push(Box::new(PgHbaRule::new(
                &db.name,
                &db.user,
                db.hba_file.as_deref().map(crate::paths::expand),
                psql,
            )));
        }

        let env_file = env_file(config, &run.public_host, &password, shell);
        files.push(PlannedFile {
            path: env_file.path.clone(),
            content: env_file.render(),
            secret: true,
        });
        resources.push(Box::new(env_file));
    }

    if mode.proxy() {
        let site = nginx_site(config, &run.public_host);
        files.push(PlannedFile {
            path: site.available.clone(),
            content: site.content().to_string(),
            secret: false,
        });
        resources.push(Box::new(site));

        if config.proxy.disable_default_site {
            resources.push(Box::new(DisabledSite {
                link: config.proxy.default_site_link(),
            }));
        }
    }

    log::debug!(
        "Planned {} resources for {} ({})",
        resources.total_resources(),
        run.flow,
        mode.describe()
    );
    Ok(Plan { resources, files })
}

/// Key/value pairs of the backend environment file
pub fn env_entries(config: &StackConfig, public_host: &str, password: &str) -> Vec<(String, String)> {
    let db = &config.database;
    let backend = &config.backend;
    let cors = backend
        .cors_origin
        .clone()
        .unwrap_or_else(|| format!("http://{public_host}"));

    let mut entries: Vec<(String, String)> = [
        ("DB_HOST", db.host.clone()),
        ("DB_PORT", db.port.to_string()),
        ("DB_NAME", db.name.clone()),
        ("DB_USER", db.user.clone()),
        ("DB_PASSWORD", password.to_string()),
        ("DATABASE_URL", db.url(password)),
        ("PORT", backend.port.to_string()),
        ("NODE_ENV", backend.node_env.clone()),
        ("CORS_ORIGIN", cors),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    for (key, value) in &backend.extra_env {
        match entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1.clone_from(value),
            None => entries.push((key.clone(), value.clone())),
        }
    }
    entries
}

pub fn env_file(config: &StackConfig, public_host: &str, password: &str, shell: &Shell) -> EnvFile {
    let file = EnvFile::new(
        config.env_file_path(),
        env_entries(config, public_host, password),
        shell.clone(),
    );
    // Only root can hand the file to the service user
    if is_root() {
        file.owned_by(&config.app.service_user)
    } else {
        file
    }
}

pub fn nginx_site(config: &StackConfig, public_host: &str) -> NginxSite {
    let proxy = &config.proxy;
    let spec = VhostSpec {
        server_name: public_host.to_string(),
        listen_port: proxy.listen_port,
        default_server: proxy.disable_default_site,
        web_root: config.frontend.web_root_path(),
        index: config.frontend.entry_artifact.clone(),
        api_prefix: proxy.api_prefix.clone(),
        backend_port: config.backend.port,
        client_max_body_size: proxy.client_max_body_size.clone(),
    };
    NginxSite::new(
        &proxy.site_name,
        proxy.site_path(),
        proxy.enabled_path(),
        vhost::render(&spec),
    )
}

/// The supervised backend process, started after its environment file
pub fn backend_process(config: &StackConfig, shell: &Shell) -> Pm2Process {
    Pm2Process::new(
        &config.backend.process_name,
        &config.backend.entry,
        config.app.backend_path(),
        &config.app.service_user,
        shell.clone(),
    )
    .after_env_file(EnvFile::id_for(&config.env_file_path()))
}
