//! Nginx virtual host resource

use anyhow::{Context, Result};
use declarative::{ApplyContext, Resource, ResourceKind, ResourceState};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use super::{file_fingerprint, fingerprint, write_atomic};

const SITE_MODE: u32 = 0o644;

/// Inputs of the generated server block
#[derive(Debug, Clone)]
pub struct VhostSpec {
    pub server_name: String,
    pub listen_port: u16,
    pub default_server: bool,
    pub web_root: PathBuf,
    pub index: String,
    pub api_prefix: String,
    pub backend_port: u16,
    pub client_max_body_size: String,
}

/// Render the server block: static SPA root plus an API proxy
pub fn render(spec: &VhostSpec) -> String {
    let default = if spec.default_server { " default_server" } else { "" };
    format!(
        "# Managed by stackup; local edits are overwritten on the next deploy
server {{
    listen {port}{default};
    listen [::]:{port}{default};
    server_name {server_name};

    root {root};
    index {index};
    client_max_body_size {body};

    location / {{
        try_files $uri $uri/ /{index};
    }}

    location {prefix} {{
        proxy_pass http://127.0.0.1:{backend};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection 'upgrade';
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_cache_bypass $http_upgrade;
    }}

    location ~* \\.(?:js|css|png|jpg|jpeg|gif|svg|ico|woff2?)$ {{
        expires 30d;
        add_header Cache-Control \"public, immutable\";
    }}
}}
",
        port = spec.listen_port,
        server_name = spec.server_name,
        root = spec.web_root.display(),
        index = spec.index,
        body = spec.client_max_body_size,
        prefix = spec.api_prefix,
        backend = spec.backend_port,
    )
}

/// A site file in sites-available, enabled by a symlink in sites-enabled
#[derive(Debug, Clone)]
pub struct NginxSite {
    pub name: String,
    pub available: PathBuf,
    pub enabled: PathBuf,
    content: String,
}

impl NginxSite {
    pub fn new(name: &str, available: PathBuf, enabled: PathBuf, content: String) -> Self {
        Self {
            name: name.to_string(),
            available,
            enabled,
            content,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    fn is_enabled(&self) -> bool {
        fs::read_link(&self.enabled).is_ok_and(|target| target == self.available)
    }

    fn state_details(fp: &str, enabled: bool) -> String {
        format!("{fp} {}", if enabled { "enabled" } else { "disabled" })
    }
}

impl Resource for NginxSite {
    fn id(&self) -> String {
        format!("vhost:{}", self.name)
    }

    fn description(&self) -> String {
        format!("Nginx site {}", self.name)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Vhost
    }

    fn current_state(&self) -> Result<ResourceState> {
        let Some(fp) = file_fingerprint(&self.available)? else {
            return Ok(ResourceState::Absent);
        };
        let current = Self::state_details(&fp, self.is_enabled());
        let desired = self.desired_state();
        Ok(match &desired {
            ResourceState::Present { details: Some(d) } if *d == current => desired,
            ResourceState::Present { details: Some(d) } => ResourceState::Modified {
                from: current,
                to: d.clone(),
            },
            _ => ResourceState::Unknown,
        })
    }

    fn desired_state(&self) -> ResourceState {
        let fp = fingerprint(self.content.as_bytes(), SITE_MODE);
        ResourceState::Present {
            details: Some(Self::state_details(&fp, true)),
        }
    }

    fn apply(&self, _ctx: &mut ApplyContext) -> Result<()> {
        write_atomic(&self.available, self.content.as_bytes(), SITE_MODE)?;

        if !self.is_enabled() {
            replace_link(&self.enabled, &self.available)?;
        }
        Ok(())
    }
}

/// Point `link` at `target`, replacing a stale link or file
fn replace_link(link: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::symlink_metadata(link).is_ok() {
        fs::remove_file(link)
            .with_context(|| format!("Could not replace {}", link.display()))?;
    }
    symlink(target, link).with_context(|| format!("Could not link {}", link.display()))
}

/// The stock `default` site would shadow a catch-all vhost
///
/// Only its symlink in sites-enabled is removed; the file in
/// sites-available stays so the change can be undone.
#[derive(Debug, Clone)]
pub struct DisabledSite {
    pub link: PathBuf,
}

impl Resource for DisabledSite {
    fn id(&self) -> String {
        format!("vhost-disabled:{}", self.link.display())
    }

    fn description(&self) -> String {
        format!("Disable {}", self.link.display())
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Vhost
    }

    fn current_state(&self) -> Result<ResourceState> {
        Ok(if fs::symlink_metadata(&self.link).is_ok() {
            ResourceState::Present {
                details: Some("enabled".to_string()),
            }
        } else {
            ResourceState::Absent
        })
    }

    fn desired_state(&self) -> ResourceState {
        ResourceState::Absent
    }

    fn apply(&self, _ctx: &mut ApplyContext) -> Result<()> {
        let meta = fs::symlink_metadata(&self.link)?;
        if !meta.file_type().is_symlink() {
            anyhow::bail!(
                "{} is not a symlink; refusing to remove it",
                self.link.display()
            );
        }
        fs::remove_file(&self.link)
            .with_context(|| format!("Could not remove {}", self.link.display()))
    }
}
