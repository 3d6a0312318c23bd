//! Health verifier
//!
//! One bounded-timeout probe per active layer. Verification is exhaustive:
//! a failing layer never stops the remaining probes. Overall health is the
//! AND of every probed layer being ok.

use chrono::{DateTime, Local};
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use ureq::Agent;

use crate::config::StackConfig;
use crate::run::Mode;
use crate::runner::{Cmd, Shell};

/// Address the probes target; the checks run on the deployed host itself
const LOCALHOST: &str = "127.0.0.1";

/// A probed layer of the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layer {
    Database,
    Backend,
    Proxy,
    FrontendAssets,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Database => "database",
            Self::Backend => "backend",
            Self::Proxy => "proxy",
            Self::FrontendAssets => "frontend-assets",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    /// Reachable but not answering as expected
    Degraded,
    /// Unreachable or missing
    Fail,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Fail => "fail",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub layer: Layer,
    pub status: HealthStatus,
    pub detail: String,
    pub checked_at: DateTime<Local>,
}

impl HealthCheckResult {
    pub fn new(layer: Layer, status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            layer,
            status,
            detail: detail.into(),
            checked_at: Local::now(),
        }
    }
}

/// Concurrent request probe against the proxy; informational only
#[derive(Debug, Clone, Serialize)]
pub struct LoadResult {
    pub requests: usize,
    pub succeeded: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub results: Vec<HealthCheckResult>,
    pub overall: bool,
    pub load: Option<LoadResult>,
}

impl HealthReport {
    pub fn from_results(results: Vec<HealthCheckResult>) -> Self {
        let overall = results.iter().all(|r| r.status == HealthStatus::Ok);
        Self {
            results,
            overall,
            load: None,
        }
    }

    /// Names of layers that are not ok
    pub fn unhealthy_layers(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.status != HealthStatus::Ok)
            .map(|r| r.layer.to_string())
            .collect()
    }
}

/// Layers probed for a mode
pub fn layers_for(mode: &Mode) -> Vec<Layer> {
    let mut layers = Vec::new();
    if mode.backend() {
        layers.push(Layer::Database);
        layers.push(Layer::Backend);
    }
    if mode.proxy() || mode.frontend() {
        layers.push(Layer::Proxy);
    }
    if mode.frontend() {
        layers.push(Layer::FrontendAssets);
    }
    layers
}

/// Runs the layer probes
pub struct HealthVerifier<'a> {
    config: &'a StackConfig,
    shell: Shell,
    agent: Agent,
    timeout: Duration,
}

impl<'a> HealthVerifier<'a> {
    pub fn new(config: &'a StackConfig, shell: Shell) -> Self {
        let timeout = Duration::from_secs(config.health.timeout_secs.max(1));
        let agent_config = Agent::config_builder()
            .timeout_connect(Some(timeout))
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            config,
            shell,
            agent: Agent::new_with_config(agent_config),
            timeout,
        }
    }

    /// Probe every layer the mode selects, plus the optional load probe
    pub fn verify(&self, mode: &Mode) -> HealthReport {
        let results = layers_for(mode)
            .into_iter()
            .map(|layer| {
                let result = self.probe(layer);
                log::debug!("health {}: {} ({})", layer, result.status, result.detail);
                result
            })
            .collect();

        let mut report = HealthReport::from_results(results);
        if mode.proxy() || mode.frontend() {
            report.load = self.load_probe();
        }
        report
    }

    pub fn probe(&self, layer: Layer) -> HealthCheckResult {
        let (status, detail) = match layer {
            Layer::Database => self.probe_database(),
            Layer::Backend => http_probe(&self.agent, &self.backend_url()),
            Layer::Proxy => http_probe(&self.agent, &self.proxy_url()),
            Layer::FrontendAssets => self.probe_assets(),
        };
        HealthCheckResult::new(layer, status, detail)
    }

    fn backend_url(&self) -> String {
        format!(
            "http://{LOCALHOST}:{}{}",
            self.config.backend.port, self.config.backend.health_path
        )
    }

    fn proxy_url(&self) -> String {
        format!("http://{LOCALHOST}:{}/", self.config.proxy.listen_port)
    }

    fn probe_database(&self) -> (HealthStatus, String) {
        let db = &self.config.database;
        let password = match db.password() {
            Ok(p) => p,
            Err(e) => return (HealthStatus::Fail, format!("{e:#}")),
        };
        let cmd = Cmd::new("psql")
            .args(["-X", "-tA", "-h", &db.host, "-p", &db.port.to_string()])
            .args(["-U", &db.user, "-d", &db.name, "-c", "SELECT 1"])
            .env("PGPASSWORD", password)
            .env("PGCONNECT_TIMEOUT", self.timeout.as_secs().to_string());

        match self.shell.output(&cmd) {
            Ok(out) if out.success && out.stdout_str().trim() == "1" => (
                HealthStatus::Ok,
                format!("SELECT 1 on {} as {}", db.name, db.user),
            ),
            Ok(out) if out.success => (
                HealthStatus::Degraded,
                format!("unexpected reply: {}", out.stdout_str().trim()),
            ),
            Ok(out) => (
                HealthStatus::Fail,
                crate::runner::stderr_tail(&out.stderr_str()),
            ),
            Err(e) => (HealthStatus::Fail, format!("{e:#}")),
        }
    }

    fn probe_assets(&self) -> (HealthStatus, String) {
        let entry = self.config.frontend.served_entry();
        match std::fs::metadata(&entry) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                (HealthStatus::Ok, format!("{} present", entry.display()))
            }
            Ok(_) => (
                HealthStatus::Degraded,
                format!("{} is empty or not a file", entry.display()),
            ),
            Err(_) => (HealthStatus::Fail, format!("{} missing", entry.display())),
        }
    }

    /// Fire `load_requests` GETs at the proxy through a bounded pool
    fn load_probe(&self) -> Option<LoadResult> {
        let requests = self.config.health.load_requests;
        if requests == 0 {
            return None;
        }
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.health.load_concurrency.max(1))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                log::warn!("Load probe skipped: {e}");
                return None;
            }
        };

        let url = self.proxy_url();
        let started = Instant::now();
        let succeeded = pool.install(|| {
            (0..requests)
                .into_par_iter()
                .filter(|_| http_probe(&self.agent, &url).0 == HealthStatus::Ok)
                .count()
        });

        Some(LoadResult {
            requests,
            succeeded,
            elapsed: started.elapsed(),
        })
    }
}

/// GET a URL expecting HTTP 200
pub fn http_probe(agent: &Agent, url: &str) -> (HealthStatus, String) {
    match agent.get(url).call() {
        Ok(response) => {
            let code = response.status().as_u16();
            if code == 200 {
                (HealthStatus::Ok, format!("HTTP 200 from {url}"))
            } else {
                (HealthStatus::Degraded, format!("HTTP {code} from {url}"))
            }
        }
        Err(e) => (HealthStatus::Fail, format!("{url} unreachable: {e}")),
    }
}
