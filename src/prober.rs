//! Precondition prober
//!
//! Checks every required tool before anything is mutated. Missing tools
//! with a safe install action are installed through the package resources
//! and checked again. The probe never stops at the first problem; the
//! report lists everything that is missing so it can be fixed in one pass.

use declarative::{ApplyContext, Resource, reconcile};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::error::DeployError;
use crate::resource::{NpmGlobalPackage, SystemPackage};
use crate::run::{Flow, Mode};
use crate::runner::{Cmd, Shell};
use crate::ui;

static VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("version pattern is valid")
});

/// A dotted version number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// First version number found in tool output (`v20.11.0`, `nginx/1.24.0`)
    pub fn parse(text: &str) -> Option<Self> {
        let caps = VERSION.captures(text)?;
        let part = |i: usize| {
            caps.get(i)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0)
        };
        Some(Self::new(part(1), part(2), part(3)))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// How a missing tool can be installed without operator input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallAction {
    Apt(Vec<&'static str>),
    NpmGlobal(&'static str),
}

impl InstallAction {
    /// Shell command an operator would run
    pub fn command(&self) -> String {
        match self {
            Self::Apt(pkgs) => format!("sudo apt-get install -y {}", pkgs.join(" ")),
            Self::NpmGlobal(pkg) => format!("sudo npm install -g {pkg}"),
        }
    }

    fn resources(&self, shell: &Shell) -> Vec<Box<dyn Resource>> {
        match self {
            Self::Apt(pkgs) => pkgs
                .iter()
                .map(|p| Box::new(SystemPackage::new(p, shell.clone())) as Box<dyn Resource>)
                .collect(),
            Self::NpmGlobal(pkg) => vec![Box::new(NpmGlobalPackage::new(pkg, shell.clone()))],
        }
    }
}

/// A required external tool
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub binary: &'static str,
    pub version_args: &'static [&'static str],
    pub min_version: Option<Version>,
    pub install: Option<InstallAction>,
    /// Remediation shown when the tool cannot be installed automatically
    pub hint: &'static str,
}

/// Tools needed by a run of the given flow and mode
pub fn required_tools(flow: Flow, mode: &Mode) -> Vec<ToolSpec> {
    let mut tools = Vec::new();

    if flow == Flow::Update {
        tools.push(ToolSpec {
            name: "git",
            binary: "git",
            version_args: &["--version"],
            min_version: None,
            install: Some(InstallAction::Apt(vec!["git"])),
            hint: "sudo apt-get install -y git",
        });
    }

    tools.push(ToolSpec {
        name: "node",
        binary: "node",
        version_args: &["--version"],
        min_version: Some(Version::new(18, 0, 0)),
        install: None,
        hint: "curl -fsSL https://deb.nodesource.com/setup_20.x | sudo -E bash - && sudo apt-get install -y nodejs",
    });
    tools.push(ToolSpec {
        name: "npm",
        binary: "npm",
        version_args: &["--version"],
        min_version: None,
        install: None,
        hint: "npm ships with Node.js; reinstall the nodejs package",
    });

    if mode.backend() {
        tools.push(ToolSpec {
            name: "pm2",
            binary: "pm2",
            version_args: &["--version"],
            min_version: None,
            install: Some(InstallAction::NpmGlobal("pm2")),
            hint: "sudo npm install -g pm2",
        });
        tools.push(ToolSpec {
            name: "psql",
            binary: "psql",
            version_args: &["--version"],
            min_version: None,
            install: Some(InstallAction::Apt(vec!["postgresql", "postgresql-contrib"])),
            hint: "sudo apt-get install -y postgresql postgresql-contrib",
        });
    }

    if mode.frontend() || mode.proxy() {
        tools.push(ToolSpec {
            name: "nginx",
            binary: "nginx",
            version_args: &["-v"],
            min_version: None,
            install: Some(InstallAction::Apt(vec!["nginx"])),
            hint: "sudo apt-get install -y nginx",
        });
    }

    tools
}

/// Probe result for one tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStatus {
    Present { version: Option<Version> },
    Installed { version: Option<Version> },
    MissingFatal { reason: String },
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub name: String,
    pub status: ToolStatus,
    pub hint: Option<String>,
}

impl ToolResult {
    pub fn is_missing(&self) -> bool {
        matches!(self.status, ToolStatus::MissingFatal { .. })
    }
}

/// Per-tool outcome of a probe, in probing order
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub results: Vec<ToolResult>,
}

impl ProbeReport {
    pub fn missing(&self) -> Vec<&ToolResult> {
        self.results.iter().filter(|r| r.is_missing()).collect()
    }

    /// Record a non-tool precondition that failed
    pub fn push_fatal(&mut self, name: &str, reason: &str, hint: Option<&str>) {
        self.results.push(ToolResult {
            name: name.to_string(),
            status: ToolStatus::MissingFatal {
                reason: reason.to_string(),
            },
            hint: hint.map(str::to_string),
        });
    }

    /// Print one line per result
    pub fn print(&self) {
        for result in &self.results {
            match &result.status {
                ToolStatus::Present { version } => {
                    ui::success(&format!("{} {}", result.name, describe(*version)));
                }
                ToolStatus::Installed { version } => {
                    ui::success(&format!("{} {} (installed)", result.name, describe(*version)));
                }
                ToolStatus::MissingFatal { reason } => {
                    ui::error(&format!("{}: {reason}", result.name));
                }
            }
        }
    }

    /// Fail with every unmet precondition
    pub fn ensure_ok(&self) -> Result<(), DeployError> {
        let missing: Vec<String> = self.missing().iter().map(|r| r.name.clone()).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(DeployError::Precondition { missing })
        }
    }
}

fn describe(version: Option<Version>) -> String {
    version.map_or_else(|| "(version unknown)".to_string(), |v| v.to_string())
}

/// Checks tools on the host
pub struct Prober {
    shell: Shell,
    allow_install: bool,
}

impl Prober {
    pub fn new(shell: Shell, allow_install: bool) -> Self {
        Self {
            shell,
            allow_install,
        }
    }

    /// Probe every tool; never stops early
    pub fn probe(&self, tools: &[ToolSpec]) -> ProbeReport {
        let mut report = ProbeReport::default();
        for tool in tools {
            let status = self.probe_tool(tool);
            log::debug!("probe {}: {:?}", tool.name, status);
            let hint = matches!(status, ToolStatus::MissingFatal { .. })
                .then(|| tool.hint.to_string());
            report.results.push(ToolResult {
                name: tool.name.to_string(),
                status,
                hint,
            });
        }
        report
    }

    fn probe_tool(&self, tool: &ToolSpec) -> ToolStatus {
        if self.shell.which(tool.binary).is_some() {
            let version = self.version(tool);
            return match self.check_minimum(tool, version) {
                Ok(()) => ToolStatus::Present { version },
                Err(reason) => ToolStatus::MissingFatal { reason },
            };
        }

        let Some(action) = &tool.install else {
            return ToolStatus::MissingFatal {
                reason: "not found on PATH".to_string(),
            };
        };
        if !self.allow_install {
            return ToolStatus::MissingFatal {
                reason: format!("not found on PATH (installable: {})", action.command()),
            };
        }

        if let Err(e) = self.install(action) {
            return ToolStatus::MissingFatal {
                reason: format!("install failed: {e:#}"),
            };
        }
        if self.shell.which(tool.binary).is_none() {
            return ToolStatus::MissingFatal {
                reason: "still not on PATH after install".to_string(),
            };
        }

        let version = self.version(tool);
        match self.check_minimum(tool, version) {
            Ok(()) => ToolStatus::Installed { version },
            Err(reason) => ToolStatus::MissingFatal { reason },
        }
    }

    fn install(&self, action: &InstallAction) -> anyhow::Result<()> {
        let mut ctx = ApplyContext::default();
        for resource in action.resources(&self.shell) {
            let outcome = reconcile(resource.as_ref(), &mut ctx)?;
            log::info!("{}: {}", resource.id(), outcome);
        }
        Ok(())
    }

    fn version(&self, tool: &ToolSpec) -> Option<Version> {
        let cmd = Cmd::new(tool.binary).args(tool.version_args.iter().copied());
        let output = self.shell.output(&cmd).ok()?;
        Version::parse(&output.combined())
    }

    fn check_minimum(&self, tool: &ToolSpec, version: Option<Version>) -> Result<(), String> {
        match (tool.min_version, version) {
            (Some(min), Some(found)) if found < min => {
                Err(format!("version {found} is older than required {min}"))
            }
            (Some(min), None) => {
                log::warn!("Could not determine {} version (need >= {min})", tool.name);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
