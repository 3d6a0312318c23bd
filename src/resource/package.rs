//! Package resources - apt packages and global npm packages

use anyhow::{Context, Result};
use declarative::{ApplyContext, Resource, ResourceKind, ResourceState};

use crate::runner::{Cmd, Shell};

/// A Debian package installed through apt
#[derive(Debug, Clone)]
pub struct SystemPackage {
    pub name: String,
    shell: Shell,
}

impl SystemPackage {
    pub fn new(name: &str, shell: Shell) -> Self {
        Self {
            name: name.to_string(),
            shell,
        }
    }

    fn install(&self) -> Result<()> {
        self.shell.run_checked(
            &Cmd::new("apt-get")
                .args(["install", "-y", "--no-install-recommends", &self.name])
                .env("DEBIAN_FRONTEND", "noninteractive"),
        )?;
        Ok(())
    }
}

impl Resource for SystemPackage {
    fn id(&self) -> String {
        format!("apt:{}", self.name)
    }

    fn description(&self) -> String {
        format!("Package {}", self.name)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Package
    }

    fn current_state(&self) -> Result<ResourceState> {
        let output = self.shell.output(
            &Cmd::new("dpkg-query").args(["-W", "-f=${Status}", &self.name]),
        )?;
        let installed = output.success && output.stdout_str().trim() == "install ok installed";
        Ok(if installed {
            ResourceState::Present { details: None }
        } else {
            ResourceState::Absent
        })
    }

    fn desired_state(&self) -> ResourceState {
        ResourceState::Present { details: None }
    }

    fn apply(&self, _ctx: &mut ApplyContext) -> Result<()> {
        if self.install().is_ok() {
            return Ok(());
        }
        // Stale package lists are the usual cause on a fresh host
        log::info!("Refreshing apt package lists before retrying {}", self.name);
        self.shell.run_checked(
            &Cmd::new("apt-get")
                .arg("update")
                .env("DEBIAN_FRONTEND", "noninteractive"),
        )?;
        self.install()
            .with_context(|| format!("Could not install {}", self.name))
    }
}

/// A package installed with `npm install -g`
#[derive(Debug, Clone)]
pub struct NpmGlobalPackage {
    pub name: String,
    shell: Shell,
}

impl NpmGlobalPackage {
    pub fn new(name: &str, shell: Shell) -> Self {
        Self {
            name: name.to_string(),
            shell,
        }
    }

    /// Installed version, if any
    fn installed_version(&self) -> Result<Option<String>> {
        // npm ls exits non-zero on unrelated peer problems but still prints the tree
        let output = self
            .shell
            .output(&Cmd::new("npm").args(["ls", "-g", "--depth=0", "--json"]))?;
        let stdout = output.stdout_str();
        if stdout.trim().is_empty() {
            return Ok(None);
        }
        let tree: serde_json::Value =
            serde_json::from_str(&stdout).context("Could not parse `npm ls -g` output")?;
        Ok(tree
            .get("dependencies")
            .and_then(|deps| deps.get(&self.name))
            .map(|pkg| {
                pkg.get("version")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown")
                    .to_string()
            }))
    }
}

impl Resource for NpmGlobalPackage {
    fn id(&self) -> String {
        format!("npm:{}", self.name)
    }

    fn description(&self) -> String {
        format!("Global npm package {}", self.name)
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Package
    }

    fn current_state(&self) -> Result<ResourceState> {
        Ok(match self.installed_version()? {
            Some(version) => {
                log::debug!("{} {} installed globally", self.name, version);
                ResourceState::Present { details: None }
            }
            None => ResourceState::Absent,
        })
    }

    fn desired_state(&self) -> ResourceState {
        ResourceState::Present { details: None }
    }

    fn apply(&self, _ctx: &mut ApplyContext) -> Result<()> {
        self.shell
            .run_checked(&Cmd::new("npm").args(["install", "-g", &self.name]))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::{FakeRunner, fail, ok};
    use declarative::{ReconcileOutcome, reconcile};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_apt_retries_after_update() {
        let fake = Arc::new(FakeRunner::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        fake.on("apt-get install", move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                fail("E: Unable to locate package nginx")
            } else {
                ok("")
            }
        });
        let installed = attempts.clone();
        fake.on("dpkg-query", move |_| {
            if installed.load(Ordering::SeqCst) >= 2 {
                ok("install ok installed")
            } else {
                fail("no packages found matching nginx")
            }
        });

        let pkg = SystemPackage::new("nginx", Shell::shared(fake.clone()));
        let mut ctx = ApplyContext::default();
        assert_eq!(reconcile(&pkg, &mut ctx).unwrap(), ReconcileOutcome::Created);

        let update = fake.position("apt-get update").unwrap();
        let calls = fake.calls();
        let last_install = calls.iter().rposition(|c| c.contains("apt-get install")).unwrap();
        assert!(update < last_install);
        assert!(
            fake.commands()
                .iter()
                .all(|c| c.program != "apt-get" || c.env.iter().any(|(k, _)| k == "DEBIAN_FRONTEND"))
        );
    }

    #[test]
    fn test_npm_global_probe() {
        let fake = Arc::new(FakeRunner::new());
        fake.reply(
            "npm ls -g",
            r#"{"dependencies":{"npm":{"version":"10.2.4"},"pm2":{"version":"5.3.1"}}}"#,
        );
        let pm2 = NpmGlobalPackage::new("pm2", Shell::shared(fake.clone()));
        let serve = NpmGlobalPackage::new("serve", Shell::shared(fake));

        assert!(pm2.current_state().unwrap().is_present());
        assert!(serve.current_state().unwrap().is_absent());
    }
}
