//! Path resolution for stackup
//!
//! # Config file lookup
//!
//! 1. `--config <PATH>` / `STACKUP_CONFIG` (handled by clap)
//! 2. `./stackup.toml`
//! 3. `/etc/stackup/stackup.toml`
//! 4. `<user config dir>/stackup/stackup.toml`
//!
//! The first existing file wins. No file at all means built-in defaults.

use std::path::{Path, PathBuf};

/// Environment variable for the config file override
pub const ENV_CONFIG: &str = "STACKUP_CONFIG";

/// Config file name
pub const CONFIG_FILE: &str = "stackup.toml";

/// System-wide config location
const SYSTEM_CONFIG: &str = "/etc/stackup/stackup.toml";

/// Candidate config files, in priority order
pub fn config_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(CONFIG_FILE), PathBuf::from(SYSTEM_CONFIG)];
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("stackup").join(CONFIG_FILE));
    }
    candidates
}

/// First existing config file, if any
pub fn find_config_file() -> Option<PathBuf> {
    let found = config_candidates().into_iter().find(|p| p.is_file());
    if let Some(path) = &found {
        log::debug!("Using config file {}", path.display());
    }
    found
}

/// Expand `~` and environment variables in a path
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

/// Resolve `path` against `base` unless it is already absolute
pub fn resolve(base: &Path, path: &str) -> PathBuf {
    let expanded = expand(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand("~/backups"), home.join("backups"));
    }

    #[test]
    fn test_expand_plain_path_unchanged() {
        assert_eq!(expand("/var/www/app"), PathBuf::from("/var/www/app"));
    }

    #[test]
    fn test_resolve_relative_against_base() {
        assert_eq!(
            resolve(Path::new("/srv/app"), "backend"),
            PathBuf::from("/srv/app/backend")
        );
        assert_eq!(
            resolve(Path::new("/srv/app"), "/opt/backend"),
            PathBuf::from("/opt/backend")
        );
    }

    #[test]
    fn test_candidates_start_with_local_file() {
        assert_eq!(config_candidates()[0], PathBuf::from(CONFIG_FILE));
    }
}
