//! Configuration loader (§4.J)
//!
//! Layers built-in defaults, an optional TOML file, and CLI overrides (in
//! that priority order) into the starting values for the property namespace
//! and the dependency resolver's collaborators. A tool-wide settings file,
//! never a per-jail manifest: it says where jails live and how to find
//! their dependencies, not what goes inside any one of them (§4.J).

use crate::error::{Error, Result};
use crate::policy::DEFAULT_USERNAME_REGEX;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default location probed when `--config` isn't given explicitly.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/jail.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub jailbase: String,
    pub writepath: String,
    pub username_regex: String,
    pub ldconfig_cmd: String,
    pub ldconfig_rx: String,
    pub ldlist_cmd: String,
    pub ldlist_rx: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jailbase: "/var/jails".to_string(),
            writepath: r"^/var/jails/".to_string(),
            username_regex: DEFAULT_USERNAME_REGEX.to_string(),
            ldconfig_cmd: "ldconfig -p".to_string(),
            ldconfig_rx: r"=>\s*(\S+)".to_string(),
            ldlist_cmd: "{ldlinux_so} --list {path}".to_string(),
            ldlist_rx: r"(\S+\.so(?:\.\S+)?)".to_string(),
        }
    }
}

impl Config {
    /// Load built-in defaults, then overlay a TOML file if one is present.
    ///
    /// `explicit_path` is `--config <path>`; when given, a missing file is a
    /// configuration error. When not given, the probe at
    /// [`DEFAULT_CONFIG_PATH`] is silent on a miss — most hosts won't have one.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let (candidate, required) = match explicit_path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        if !candidate.exists() {
            if required {
                return Err(Error::ConfigRead {
                    path: candidate,
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                });
            }
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&candidate).map_err(|e| Error::ConfigRead {
            path: candidate.clone(),
            source: e,
        })?;
        let config: Config = toml::from_str(&text)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_conservative_writepath() {
        let config = Config::default();
        assert_eq!(config.jailbase, "/var/jails");
        assert!(config.writepath.starts_with("^/var/jails"));
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/jail.toml"))).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }

    #[test]
    fn partial_toml_file_inherits_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jail.toml");
        std::fs::write(&path, "jailbase = \"/srv/jails\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.jailbase, "/srv/jails");
        assert_eq!(config.ldconfig_cmd, Config::default().ldconfig_cmd);
    }
}
