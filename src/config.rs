//! Profile store: named server credentials kept in a YAML file.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::db::expand_home;

pub const DEFAULT_CONFIG_PATH: &str = "~/.mailgoat/config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("profile not found: {0}")]
    ProfileNotFound(String),
}

/// Root of `config.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub default_profile: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

/// Credentials and sender defaults for one mail server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub server: String,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
}

impl Config {
    /// Insert or replace a profile. The first profile added becomes the default.
    pub fn add_profile(&mut self, name: &str, profile: Profile, make_default: bool) {
        self.profiles.insert(name.to_string(), profile);
        if make_default || self.default_profile.is_none() {
            self.default_profile = Some(name.to_string());
        }
    }

    pub fn set_default(&mut self, name: &str) -> Result<(), ConfigError> {
        if !self.profiles.contains_key(name) {
            return Err(ConfigError::ProfileNotFound(name.to_string()));
        }
        self.default_profile = Some(name.to_string());
        Ok(())
    }

    /// Profiles ordered by name.
    pub fn list_profiles(&self) -> Vec<(&str, &Profile)> {
        self.profiles.iter().map(|(k, v)| (k.as_str(), v)).collect()
    }

    pub fn get_profile(&self, name: &str) -> Result<&Profile, ConfigError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ConfigError::ProfileNotFound(name.to_string()))
    }

    pub fn default_profile_name(&self) -> Option<&str> {
        self.default_profile.as_deref().filter(|n| !n.is_empty())
    }
}

pub fn config_path(path: Option<&str>) -> PathBuf {
    PathBuf::from(expand_home(path.unwrap_or(DEFAULT_CONFIG_PATH)))
}

/// Load and validate the profile file. A missing file is an empty store.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

pub fn save(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    validate(cfg)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_yaml::to_string(cfg)?)?;
    Ok(())
}

pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    for (name, profile) in &cfg.profiles {
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid("profile names must be non-empty"));
        }
        if profile.server.trim().is_empty() {
            return Err(ConfigError::Invalid("profiles.*.server must be non-empty"));
        }
        if profile.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("profiles.*.api_key must be non-empty"));
        }
    }
    if let Some(name) = cfg.default_profile_name() {
        if !cfg.profiles.contains_key(name) {
            return Err(ConfigError::Invalid(
                "default_profile must name an existing profile",
            ));
        }
    }
    Ok(())
}

/// Ask for the fields of a new profile, one line each.
pub fn prompt_for_profile<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
) -> Result<Profile, ConfigError> {
    let server = prompt(input, output, "Server URL: ")?;
    let api_key = prompt(input, output, "API key: ")?;
    let from_address = prompt(input, output, "From address (optional): ")?;
    let from_name = prompt(input, output, "From name (optional): ")?;

    if server.is_empty() {
        return Err(ConfigError::Invalid("server is required"));
    }
    if api_key.is_empty() {
        return Err(ConfigError::Invalid("api_key is required"));
    }
    Ok(Profile {
        server,
        api_key,
        from_address: Some(from_address).filter(|s| !s.is_empty()),
        from_name: Some(from_name).filter(|s| !s.is_empty()),
    })
}

fn prompt<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    label: &str,
) -> Result<String, ConfigError> {
    write!(output, "{label}")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim().to_string())
}

pub fn example() -> &'static str {
    r#"default_profile: work

profiles:
  work:
    server: "https://postal.example.com"
    api_key: "YOUR_SERVER_API_KEY"
    from_address: "team@example.com"
    from_name: "Example Team"
  personal:
    server: "https://mail.example.org"
    api_key: "ANOTHER_API_KEY"
"#
}
