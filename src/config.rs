//! TOML configuration, read once at startup.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::codec::BinaryFormat;
use crate::error::MappingError;
use crate::mapping::{FieldMapping, MappingConfig};

/// Documented defaults, compiled into the binary.
pub(crate) const DEFAULT_CONFIG: &str = include_str!("../config/spooltag.toml");

const CONFIG_FILE: &str = "spooltag.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub spoolman: SpoolmanConfig,
    #[serde(default)]
    pub moonraker: MoonrakerConfig,
    #[serde(default)]
    pub tags: TagsConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpoolmanConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for SpoolmanConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:7912".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MoonrakerConfig {
    pub url: String,
    pub timeout_secs: u64,
    /// Resend even if the identity equals the last one sent
    pub always_send: bool,
    /// Send `clear_commands` when the tag leaves the reader
    pub clear_spool: bool,
    /// Templates with `{spool}` and `{filament}` placeholders
    pub set_commands: Vec<String>,
    pub clear_commands: Vec<String>,
}

impl Default for MoonrakerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:7125".to_string(),
            timeout_secs: 10,
            always_send: false,
            clear_spool: false,
            set_commands: vec![
                "SET_ACTIVE_SPOOL ID={spool}".to_string(),
                "SET_ACTIVE_FILAMENT ID={filament}".to_string(),
            ],
            clear_commands: vec![
                "SET_ACTIVE_SPOOL ID=0".to_string(),
                "SET_ACTIVE_FILAMENT ID=0".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TagsConfig {
    pub structured_enabled: bool,
    pub neutral_enabled: bool,
}

impl Default for TagsConfig {
    fn default() -> Self {
        Self {
            structured_enabled: true,
            neutral_enabled: true,
        }
    }
}

impl TagsConfig {
    pub fn enabled_formats(&self) -> Vec<BinaryFormat> {
        let mut formats = Vec::new();
        if self.structured_enabled {
            formats.push(BinaryFormat::Structured);
        }
        if self.neutral_enabled {
            formats.push(BinaryFormat::Neutral);
        }
        formats
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub enabled: bool,
    pub socket_path: String,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: "~/spooltag/spooltag.sock".to_string(),
        }
    }
}

impl IpcConfig {
    /// Socket path with a leading `~` expanded.
    pub fn socket_path(&self) -> PathBuf {
        expand_home(&self.socket_path)
    }
}

impl Config {
    /// Parse and validate configuration text.
    pub fn from_toml(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration from a file.
    pub fn from_file(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Config::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// The embedded defaults.
    ///
    /// # Panics
    /// Panics if the embedded file is invalid; tests cover it.
    pub fn embedded() -> Config {
        Config::from_toml(DEFAULT_CONFIG).expect("embedded spooltag.toml must be valid")
    }

    /// Load `explicit` if given, otherwise the first existing file from
    /// [`search_paths`], otherwise the embedded defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        if let Some(path) = explicit {
            info!(path = %path.display(), "Loading configuration");
            return Config::from_file(path);
        }

        for candidate in search_paths() {
            if candidate.is_file() {
                info!(path = %candidate.display(), "Loading configuration");
                return Config::from_file(&candidate);
            }
            debug!(path = %candidate.display(), "No configuration file");
        }

        info!("No configuration file found, using built-in defaults");
        Ok(Config::embedded())
    }

    pub fn mapping(&self) -> Result<FieldMapping, MappingError> {
        FieldMapping::compile(&self.mapping)
    }

    fn validate(&self) -> Result<()> {
        for (section, raw) in [("spoolman", &self.spoolman.url), ("moonraker", &self.moonraker.url)] {
            let parsed = url::Url::parse(raw)
                .with_context(|| format!("[{}] url '{}' is not a valid URL", section, raw))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                bail!("[{}] url '{}' must use http or https", section, raw);
            }
        }
        if self.spoolman.timeout_secs == 0 || self.moonraker.timeout_secs == 0 {
            bail!("timeout_secs must be at least 1");
        }
        self.mapping()?;
        Ok(())
    }
}

/// `~/spooltag.toml`, then `<config dir>/spooltag/spooltag.toml`.
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(CONFIG_FILE));
    }
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("spooltag").join(CONFIG_FILE));
    }
    paths
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(path),
        },
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_config_is_valid() {
        let config = Config::embedded();
        assert_eq!(config.spoolman.url, "http://localhost:7912");
        assert_eq!(config.moonraker.set_commands.len(), 2);
        assert!(!config.moonraker.always_send);
        assert!(!config.mapping.rules.is_empty());
    }

    #[test]
    fn test_embedded_matches_code_defaults() {
        let embedded = Config::embedded();
        let defaults = Config::default();
        assert_eq!(embedded.spoolman.url, defaults.spoolman.url);
        assert_eq!(embedded.moonraker.set_commands, defaults.moonraker.set_commands);
        assert_eq!(embedded.moonraker.clear_commands, defaults.moonraker.clear_commands);
        assert_eq!(embedded.ipc.socket_path, defaults.ipc.socket_path);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = Config::from_toml("[moonraker]\nalways_send = true\n").unwrap();
        assert!(config.moonraker.always_send);
        assert_eq!(config.moonraker.url, "http://localhost:7125");
        assert_eq!(config.spoolman.timeout_secs, 10);
        assert!(config.mapping.rules.is_empty());
    }

    #[test]
    fn test_enabled_formats() {
        let config = Config::from_toml("[tags]\nstructured_enabled = false\n").unwrap();
        assert_eq!(config.tags.enabled_formats(), vec![BinaryFormat::Neutral]);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(Config::from_toml("[spoolman]\nurl = \"not a url\"\n").is_err());
        assert!(Config::from_toml("[moonraker]\nurl = \"ftp://printer\"\n").is_err());
    }

    #[test]
    fn test_invalid_mapping_is_rejected() {
        let toml = "[[mapping.rules]]\ntarget = \"filament.name\"\nfield = \"brand\"\n";
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("brand"), "got: {}", err);
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[spoolman]\nurl = \"http://spoolman.lan:8000\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.spoolman.url, "http://spoolman.lan:8000");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/run/x.sock"), PathBuf::from("/run/x.sock"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/a.sock"), home.join("a.sock"));
        }
    }
}
