use linkroom_core::config::ConfigError;
use linkroom_core::{RegistrationStatus, RelayConfig};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HostConfig {
    /// Identity reported to the session as verified.
    pub device_id: Option<String>,
    pub relay: RelayConfig,
}

impl HostConfig {
    pub fn registration(&self) -> RegistrationStatus {
        match self.device_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => RegistrationStatus::Verified(id.to_string()),
            _ => RegistrationStatus::Unregistered,
        }
    }

    /// Relay settings, with `--host` applied on top when given.
    pub fn relay_for(&self, host_override: Option<&str>) -> Result<RelayConfig, ConfigError> {
        match host_override {
            Some(host) => self.relay.with_host_override(host),
            None => Ok(self.relay.clone()),
        }
    }
}

pub fn default_host_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata).join("linkroom").join("host.toml");
        }
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("linkroom").join("host.toml");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("linkroom")
            .join("host.toml");
    }

    PathBuf::from("host.toml")
}

pub fn load_from_file(path: &Path) -> HostConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return HostConfig::default(),
    };

    match toml::from_str::<HostConfig>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(
                "Failed to parse host config {}: {e}; using defaults",
                path.display()
            );
            HostConfig::default()
        }
    }
}

pub fn save_to_file(path: &Path, cfg: &HostConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let text = toml::to_string_pretty(cfg).map_err(std::io::Error::other)?;
    std::fs::write(path, text)
}
