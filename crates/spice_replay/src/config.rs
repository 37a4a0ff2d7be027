//! spice-replay configuration file handling

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spice_replay_core::ReplayForm;
use std::fs;
use std::path::{Path, PathBuf};

/// File looked up in the working directory when `--config` is not given.
pub const CONFIG_FILE_NAME: &str = "spice-replay.toml";

/// Top-level configuration (spice-replay.toml)
#[derive(Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SpiceReplayConfig {
    #[serde(default)]
    pub replay: ReplaySection,
}

/// Values that prefill the replay form
#[derive(Debug, Deserialize, Serialize, PartialEq)]
pub struct ReplaySection {
    /// Recording to replay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_file: Option<PathBuf>,
    /// Listen port for the protocol server
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client command launched once the server is up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    /// Count used by Next-N
    #[serde(default = "default_step_count")]
    pub step_count: u32,
    #[serde(default)]
    pub delay: DelayConfig,
}

fn default_port() -> u16 {
    5900
}

fn default_step_count() -> u32 {
    10
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            record_file: None,
            port: default_port(),
            client: None,
            step_count: default_step_count(),
            delay: DelayConfig::default(),
        }
    }
}

/// Per-command pacing delay
#[derive(Debug, Deserialize, Serialize, PartialEq)]
pub struct DelayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_delay_micros")]
    pub micros: u64,
}

fn default_true() -> bool {
    true
}

fn default_delay_micros() -> u64 {
    100
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            micros: default_delay_micros(),
        }
    }
}

impl SpiceReplayConfig {
    /// Load an explicit config file, or `spice-replay.toml` from `dir` if it
    /// exists. A missing default file yields the defaults.
    pub fn load(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        match explicit {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file {} does not exist", path.display());
                }
                Self::load_from_path(path)
            }
            None => {
                let path = dir.join(CONFIG_FILE_NAME);
                if path.exists() {
                    Self::load_from_path(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let config: SpiceReplayConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        Ok(config)
    }

    /// Form fields as they appear before the user edits anything
    pub fn to_form(&self) -> ReplayForm {
        let replay = &self.replay;
        ReplayForm {
            record_file: replay
                .record_file
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            port: replay.port.to_string(),
            client: replay.client.clone().unwrap_or_default(),
            delay_enabled: replay.delay.enabled,
            delay: replay.delay.micros.to_string(),
            step_count: replay.step_count.to_string(),
        }
    }

    /// Serialize to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
