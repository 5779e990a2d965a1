//! Server configuration: TOML file + CLI overrides.

use crate::title::TitleMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use ttyhub_core::{HubError, HubResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub control: ControlSection,
    #[serde(default)]
    pub recording: RecordingSection,
    #[serde(default)]
    pub title: TitleSection,
    #[serde(default)]
    pub kill: KillSection,
}

/// `[control]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlSection {
    #[serde(default = "default_control_root")]
    pub root: String,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            root: default_control_root(),
        }
    }
}

/// `[recording]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordingSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-event durability flush. Trades throughput for durability;
    /// disable for batch-style workloads.
    #[serde(default = "default_true")]
    pub flush_each_event: bool,
}

impl Default for RecordingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_each_event: true,
        }
    }
}

/// `[title]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TitleSection {
    #[serde(default = "default_title_mode")]
    pub mode: String,
}

impl Default for TitleSection {
    fn default() -> Self {
        Self {
            mode: default_title_mode(),
        }
    }
}

/// `[kill]` section: escalation tunables, all in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct KillSection {
    #[serde(default = "default_kill_poll_ms")]
    pub poll_ms: u64,
    #[serde(default = "default_kill_escalation_ms")]
    pub escalation_ms: u64,
    #[serde(default = "default_kill_force_wait_ms")]
    pub force_wait_ms: u64,
}

impl Default for KillSection {
    fn default() -> Self {
        Self {
            poll_ms: default_kill_poll_ms(),
            escalation_ms: default_kill_escalation_ms(),
            force_wait_ms: default_kill_force_wait_ms(),
        }
    }
}

fn default_control_root() -> String {
    "~/.ttyhub/control".to_string()
}
fn default_title_mode() -> String {
    "dynamic".to_string()
}
fn default_kill_poll_ms() -> u64 {
    500
}
fn default_kill_escalation_ms() -> u64 {
    3000
}
fn default_kill_force_wait_ms() -> u64 {
    100
}
fn default_true() -> bool {
    true
}

/// Resolved configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct Config {
    pub control_root: PathBuf,
    pub recording_enabled: bool,
    pub flush_each_event: bool,
    pub default_title_mode: TitleMode,
    pub kill_poll_interval: Duration,
    pub kill_escalation_timeout: Duration,
    pub kill_force_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), None, None)
            .unwrap_or_else(|_| unreachable!("defaults always parse"))
    }
}

impl Config {
    /// Load config from a TOML file (missing file means defaults), then
    /// apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_control_root: Option<&str>,
        cli_title_mode: Option<&str>,
    ) -> HubResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde_str(&path.to_string_lossy());
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| HubError::Other(format!("config parse error: {e}")))?
            } else {
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };
        Self::from_file(file_config, cli_control_root, cli_title_mode)
    }

    fn from_file(
        file: ConfigFile,
        cli_control_root: Option<&str>,
        cli_title_mode: Option<&str>,
    ) -> HubResult<Self> {
        let root = cli_control_root
            .map(str::to_string)
            .unwrap_or(file.control.root);
        let mode_str = cli_title_mode
            .map(str::to_string)
            .unwrap_or(file.title.mode);
        let default_title_mode: TitleMode = mode_str
            .parse()
            .map_err(HubError::Other)?;

        Ok(Self {
            control_root: expand_tilde_str(&root),
            recording_enabled: file.recording.enabled,
            flush_each_event: file.recording.flush_each_event,
            default_title_mode,
            kill_poll_interval: Duration::from_millis(file.kill.poll_ms),
            kill_escalation_timeout: Duration::from_millis(file.kill.escalation_ms),
            kill_force_wait: Duration::from_millis(file.kill.force_wait_ms),
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
