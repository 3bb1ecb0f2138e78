//! Configuration loading and config-directory resolution
//!
//! The per-user configuration directory holds everything the control plane
//! shares across processes: the instance lock, the control socket, the TOML
//! settings file and the optional now-playing/log files.
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments (`--config-dir`, `--log-level`, ...)
//! 2. Environment variables (`TUNECTL_CONFIG_DIR`, `RUST_LOG`)
//! 3. TOML configuration file (`config.toml`)
//! 4. Built-in defaults (code constants)
//!
//! A missing or unreadable `config.toml` never prevents startup: a warning is
//! logged and defaults are used.

use crate::protocol::{EQ_BANDS, EQ_MAX_GAIN_DB};
use crate::time::millis_to_duration;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "TUNECTL_CONFIG_DIR";

/// Directory name used below the platform config directory
pub const APP_DIR_NAME: &str = "tunectl";

/// Resolve the configuration directory
///
/// Priority: command-line argument, then `TUNECTL_CONFIG_DIR`, then
/// `<platform config dir>/tunectl`, then `./.tunectl` when the platform has no
/// config directory.
pub fn resolve_config_dir(cli_arg: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(CONFIG_DIR_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    dirs::config_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_DIR_NAME)))
}

/// Well-known files inside the configuration directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    root: PathBuf,
}

impl ConfigPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the directory (see [`resolve_config_dir`]) and wrap it
    pub fn resolve(cli_arg: Option<&Path>) -> Self {
        Self::new(resolve_config_dir(cli_arg))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory if needed, private to the current user
    pub fn ensure_exists(&self) -> Result<()> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root)?;
            info!("Created configuration directory {}", self.root.display());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.root, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("instance.lock")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn now_playing_file(&self) -> PathBuf {
        self.root.join("now_playing")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("daemon.log")
    }

    /// Control socket for one singleton instance
    pub fn socket_path(&self, instance_id: &str) -> PathBuf {
        self.root.join(format!("ctl-{}.sock", instance_id))
    }

    /// IPC socket of the media backend owned by one singleton instance
    pub fn backend_socket_path(&self, instance_id: &str) -> PathBuf {
        self.root.join(format!("mpv-{}.sock", instance_id))
    }
}

/// Which media backend the singleton drives
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// External `mpv` process controlled over its JSON IPC socket
    #[default]
    Mpv,
    /// Silent in-process backend (headless use and tests)
    Memory,
}

/// Complete `config.toml` contents
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct TomlConfig {
    pub playback: PlaybackConfig,
    pub channel: ChannelConfig,
    pub backend: BackendConfig,
    pub mixer: MixerConfig,
    pub equalizer: EqualizerConfig,
    pub logging: LoggingConfig,
}

/// `[playback]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Volume (0-100) the singleton starts with
    pub default_volume: u8,
    /// Seek offset used when `seek-forward`/`seek-back` carry no argument
    pub seek_step_secs: f64,
    /// Volume change used when `volume-up`/`volume-down` carry no argument
    pub volume_step: u8,
    /// Write a one-line status to `<config_dir>/now_playing`
    pub now_playing_file: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_volume: 80,
            seek_step_secs: 10.0,
            volume_step: 5,
            now_playing_file: false,
        }
    }
}

/// `[channel]` section: control-channel and lock timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Client round-trip bound
    pub client_timeout_ms: u64,
    /// Server-side read/write bound per connection
    pub connection_timeout_ms: u64,
    /// How long a starting singleton waits for a superseded one to let go
    pub lock_wait_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            client_timeout_ms: 3000,
            connection_timeout_ms: 2000,
            lock_wait_ms: 5000,
        }
    }
}

impl ChannelConfig {
    pub fn client_timeout(&self) -> Duration {
        millis_to_duration(self.client_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        millis_to_duration(self.connection_timeout_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        millis_to_duration(self.lock_wait_ms)
    }
}

/// `[backend]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// mpv executable (looked up on `PATH` when not absolute)
    pub mpv_path: String,
    /// Acknowledgement bound for a single backend command
    pub command_timeout_ms: u64,
    /// Extra arguments appended to the mpv command line
    pub extra_args: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Mpv,
            mpv_path: "mpv".to_string(),
            command_timeout_ms: 2000,
            extra_args: Vec::new(),
        }
    }
}

impl BackendConfig {
    pub fn command_timeout(&self) -> Duration {
        millis_to_duration(self.command_timeout_ms)
    }
}

/// `[mixer]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MixerConfig {
    /// Mirror volume/mute into the system mixer
    pub enabled: bool,
    pub pactl_path: String,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pactl_path: "pactl".to_string(),
        }
    }
}

/// `[equalizer]` section: named ten-band presets (dB)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EqualizerConfig {
    /// Preset applied at startup
    pub preset: String,
    pub presets: BTreeMap<String, Vec<i8>>,
}

impl Default for EqualizerConfig {
    fn default() -> Self {
        let mut presets = BTreeMap::new();
        presets.insert("flat".to_string(), vec![0; EQ_BANDS]);
        presets.insert("bass".to_string(), vec![6, 5, 4, 2, 0, 0, 0, 0, 0, 0]);
        presets.insert("treble".to_string(), vec![0, 0, 0, 0, 0, 1, 2, 4, 5, 6]);
        presets.insert("vocal".to_string(), vec![-2, -2, -1, 1, 3, 4, 3, 1, 0, -1]);
        Self {
            preset: "flat".to_string(),
            presets,
        }
    }
}

impl EqualizerConfig {
    /// Gains of the configured preset, clamped to ±12 dB
    ///
    /// An unknown preset or one without exactly ten bands falls back to flat.
    pub fn active_gains(&self) -> [i8; EQ_BANDS] {
        let mut gains = [0i8; EQ_BANDS];
        match self.presets.get(&self.preset) {
            Some(values) if values.len() == EQ_BANDS => {
                for (gain, value) in gains.iter_mut().zip(values) {
                    *gain = (*value).clamp(-EQ_MAX_GAIN_DB, EQ_MAX_GAIN_DB);
                }
            }
            Some(values) => {
                warn!(
                    "Equalizer preset '{}' has {} bands (expected {}), using flat",
                    self.preset,
                    values.len(),
                    EQ_BANDS
                );
            }
            None if self.preset == "flat" => {}
            None => {
                warn!("Equalizer preset '{}' not found, using flat", self.preset);
            }
        }
        gains
    }
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log file for a background singleton (defaults to `<config_dir>/daemon.log`)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl TomlConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TomlConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, falling back to defaults on any problem
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Write the default configuration if no file exists yet
    ///
    /// Returns `true` when a file was written.
    pub fn write_default_if_missing(path: &Path) -> Result<bool> {
        if path.exists() {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(&Self::default())?;
        std::fs::write(path, content)?;
        info!("Wrote default configuration to {}", path.display());
        Ok(true)
    }

    /// Reject values the control plane cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.playback.default_volume > 100 {
            return Err(Error::Config(format!(
                "playback.default_volume must be 0-100, got {}",
                self.playback.default_volume
            )));
        }
        if self.playback.volume_step == 0 || self.playback.volume_step > 100 {
            return Err(Error::Config(format!(
                "playback.volume_step must be 1-100, got {}",
                self.playback.volume_step
            )));
        }
        if !(self.playback.seek_step_secs.is_finite() && self.playback.seek_step_secs > 0.0) {
            return Err(Error::Config(format!(
                "playback.seek_step_secs must be positive, got {}",
                self.playback.seek_step_secs
            )));
        }
        let timeouts = [
            ("channel.client_timeout_ms", self.channel.client_timeout_ms),
            ("channel.connection_timeout_ms", self.channel.connection_timeout_ms),
            ("channel.lock_wait_ms", self.channel.lock_wait_ms),
            ("backend.command_timeout_ms", self.backend.command_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}
