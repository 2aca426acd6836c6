//! Configuration file – reads/writes `~/.markernav/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use markernav_runtime::NodeConfig;
use markernav_types::NavError;
use serde::{Deserialize, Serialize};

/// rosbridge WebSocket server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bridge_port")]
    pub port: u16,
}

fn default_bridge_enabled() -> bool {
    true
}
fn default_bridge_port() -> u16 {
    9090
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_bridge_enabled(),
            port: default_bridge_port(),
        }
    }
}

/// Persisted configuration stored in `~/.markernav/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Path of the config file: `$MARKERNAV_CONFIG` if set, otherwise
/// `~/.markernav/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("MARKERNAV_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".markernav").join("config.toml")
}

/// Load the config, writing a default one first if none exists.
///
/// Environment overrides are applied and the node section validated.
/// Returns the config and whether the file was just created.
pub fn load_or_init(path: &Path) -> Result<(Config, bool), NavError> {
    let (mut cfg, created) = match load_from(path)? {
        Some(cfg) => (cfg, false),
        None => {
            let cfg = Config::default();
            save_to(&cfg, path)?;
            (cfg, true)
        }
    };
    apply_env_overrides(&mut cfg);
    cfg.node.validate()?;
    Ok((cfg, created))
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, NavError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        NavError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| NavError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `MARKERNAV_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MARKERNAV_TARGET_MARKER` | `node.target_marker_id` |
/// | `MARKERNAV_TICK_PERIOD_MS` | `node.tick_period_ms` |
/// | `MARKERNAV_BASE_FRAME` | `node.base_frame` |
/// | `MARKERNAV_CAMERA_FRAME` | `node.camera_frame` |
/// | `MARKERNAV_BRIDGE_PORT` | `bridge.port` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(id) = var("MARKERNAV_TARGET_MARKER").and_then(|v| v.parse().ok()) {
        cfg.node.target_marker_id = id;
    }
    if let Some(ms) = var("MARKERNAV_TICK_PERIOD_MS").and_then(|v| v.parse().ok()) {
        cfg.node.tick_period_ms = ms;
    }
    if let Some(frame) = var("MARKERNAV_BASE_FRAME") {
        cfg.node.base_frame = frame;
    }
    if let Some(frame) = var("MARKERNAV_CAMERA_FRAME") {
        cfg.node.camera_frame = frame;
    }
    if let Some(port) = var("MARKERNAV_BRIDGE_PORT").and_then(|v| v.parse().ok()) {
        cfg.bridge.port = port;
    }
}

/// Save the config to `path`, creating the parent directory if necessary.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), NavError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| NavError::Config(format!("failed to create config directory: {e}")))?;
        // Owner-only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                NavError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| NavError::Serialization(format!("failed to serialize config: {e}")))?;
    let write_err =
        |e: std::io::Error| NavError::Config(format!("failed to write config at {}: {e}", path.display()));
    // Owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
