//! Layered pipeline configuration: compiled-in defaults, overridden by a
//! TOML file, overridden by `HAILOSEG_*` environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::decoder::AnchorConfig;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_PREFIX: &str = "HAILOSEG_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelCapacities {
    pub write: usize,
    pub read: usize,
    pub post: usize,
    pub callback: usize,
}

impl Default for ChannelCapacities {
    fn default() -> Self {
        Self {
            write: 2,
            read: 2,
            post: 4,
            callback: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub channels: ChannelCapacities,
    /// Post-process worker count. `None` means "host core count" at start time.
    pub post_workers: Option<usize>,
    pub callback_workers: usize,
    /// `behind()` threshold past which `submit` pre-admission-gates a frame.
    pub behind_threshold: u64,
    pub network_width: u32,
    pub network_height: u32,
    pub strides: [u32; 3],
    pub regression_length: u32,
    pub num_classes: u32,
    /// Applied to `submit` calls that omit an explicit threshold.
    pub default_confidence_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channels: ChannelCapacities::default(),
            post_workers: None,
            callback_workers: 2,
            behind_threshold: 2,
            network_width: 640,
            network_height: 640,
            strides: [8, 16, 32],
            regression_length: 15,
            num_classes: 80,
            default_confidence_threshold: 0.6,
        }
    }
}

impl PipelineConfig {
    pub fn anchor_config(&self) -> AnchorConfig {
        AnchorConfig {
            strides: self.strides,
            regression_length: self.regression_length,
            num_classes: self.num_classes,
        }
    }

    pub fn network_dims(&self) -> (u32, u32) {
        (self.network_width, self.network_height)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Layer `HAILOSEG_*` environment variables on top of `self`. Unknown or
    /// unparsable values are left at their current setting.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_usize("CHANNEL_WRITE") {
            self.channels.write = v;
        }
        if let Some(v) = env_usize("CHANNEL_READ") {
            self.channels.read = v;
        }
        if let Some(v) = env_usize("CHANNEL_POST") {
            self.channels.post = v;
        }
        if let Some(v) = env_usize("CHANNEL_CALLBACK") {
            self.channels.callback = v;
        }
        if let Some(v) = env_usize("POST_WORKERS") {
            self.post_workers = Some(v);
        }
        if let Some(v) = env_usize("CALLBACK_WORKERS") {
            self.callback_workers = v;
        }
        if let Some(v) = env::var(format!("{ENV_PREFIX}BEHIND_THRESHOLD"))
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            self.behind_threshold = v;
        }
        if let Some(v) = env::var(format!("{ENV_PREFIX}DEFAULT_CONFIDENCE"))
            .ok()
            .and_then(|s| s.parse::<f32>().ok())
        {
            self.default_confidence_threshold = v;
        }
        self
    }
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
}

/// Resolve the data directory: CLI override, else `HAILOSEG_DATA_DIR`, else `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(format!("{ENV_PREFIX}DATA_DIR")) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory structure on first run: create `data_dir`
/// if missing, write a default `config.toml` only if one doesn't exist yet.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        PipelineConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Resolve a path relative to a base directory; absolute paths pass through.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    #[test]
    fn default_config_matches_pipeline_topology() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.channels.write, 2);
        assert_eq!(cfg.channels.read, 2);
        assert_eq!(cfg.channels.post, 4);
        assert_eq!(cfg.channels.callback, 2);
        assert_eq!(cfg.callback_workers, 2);
        assert_eq!(cfg.behind_threshold, 2);
        assert_eq!(cfg.strides, [8, 16, 32]);
        assert_eq!(cfg.regression_length, 15);
        assert_eq!(cfg.num_classes, 80);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = PipelineConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: PipelineConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let path = unique_temp_path("nonexistent");
        let loaded = PipelineConfig::load_from_path(&path).expect("load config from nonexistent path");
        assert_eq!(loaded, PipelineConfig::default());
    }

    #[test]
    fn env_override_changes_behind_threshold() {
        env::set_var("HAILOSEG_BEHIND_THRESHOLD", "5");
        let cfg = PipelineConfig::default().with_env_overrides();
        env::remove_var("HAILOSEG_BEHIND_THRESHOLD");
        assert_eq!(cfg.behind_threshold, 5);
    }

    #[test]
    fn env_override_is_noop_when_unset() {
        env::remove_var("HAILOSEG_CALLBACK_WORKERS");
        let cfg = PipelineConfig::default().with_env_overrides();
        assert_eq!(cfg.callback_workers, 2);
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_uses_env_var_when_no_cli() {
        env::set_var("HAILOSEG_DATA_DIR", "/env/path");
        let result = data_dir(None);
        env::remove_var("HAILOSEG_DATA_DIR");
        assert_eq!(result, PathBuf::from("/env/path"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        assert_eq!(config_path(Path::new("/data")), PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = unique_temp_path("init-dir");
        initialize_data_dir(&temp).expect("initialize data dir");

        assert!(temp.exists());
        assert!(temp.join("config.toml").exists());

        fs::remove_dir_all(&temp).ok();
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = unique_temp_path("init-preserve");
        fs::create_dir_all(&temp).expect("create temp dir");

        let cfg_path = temp.join("config.toml");
        let custom_content = "behind_threshold = 9\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(&temp).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);

        fs::remove_dir_all(&temp).ok();
    }

    #[test]
    fn resolve_relative_to_absolute_path_unchanged() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("/abs/path"));
        assert_eq!(result, PathBuf::from("/abs/path"));
    }

    #[test]
    fn resolve_relative_to_joins_relative_path() {
        let result = resolve_relative_to(Path::new("/base"), Path::new("sub"));
        assert_eq!(result, PathBuf::from("/base/sub"));
    }

    fn unique_temp_path(tag: &str) -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time moved backwards")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "hailoseg-config-test-{tag}-{}-{timestamp}",
            std::process::id()
        ))
    }
}
