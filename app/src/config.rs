use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use pianolane_core::{
    EngineConfig, RecorderConfig, SequencerConfig,
    diagnostics::{DEFAULT_LOG_FILTER, DEFAULT_LOG_PREFIX},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "pianolane.config.toml";
pub const CONFIG_PATH_ENV: &str = "PIANOLANE_CONFIG_PATH";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub audio: EngineConfig,
    pub sequencer: SequencerConfig,
    pub recorder: RecorderConfig,
    pub diagnostics: DiagnosticsConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub rust_log_filter: String,
    pub trace_file_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub logs_dir: PathBuf,
    /// Loaded at startup when set.
    pub initial_midi_file: Option<PathBuf>,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            rust_log_filter: DEFAULT_LOG_FILTER.to_string(),
            trace_file_prefix: DEFAULT_LOG_PREFIX.to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("logs"),
            initial_midi_file: None,
        }
    }
}

impl AppConfig {
    /// Reads the config from `PIANOLANE_CONFIG_PATH`, the working directory or
    /// its parent. Without a config file every section takes its defaults.
    pub fn load() -> Result<Self> {
        let cwd = env::current_dir().context("failed to resolve current directory")?;
        let override_path = env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_with(override_path.as_deref(), &cwd)
    }

    pub fn load_with(override_path: Option<&Path>, cwd: &Path) -> Result<Self> {
        match discover_config_path(override_path, cwd) {
            Some(path) => Self::from_file(&path),
            None => {
                debug!(cwd = %cwd.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config TOML from {}", path.display()))?;

        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }
}

fn discover_config_path(override_path: Option<&Path>, cwd: &Path) -> Option<PathBuf> {
    if let Some(path) = override_path.filter(|path| path.is_file()) {
        return Some(path.to_path_buf());
    }

    let candidates = [
        cwd.join(CONFIG_FILE_NAME),
        cwd.join("..").join(CONFIG_FILE_NAME),
    ];
    candidates.into_iter().find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use pianolane_core::ClampPolicy;

    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let temp = tempfile::tempdir().expect("tempdir should work");
        let cwd = temp.path().join("work");
        fs::create_dir_all(&cwd).expect("cwd should be creatable");

        let config = AppConfig::load_with(None, &cwd).expect("defaults should load");
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.audio.sample_rate, 22_050);
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir should work");
        fs::write(
            temp.path().join(CONFIG_FILE_NAME),
            "[audio]\nsample_rate = 44100\n\n[sequencer]\nclamp_policy = \"latest_note_only\"\n",
        )
        .expect("config write should work");

        let config = AppConfig::load_with(None, temp.path()).expect("config should parse");
        assert_eq!(config.audio.sample_rate, 44_100);
        assert_eq!(config.audio.block_frames, 256);
        assert_eq!(config.sequencer.clamp_policy, ClampPolicy::LatestNoteOnly);
        assert_eq!(config.paths, PathsConfig::default());
    }

    #[test]
    fn override_path_wins_and_parent_dir_is_searched() {
        let temp = tempfile::tempdir().expect("tempdir should work");
        let cwd = temp.path().join("app");
        fs::create_dir_all(&cwd).expect("cwd should be creatable");
        fs::write(
            temp.path().join(CONFIG_FILE_NAME),
            "[recorder]\nport_index = 2\n",
        )
        .expect("parent config write should work");
        let custom = temp.path().join("custom.toml");
        fs::write(&custom, "[recorder]\nport_index = 5\n").expect("custom write should work");

        let parent = AppConfig::load_with(None, &cwd).expect("parent config should load");
        assert_eq!(parent.recorder.port_index, 2);

        let overridden =
            AppConfig::load_with(Some(&custom), &cwd).expect("override should load");
        assert_eq!(overridden.recorder.port_index, 5);

        let missing = temp.path().join("missing.toml");
        let fallback = AppConfig::load_with(Some(&missing), &cwd).expect("fallback should load");
        assert_eq!(fallback.recorder.port_index, 2);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir should work");
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[audio\nsample_rate = ").expect("config write should work");
        let err = AppConfig::from_file(&path).expect_err("broken toml must fail");
        assert!(format!("{err:#}").contains("failed to parse config TOML"));
    }
}
