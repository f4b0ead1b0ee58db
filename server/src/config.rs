use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use ttp_common::{ModelConfig, Result, TtpError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Directory holding `video_sent.jsonl`, `video_acked.jsonl` and `experiments.json`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Only train on sessions that ran this congestion control.
    #[serde(default)]
    pub cc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Parent of every rotation directory.
    #[serde(default = "default_models_root")]
    pub models_root: PathBuf,

    /// Symlink (under `models_root`) that the inference consumer reads.
    #[serde(default = "default_published_link")]
    pub published_link: String,

    #[serde(default = "default_scheduled_hour")]
    pub scheduled_hour_utc: u32,

    /// Wall-clock cap on one rotation.
    #[serde(default = "default_rotation_timeout")]
    pub rotation_timeout_secs: u64,

    /// Command run after publishing; the new directory is passed in `TTP_MODEL_DIR`.
    #[serde(default)]
    pub reload_command: Option<Vec<String>>,

    #[serde(default = "default_reload_grace")]
    pub reload_grace_secs: u64,

    /// Hold out a validation split during rotations.
    #[serde(default)]
    pub tune: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_models_root() -> PathBuf {
    PathBuf::from("models")
}

fn default_published_link() -> String {
    "published".into()
}

fn default_scheduled_hour() -> u32 {
    11
}

fn default_rotation_timeout() -> u64 {
    20 * 3600
}

fn default_reload_grace() -> u64 {
    60
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cc: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            models_root: default_models_root(),
            published_link: default_published_link(),
            scheduled_hour_utc: default_scheduled_hour(),
            rotation_timeout_secs: default_rotation_timeout(),
            reload_command: None,
            reload_grace_secs: default_reload_grace(),
            tune: false,
        }
    }
}

impl PipelineConfig {
    pub fn published_path(&self) -> PathBuf {
        self.models_root.join(&self.published_link)
    }

    pub fn rotation_timeout(&self) -> Duration {
        Duration::from_secs(self.rotation_timeout_secs)
    }

    pub fn reload_grace(&self) -> Duration {
        Duration::from_secs(self.reload_grace_secs)
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)
            .map_err(|e| TtpError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| TtpError::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        if self.pipeline.scheduled_hour_utc > 23 {
            return Err(TtpError::Config(format!(
                "scheduled_hour_utc must be 0-23, got {}",
                self.pipeline.scheduled_hour_utc
            )));
        }
        if self.pipeline.rotation_timeout_secs == 0 {
            return Err(TtpError::Config("rotation_timeout_secs must be > 0".into()));
        }
        if self.pipeline.published_link.is_empty()
            || self.pipeline.published_link.contains(std::path::MAIN_SEPARATOR)
        {
            return Err(TtpError::Config(format!(
                "published_link must be a plain file name, got {:?}",
                self.pipeline.published_link
            )));
        }
        if let Some(cmd) = &self.pipeline.reload_command {
            if cmd.is_empty() {
                return Err(TtpError::Config("reload_command must not be empty".into()));
            }
        }
        Ok(())
    }
}
