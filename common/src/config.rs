//! Model and training hyperparameters.
//!
//! Every field has a serde default so a partial `[model]` table in the
//! service config is enough.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TtpError};

/// Bytes per packet used to convert sizes and delivery rates.
pub const PKT_BYTES: f64 = 1500.0;

/// Microseconds per second.
pub const MILLION: f64 = 1_000_000.0;

/// TCP statistics carried per chunk: delivery_rate, cwnd, in_flight, min_rtt, rtt.
pub const TCP_FEATURES: usize = 5;

/// Values per past chunk: TCP statistics plus size and transmission time.
pub const PAST_CHUNK_FEATURES: usize = TCP_FEATURES + 2;

/// Width of both hidden layers.
pub const HIDDEN_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_past_chunks")]
    pub past_chunks: usize,
    #[serde(default = "default_future_chunks")]
    pub future_chunks: usize,
    /// Chunk stride in video timestamp ticks.
    #[serde(default = "default_video_duration")]
    pub video_duration: i64,

    /// Output bin width in seconds.
    #[serde(default = "default_bin_size")]
    pub bin_size: f64,
    #[serde(default = "default_bin_max")]
    pub bin_max: usize,

    #[serde(default = "default_num_epochs_cold")]
    pub num_epochs_cold: usize,
    #[serde(default = "default_num_epochs_continual")]
    pub num_epochs_continual: usize,
    #[serde(default = "default_checkpoint")]
    pub checkpoint: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    #[serde(default = "default_cl_max_data_size")]
    pub cl_max_data_size: usize,
    #[serde(default = "default_cl_discount")]
    pub cl_discount: f64,
    #[serde(default = "default_cl_max_days")]
    pub cl_max_days: usize,

    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_past_chunks() -> usize {
    8
}

fn default_future_chunks() -> usize {
    5
}

fn default_video_duration() -> i64 {
    180_180
}

fn default_bin_size() -> f64 {
    0.5
}

fn default_bin_max() -> usize {
    20
}

fn default_num_epochs_cold() -> usize {
    500
}

fn default_num_epochs_continual() -> usize {
    300
}

fn default_checkpoint() -> usize {
    100
}

fn default_batch_size() -> usize {
    32
}

fn default_lr() -> f64 {
    1e-4
}

fn default_weight_decay() -> f64 {
    1e-4
}

fn default_cl_max_data_size() -> usize {
    1_000_000
}

fn default_cl_discount() -> f64 {
    0.9
}

fn default_cl_max_days() -> usize {
    14
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            past_chunks: default_past_chunks(),
            future_chunks: default_future_chunks(),
            video_duration: default_video_duration(),
            bin_size: default_bin_size(),
            bin_max: default_bin_max(),
            num_epochs_cold: default_num_epochs_cold(),
            num_epochs_continual: default_num_epochs_continual(),
            checkpoint: default_checkpoint(),
            batch_size: default_batch_size(),
            lr: default_lr(),
            weight_decay: default_weight_decay(),
            cl_max_data_size: default_cl_max_data_size(),
            cl_discount: default_cl_discount(),
            cl_max_days: default_cl_max_days(),
            seed: None,
        }
    }
}

impl ModelConfig {
    /// Input width: 7 values per past chunk, the next chunk's TCP block, the target size.
    pub fn dim_in(&self) -> usize {
        PAST_CHUNK_FEATURES * self.past_chunks + TCP_FEATURES + 1
    }

    /// Number of output classes.
    pub fn dim_out(&self) -> usize {
        self.bin_max + 1
    }

    pub fn num_epochs(&self, continual: bool) -> usize {
        if continual {
            self.num_epochs_continual
        } else {
            self.num_epochs_cold
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.past_chunks == 0 {
            return Err(TtpError::Config("past_chunks must be >= 1".into()));
        }
        if self.future_chunks == 0 {
            return Err(TtpError::Config("future_chunks must be >= 1".into()));
        }
        if self.video_duration <= 0 {
            return Err(TtpError::Config(format!(
                "video_duration must be positive, got {}",
                self.video_duration
            )));
        }
        if !(self.bin_size.is_finite() && self.bin_size > 0.0) {
            return Err(TtpError::Config(format!(
                "bin_size must be positive, got {}",
                self.bin_size
            )));
        }
        if self.bin_max == 0 {
            return Err(TtpError::Config("bin_max must be >= 1".into()));
        }
        if self.num_epochs_cold == 0 || self.num_epochs_continual == 0 {
            return Err(TtpError::Config("epoch counts must be >= 1".into()));
        }
        if self.checkpoint == 0 {
            return Err(TtpError::Config("checkpoint must be >= 1".into()));
        }
        if self.batch_size == 0 {
            return Err(TtpError::Config("batch_size must be >= 1".into()));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(TtpError::Config(format!("lr must be positive, got {}", self.lr)));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(TtpError::Config(format!(
                "weight_decay must be >= 0, got {}",
                self.weight_decay
            )));
        }
        if self.cl_max_days == 0 || self.cl_max_data_size == 0 {
            return Err(TtpError::Config(
                "cl_max_days and cl_max_data_size must be >= 1".into(),
            ));
        }
        if !(self.cl_discount > 0.0 && self.cl_discount <= 1.0) {
            return Err(TtpError::Config(format!(
                "cl_discount must be in (0, 1], got {}",
                self.cl_discount
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_dimensions() {
        let config = ModelConfig::default();
        assert_eq!(config.dim_in(), 62);
        assert_eq!(config.dim_out(), 21);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_past_chunks_changes_dim_in() {
        let config = ModelConfig {
            past_chunks: 2,
            ..Default::default()
        };
        assert_eq!(config.dim_in(), 20);
    }

    #[test]
    fn test_epochs_by_mode() {
        let config = ModelConfig::default();
        assert_eq!(config.num_epochs(false), 500);
        assert_eq!(config.num_epochs(true), 300);
    }

    #[test]
    fn test_invalid_discount_rejected() {
        let config = ModelConfig {
            cl_discount: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(TtpError::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ModelConfig = serde_json::from_str(r#"{"past_chunks": 4, "seed": 7}"#).unwrap();
        assert_eq!(config.past_chunks, 4);
        assert_eq!(config.future_chunks, 5);
        assert_eq!(config.seed, Some(7));
    }
}
