//! Error type shared by every stage of the predictor pipeline.
//!
//! Record-level anomalies (orphan acks, gaps, malformed lines) are never
//! surfaced here; they are counted and skipped where they occur.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TtpError>;

#[derive(Debug, Error)]
pub enum TtpError {
    // ── Configuration ────────────────────────────────────────────
    /// Invalid CLI or configuration value. Fatal before any work starts.
    #[error("configuration error: {0}")]
    Config(String),

    // ── Telemetry ────────────────────────────────────────────────
    /// The data source could not be reached or opened.
    #[error("telemetry unavailable: {0}")]
    TelemetryUnavailable(String),

    /// The same `(session, video_ts)` key was reported twice.
    #[error("telemetry inconsistent: {0}")]
    TelemetryInconsistent(String),

    // ── Models ───────────────────────────────────────────────────
    /// A prior artifact is unreadable or a target directory is unwritable.
    #[error("model I/O error at {path:?}: {reason}")]
    ModelIo { path: PathBuf, reason: String },

    /// A horizon produced a non-finite loss.
    #[error("horizon {horizon} diverged at epoch {epoch} (loss {loss})")]
    TrainingDiverged {
        horizon: usize,
        epoch: usize,
        loss: f64,
    },

    /// No rows were available to train a horizon.
    #[error("horizon {horizon} has no training rows")]
    InsufficientData { horizon: usize },

    /// A rotation or training run was stopped before completion.
    #[error("cancelled: {0}")]
    Cancelled(String),

    // ── Wrapped ──────────────────────────────────────────────────
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TtpError {
    pub fn model_io(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        TtpError::ModelIo {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Process exit code for the CLI: 2 configuration, 3 I/O, 4 training.
    pub fn exit_code(&self) -> u8 {
        match self {
            TtpError::Config(_) => 2,
            TtpError::TelemetryUnavailable(_)
            | TtpError::TelemetryInconsistent(_)
            | TtpError::ModelIo { .. }
            | TtpError::Io(_)
            | TtpError::Json(_) => 3,
            TtpError::TrainingDiverged { .. }
            | TtpError::InsufficientData { .. }
            | TtpError::Cancelled(_)
            | TtpError::Tensor(_) => 4,
        }
    }

    /// Whether the daily loop should simply retry at the next scheduled hour.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TtpError::TelemetryUnavailable(_) | TtpError::Cancelled(_)
        )
    }
}
