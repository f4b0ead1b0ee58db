pub mod commands;
pub mod config;
pub mod graceful;
pub mod pipeline;
pub mod publish;
pub mod reload;

pub use config::{PipelineConfig, ServerConfig, TelemetryConfig};
pub use graceful::{setup_signal_handlers, ShutdownCoordinator};
pub use pipeline::{next_wake, PipelineRunner, RotationOutcome, SourceFactory};
pub use reload::{ReloadHook, ReloadOutcome};
