pub mod artifact;
pub mod assembler;
pub mod config;
pub mod data_quality;
pub mod discretizer;
pub mod error;
pub mod evaluate;
pub mod features;
pub mod normalizer;
pub mod optimizer;
pub mod predictor;
pub mod sampler;
pub mod telemetry;
pub mod trainer;

pub use assembler::{Assembly, AssemblyStats, Chunk, ChunkAssembler, Session};
pub use config::ModelConfig;
pub use discretizer::{Discretizer, PointEstimate};
pub use error::{Result, TtpError};
pub use features::{FeatureBuilder, HorizonDataset, TrainingRow};
pub use normalizer::Normalizer;
pub use predictor::{Predictor, TtpEnsemble, TtpModel};
pub use sampler::ReplaySampler;
pub use telemetry::{
    AckedRecord, JsonlTelemetrySource, MemoryTelemetrySource, SentRecord, SessionId,
    TelemetrySource, TimeWindow,
};
pub use trainer::{train_all, CandleFitter, HorizonTrainer, ModelFitter, TrainOptions, TrainSummary};
