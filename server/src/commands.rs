//! One-shot CLI operations: train, export and infer.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, NaiveDate, NaiveDateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};
use ttp_common::artifact;
use ttp_common::evaluate::{self, Evaluation};
use ttp_common::{
    train_all, CandleFitter, ChunkAssembler, FeatureBuilder, HorizonDataset, ModelConfig,
    ReplaySampler, Result, TelemetrySource, TimeWindow, TrainOptions, TrainSummary, TtpError,
};

/// Parse a CLI timestamp: RFC 3339, `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD` (all UTC).
pub fn parse_time(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(t.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
        .ok_or_else(|| format!("invalid time {:?}: expected RFC 3339 or YYYY-MM-DD", s))
}

#[derive(Debug, Clone, Default)]
pub struct TrainArgs {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub cc: Option<String>,
    pub load: Option<PathBuf>,
    pub save: PathBuf,
    pub continual: bool,
    pub tune: bool,
}

/// Reject inconsistent flag combinations before touching any data.
pub fn check_train_args(args: &TrainArgs, config: &ModelConfig) -> Result<()> {
    if args.continual {
        if args.load.is_none() {
            return Err(TtpError::Config("--continual requires --load".into()));
        }
        if args.from.is_some() || args.to.is_some() {
            return Err(TtpError::Config(
                "--continual samples its own days and conflicts with --from/--to".into(),
            ));
        }
    } else {
        match (args.from, args.to) {
            (Some(from), Some(to)) if from < to => {}
            (Some(_), Some(_)) => {
                return Err(TtpError::Config("--from must be earlier than --to".into()))
            }
            _ => {
                return Err(TtpError::Config(
                    "--from and --to are required unless --continual is set".into(),
                ))
            }
        }
    }

    if artifact::has_models(&args.save)? {
        return Err(TtpError::Config(format!(
            "{} already holds models",
            args.save.display()
        )));
    }
    if let Some(load) = &args.load {
        artifact::require_native(load, config.future_chunks)?;
    }
    Ok(())
}

fn assemble_window(
    config: &ModelConfig,
    source: &dyn TelemetrySource,
    window: &TimeWindow,
    cc: Option<String>,
) -> Result<Vec<HorizonDataset>> {
    let assembly = ChunkAssembler::new(config.video_duration)
        .with_cc_filter(cc)
        .assemble(source, window)?;
    FeatureBuilder::from_config(config).build(&assembly.sessions)
}

/// Build the training sets for `args` (replay sampling when continual).
pub fn training_data(
    config: &ModelConfig,
    source: &dyn TelemetrySource,
    args: &TrainArgs,
    now: DateTime<Utc>,
) -> Result<Vec<HorizonDataset>> {
    if args.continual {
        let end = now
            .duration_trunc(ChronoDuration::hours(1))
            .map_err(|e| TtpError::Config(format!("invalid time {}: {}", now, e)))?;
        let assembler = ChunkAssembler::new(config.video_duration).with_cc_filter(args.cc.clone());
        let builder = FeatureBuilder::from_config(config);
        return ReplaySampler::from_config(config).sample(source, &assembler, &builder, end);
    }

    let (Some(from), Some(to)) = (args.from, args.to) else {
        return Err(TtpError::Config("--from and --to are required".into()));
    };
    assemble_window(config, source, &TimeWindow::new(from, to)?, args.cc.clone())
}

pub fn run_train(
    config: &ModelConfig,
    source: &dyn TelemetrySource,
    args: &TrainArgs,
    now: DateTime<Utc>,
    cancel: &AtomicBool,
) -> Result<Vec<TrainSummary>> {
    check_train_args(args, config)?;

    let datasets = training_data(config, source, args, now)?;
    for (h, dataset) in datasets.iter().enumerate() {
        info!("[horizon {}] {} training rows", h, dataset.len());
    }

    fs::create_dir_all(&args.save).map_err(|e| TtpError::model_io(&args.save, e))?;
    let fitter = CandleFitter::new(
        config.clone(),
        TrainOptions::from_config(config, args.continual, args.tune),
    );
    train_all(&fitter, &datasets, args.load.as_deref(), &args.save, cancel)
}

/// Dump every horizon's rows for `[from, to)` as a labeled set.
pub fn run_export(
    config: &ModelConfig,
    source: &dyn TelemetrySource,
    window: &TimeWindow,
    cc: Option<String>,
    out: &Path,
) -> Result<usize> {
    let datasets = assemble_window(config, source, window, cc)?;
    evaluate::write_labeled_set(out, &datasets)
}

/// Evaluate the native models in `load` on a labeled set, per horizon.
pub fn run_infer(config: &ModelConfig, load: &Path, data: &Path) -> Result<Vec<(usize, Evaluation)>> {
    artifact::require_native(load, config.future_chunks)?;
    let datasets = evaluate::read_labeled_set(data, config.future_chunks, config.dim_in())?;

    let mut results = Vec::new();
    for (h, dataset) in datasets.iter().enumerate() {
        if dataset.is_empty() {
            warn!("[horizon {}] no labeled rows", h);
            continue;
        }
        let predictor = artifact::load_native(&load.join(artifact::native_file(h, "")))?;
        let evaluation = evaluate::evaluate(&predictor, dataset)?;
        info!(
            "[horizon {}] {} rows: loss {:.4}, accuracy {:.2}% (single-label {:.2}%)",
            h,
            evaluation.rows,
            evaluation.loss,
            100.0 * evaluation.accuracy,
            100.0 * evaluation.majority_accuracy
        );
        for d in &evaluation.decoders {
            info!(
                "[horizon {}]   {:?}: MAE {:.4}s, MSE {:.4}s²",
                h, d.estimate, d.mae, d.mse
            );
        }
        results.push((h, evaluation));
    }
    Ok(results)
}
