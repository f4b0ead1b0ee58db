//! The daily continual-learning loop.
//!
//! Once a day at the scheduled UTC hour: replay-sample recent telemetry, train
//! every horizon starting from the published models, publish the new set and
//! ask the inference consumer to reload. A failed or cancelled rotation leaves
//! the published models untouched; the loop simply waits for the next day.

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, NaiveTime, TimeZone, Utc};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};
use ttp_common::artifact;
use ttp_common::{
    train_all, ChunkAssembler, FeatureBuilder, ModelFitter, ReplaySampler, Result,
    TelemetrySource, TrainSummary, TtpError,
};

use crate::config::ServerConfig;
use crate::graceful::ShutdownCoordinator;
use crate::publish;
use crate::reload::{ReloadHook, ReloadOutcome};

/// Next occurrence of `hour:00` UTC strictly after `now`.
pub fn next_wake(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    let today = Utc.from_utc_datetime(&now.date_naive().and_time(at));
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

#[derive(Debug, Clone)]
pub struct RotationOutcome {
    pub dir: PathBuf,
    pub summaries: Vec<TrainSummary>,
    pub elapsed: Duration,
    pub reload: ReloadOutcome,
}

/// Opens the telemetry store for one rotation.
pub type SourceFactory = Arc<dyn Fn() -> Result<Arc<dyn TelemetrySource>> + Send + Sync>;

#[derive(Clone)]
pub struct PipelineRunner {
    config: Arc<ServerConfig>,
    source: SourceFactory,
    fitter: Arc<dyn ModelFitter>,
    reload: ReloadHook,
}

impl PipelineRunner {
    pub fn new(config: ServerConfig, source: SourceFactory, fitter: Arc<dyn ModelFitter>) -> Self {
        let reload = ReloadHook::new(
            config.pipeline.reload_command.clone(),
            config.pipeline.reload_grace(),
        );
        Self {
            config: Arc::new(config),
            source,
            fitter,
            reload,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Sample, train and publish synchronously. `now` fixes the replay window
    /// and the rotation directory name.
    pub fn rotate_blocking(&self, now: DateTime<Utc>, cancel: &AtomicBool) -> Result<(PathBuf, Vec<TrainSummary>)> {
        let model = &self.config.model;
        let pipeline = &self.config.pipeline;
        let cc = self.config.telemetry.cc.as_deref();
        let link = pipeline.published_path();

        let load_from = publish::resolve_published(&link)?
            .ok_or_else(|| TtpError::model_io(&link, "no published models to continue from"))?;
        artifact::require_native(&load_from, model.future_chunks)?;

        let end = now
            .duration_trunc(ChronoDuration::hours(1))
            .map_err(|e| TtpError::Config(format!("rotation time {}: {}", now, e)))?;
        let assembler = ChunkAssembler::new(model.video_duration).with_cc_filter(cc.map(String::from));
        let builder = FeatureBuilder::from_config(model);
        let source = (self.source)()?;
        let datasets = ReplaySampler::from_config(model).sample(source.as_ref(), &assembler, &builder, end)?;

        if cancel.load(Ordering::SeqCst) {
            return Err(TtpError::Cancelled("rotation cancelled after sampling".into()));
        }

        let dir = publish::next_rotation_dir(&pipeline.models_root, cc, now.date_naive());
        fs::create_dir_all(&dir).map_err(|e| TtpError::model_io(&dir, e))?;
        info!(
            "Continual learning: loaded {} and training {}",
            load_from.display(),
            dir.display()
        );

        let summaries = train_all(self.fitter.as_ref(), &datasets, Some(&load_from), &dir, cancel)?;
        if cancel.load(Ordering::SeqCst) {
            return Err(TtpError::Cancelled("rotation cancelled before publishing".into()));
        }
        publish::publish(&link, &dir, model.future_chunks)?;
        Ok((dir, summaries))
    }

    /// One rotation on a blocking thread, bounded by the configured wall-clock
    /// cap and interrupted by shutdown.
    pub async fn rotate(
        &self,
        now: DateTime<Utc>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RotationOutcome> {
        let started = Instant::now();
        let cancel = Arc::new(AtomicBool::new(false));
        let budget = self.config.pipeline.rotation_timeout();

        let runner = self.clone();
        let flag = cancel.clone();
        let mut handle = tokio::task::spawn_blocking(move || runner.rotate_blocking(now, &flag));

        let (joined, interrupted) = tokio::select! {
            joined = &mut handle => (joined, None),
            _ = tokio::time::sleep(budget) => {
                warn!("Rotation exceeded {:.0}s; cancelling trainers", budget.as_secs_f64());
                cancel.store(true, Ordering::SeqCst);
                let reason = format!("rotation exceeded its {}s budget", budget.as_secs());
                (handle.await, Some(reason))
            }
            _ = shutdown.changed() => {
                info!("Shutdown requested; cancelling rotation");
                cancel.store(true, Ordering::SeqCst);
                (handle.await, Some("shutdown during rotation".to_string()))
            }
        };

        // The blocking task may publish before it sees the flag; a finished
        // publish is reported as such.
        let (dir, summaries) = match joined {
            Ok(Ok(done)) => {
                if let Some(reason) = &interrupted {
                    warn!("Rotation published despite cancellation ({})", reason);
                }
                done
            }
            Ok(Err(TtpError::Cancelled(inner))) => {
                return Err(TtpError::Cancelled(interrupted.unwrap_or(inner)));
            }
            Ok(Err(e)) => return Err(e),
            Err(e) => return Err(TtpError::Cancelled(format!("rotation task failed: {}", e))),
        };

        let elapsed = started.elapsed();
        info!(
            "Continual learning: new model {} is available after {:.2} hours",
            dir.display(),
            elapsed.as_secs_f64() / 3600.0
        );

        let reload = self.reload.signal(&self.config.pipeline.published_path()).await;
        Ok(RotationOutcome {
            dir,
            summaries,
            elapsed,
            reload,
        })
    }

    /// Run rotations at the scheduled hour until shutdown.
    pub async fn run(&self, coordinator: &ShutdownCoordinator) -> Result<()> {
        let mut shutdown = coordinator.shutdown_receiver();
        let hour = self.config.pipeline.scheduled_hour_utc;

        loop {
            let now = Utc::now();
            let wake = next_wake(now, hour);
            info!("Sleeping until {} (UTC) to perform continual learning", wake);
            let pause = (wake - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => {
                    info!("Scheduler stopped");
                    return Ok(());
                }
            }

            let _guard = coordinator.register_rotation();
            match self.rotate(wake, &mut shutdown).await {
                Ok(outcome) => {
                    for s in &outcome.summaries {
                        info!(
                            "[horizon {}] {} rows, {} epochs, final loss {:.6}",
                            s.horizon, s.rows, s.epochs, s.train_loss
                        );
                    }
                }
                Err(e) if *shutdown.borrow() => {
                    info!("Rotation abandoned during shutdown: {}", e);
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!("Rotation skipped, will retry at next scheduled hour: {}", e);
                }
                Err(e) => {
                    error!("Rotation aborted, previous models stay live: {}", e);
                }
            }
        }
    }
}
