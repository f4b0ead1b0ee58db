//! Per-horizon training and the parallel driver over all horizons.
//!
//! Each horizon owns its model, optimizer and normalizer; nothing is shared
//! between horizons except the cancel flag. Cancellation is checked at epoch
//! boundaries only, so the last written checkpoint always stays intact.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use candle_core::Tensor;
use candle_nn::Optimizer;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info};

use crate::artifact::{self, LossCurve, SaveKind};
use crate::config::ModelConfig;
use crate::discretizer::Discretizer;
use crate::error::{Result, TtpError};
use crate::evaluate::label_stats;
use crate::features::HorizonDataset;
use crate::normalizer::Normalizer;
use crate::optimizer::{Adam, ParamsAdam};
use crate::predictor::{count_correct, Predictor, TtpModel};

/// Fraction of rows held out for validation in tuning mode.
pub const VALIDATION_FRACTION: f64 = 0.2;

const SCORE_BATCH: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOptions {
    pub num_epochs: usize,
    pub checkpoint: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub weight_decay: f64,
    /// Hold out a validation split and record its loss every epoch.
    pub tune: bool,
    pub seed: Option<u64>,
}

impl TrainOptions {
    pub fn from_config(config: &ModelConfig, continual: bool, tune: bool) -> Self {
        Self {
            num_epochs: config.num_epochs(continual),
            checkpoint: config.checkpoint,
            batch_size: config.batch_size,
            lr: config.lr,
            weight_decay: config.weight_decay,
            tune,
            seed: config.seed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Created,
    Loaded,
    Normalized,
    Training(usize),
    Checkpointed(usize),
    Finalized,
    Failed,
}

impl fmt::Display for TrainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainerState::Created => write!(f, "created"),
            TrainerState::Loaded => write!(f, "loaded"),
            TrainerState::Normalized => write!(f, "normalized"),
            TrainerState::Training(epoch) => write!(f, "training (epoch {})", epoch),
            TrainerState::Checkpointed(epoch) => write!(f, "checkpointed (epoch {})", epoch),
            TrainerState::Finalized => write!(f, "finalized"),
            TrainerState::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of one horizon's training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub horizon: usize,
    pub rows: usize,
    pub epochs: usize,
    pub train_loss: f64,
    pub validate_loss: Option<f64>,
    pub validate_accuracy: Option<f64>,
}

struct Split {
    x: Tensor,
    bins: Tensor,
    len: usize,
}

pub struct HorizonTrainer {
    horizon: usize,
    model: TtpModel,
    normalizer: Normalizer,
    discretizer: Discretizer,
    options: TrainOptions,
    state: TrainerState,
    losses: LossCurve,
}

impl HorizonTrainer {
    /// Fresh model for `horizon` (cold start).
    pub fn new(horizon: usize, config: &ModelConfig, options: TrainOptions) -> Result<Self> {
        let model = match options.seed {
            Some(seed) => TtpModel::seeded(
                config.dim_in(),
                config.dim_out(),
                seed.wrapping_add(horizon as u64),
            )?,
            None => TtpModel::new(config.dim_in(), config.dim_out())?,
        };
        Ok(Self {
            horizon,
            model,
            normalizer: Normalizer::new(config.dim_in()),
            discretizer: Discretizer::from_config(config),
            options,
            state: TrainerState::Created,
            losses: LossCurve::default(),
        })
    }

    /// Replace the fresh model with the native artifact in `dir` (continual step).
    pub fn load(&mut self, dir: &Path) -> Result<()> {
        let path = dir.join(artifact::native_file(self.horizon, ""));
        let (model, normalizer, discretizer) = artifact::load_native(&path)?.into_parts();
        if model.dim_in() != self.model.dim_in() || discretizer != self.discretizer {
            return Err(TtpError::model_io(
                &path,
                format!(
                    "artifact shape (dim_in {}, {} bins) does not match configuration (dim_in {}, {} bins)",
                    model.dim_in(),
                    discretizer.num_bins(),
                    self.model.dim_in(),
                    self.discretizer.num_bins()
                ),
            ));
        }
        self.model = model;
        self.normalizer = normalizer;
        self.state = TrainerState::Loaded;
        info!(
            "[horizon {}] Loaded {} (normalizer over {} rows)",
            self.horizon,
            path.display(),
            self.normalizer.size()
        );
        Ok(())
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn losses(&self) -> &LossCurve {
        &self.losses
    }

    pub fn into_predictor(self) -> Result<Predictor> {
        Predictor::new(self.model, self.normalizer, self.discretizer)
    }

    /// Train on raw rows and write artifacts under `save_dir`.
    pub fn fit(
        &mut self,
        dataset: &HorizonDataset,
        save_dir: &Path,
        cancel: &AtomicBool,
    ) -> Result<TrainSummary> {
        let result = self.run(dataset, save_dir, cancel);
        if result.is_err() {
            self.state = TrainerState::Failed;
        }
        result
    }

    fn run(
        &mut self,
        dataset: &HorizonDataset,
        save_dir: &Path,
        cancel: &AtomicBool,
    ) -> Result<TrainSummary> {
        let h = self.horizon;
        if dataset.is_empty() {
            return Err(TtpError::InsufficientData { horizon: h });
        }
        if dataset.dim_in() != self.model.dim_in() {
            return Err(TtpError::Config(format!(
                "horizon {} dataset has {} features, model expects {}",
                h,
                dataset.dim_in(),
                self.model.dim_in()
            )));
        }

        self.normalizer.observe(dataset.raw_features())?;
        self.state = TrainerState::Normalized;

        let mut x = dataset.raw_features().to_vec();
        self.normalizer.apply_in_place(&mut x);
        let bins = self.discretizer.bins(dataset.labels());

        let stats = label_stats(&bins, self.discretizer.num_bins());
        info!(
            "[horizon {}] {} rows, majority bin {} ({:.2}% single-label accuracy)",
            h,
            bins.len(),
            stats.majority_bin,
            100.0 * stats.majority_accuracy
        );
        debug!("[horizon {}] bin histogram {:?}", h, stats.histogram);

        let mut rng = match self.options.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed.wrapping_add(h as u64)),
            None => ChaCha8Rng::from_entropy(),
        };

        let mut order: Vec<usize> = (0..bins.len()).collect();
        let (train_idx, validate_idx) = if self.options.tune {
            order.shuffle(&mut rng);
            let held_out = ((order.len() as f64) * VALIDATION_FRACTION).floor() as usize;
            let validate = order.split_off(order.len() - held_out);
            (order, validate)
        } else {
            (order, Vec::new())
        };
        if train_idx.is_empty() {
            return Err(TtpError::InsufficientData { horizon: h });
        }

        let train = self.split(&x, &bins, &train_idx)?;
        let validate = if validate_idx.is_empty() {
            None
        } else {
            Some(self.split(&x, &bins, &validate_idx)?)
        };

        let mut optimizer = Adam::new(
            self.model.all_vars(),
            ParamsAdam {
                lr: self.options.lr,
                weight_decay: self.options.weight_decay,
                ..Default::default()
            },
        )?;

        self.losses = LossCurve::default();
        let num_epochs = self.options.num_epochs;
        let mut positions: Vec<u32> = (0..train.len as u32).collect();
        let mut summary = TrainSummary {
            horizon: h,
            rows: dataset.len(),
            epochs: 0,
            train_loss: f64::NAN,
            validate_loss: None,
            validate_accuracy: None,
        };

        for epoch in 1..=num_epochs {
            if cancel.load(Ordering::SeqCst) {
                info!("[horizon {}] Cancelled before epoch {}", h, epoch);
                return Err(TtpError::Cancelled(format!(
                    "horizon {} stopped before epoch {}",
                    h, epoch
                )));
            }
            self.state = TrainerState::Training(epoch);

            positions.shuffle(&mut rng);
            let mut loss_sum = 0.0;
            for batch in positions.chunks(self.options.batch_size) {
                let idx = Tensor::new(batch, self.model.device())?;
                let xb = train.x.index_select(&idx, 0)?;
                let yb = train.bins.index_select(&idx, 0)?;
                let loss = self.model.loss(&xb, &yb)?;
                optimizer.backward_step(&loss)?;
                loss_sum += loss.to_scalar::<f64>()? * batch.len() as f64;
            }
            // tuning curves score the whole split with the epoch's final weights
            let train_loss = if validate.is_some() {
                self.score(&train)?.0
            } else {
                loss_sum / train.len as f64
            };

            if !train_loss.is_finite() {
                error!(
                    "[horizon {}] Diverged at epoch {} (loss {})",
                    h, epoch, train_loss
                );
                return Err(TtpError::TrainingDiverged {
                    horizon: h,
                    epoch,
                    loss: train_loss,
                });
            }
            self.losses.train.push(train_loss);
            summary.epochs = epoch;
            summary.train_loss = train_loss;

            if let Some(val) = &validate {
                let (loss, accuracy) = self.score(val)?;
                self.losses.validate.push(loss);
                summary.validate_loss = Some(loss);
                summary.validate_accuracy = Some(accuracy);
                debug!(
                    "[horizon {}] epoch {}/{}: train loss {:.6}, validate loss {:.6}, accuracy {:.4}",
                    h, epoch, num_epochs, train_loss, loss, accuracy
                );
            } else {
                debug!(
                    "[horizon {}] epoch {}/{}: train loss {:.6}",
                    h, epoch, num_epochs, train_loss
                );
            }

            let last = epoch == num_epochs;
            if last || epoch % self.options.checkpoint == 0 {
                let kind = if last {
                    SaveKind::Final
                } else {
                    SaveKind::Checkpoint(epoch)
                };
                self.save(save_dir, kind)?;
                self.state = TrainerState::Checkpointed(epoch);
                info!(
                    "[horizon {}] Checkpoint at epoch {} (loss {:.6})",
                    h, epoch, train_loss
                );
            }
        }

        self.state = TrainerState::Finalized;
        info!(
            "[horizon {}] Finished {} epochs, final loss {:.6}",
            h, num_epochs, summary.train_loss
        );
        Ok(summary)
    }

    fn split(&self, x: &[f64], bins: &[u32], indices: &[usize]) -> Result<Split> {
        let dim = self.model.dim_in();
        let mut xs = Vec::with_capacity(indices.len() * dim);
        let mut ys = Vec::with_capacity(indices.len());
        for &i in indices {
            xs.extend_from_slice(&x[i * dim..(i + 1) * dim]);
            ys.push(bins[i]);
        }
        let device = self.model.device();
        Ok(Split {
            x: Tensor::from_vec(xs, (indices.len(), dim), device)?,
            bins: Tensor::from_vec(ys, indices.len(), device)?,
            len: indices.len(),
        })
    }

    /// Mean loss and accuracy over a whole split, in bounded batches.
    fn score(&self, split: &Split) -> Result<(f64, f64)> {
        let mut loss_sum = 0.0;
        let mut correct = 0;
        let mut start = 0;
        while start < split.len {
            let n = SCORE_BATCH.min(split.len - start);
            let x = split.x.narrow(0, start, n)?;
            let bins = split.bins.narrow(0, start, n)?;
            let logits = self.model.forward(&x)?;
            loss_sum += candle_nn::loss::cross_entropy(&logits, &bins)?.to_scalar::<f64>()? * n as f64;
            correct += count_correct(&logits, &bins)?;
            start += n;
        }
        Ok((
            loss_sum / split.len as f64,
            correct as f64 / split.len as f64,
        ))
    }

    pub fn save(&self, save_dir: &Path, kind: SaveKind) -> Result<()> {
        artifact::save_horizon(
            save_dir,
            self.horizon,
            kind,
            &self.model,
            &self.normalizer,
            &self.discretizer,
        )?;
        artifact::save_loss(save_dir, self.horizon, &self.losses)
    }
}

/// Trains one horizon. The rotation only depends on this seam, so it can run
/// against a stub.
pub trait ModelFitter: Send + Sync {
    fn fit_horizon(
        &self,
        horizon: usize,
        dataset: &HorizonDataset,
        load_from: Option<&Path>,
        save_to: &Path,
        cancel: &AtomicBool,
    ) -> Result<TrainSummary>;
}

/// The real fitter: candle network, Adam, artifacts on disk.
#[derive(Debug, Clone)]
pub struct CandleFitter {
    config: ModelConfig,
    options: TrainOptions,
}

impl CandleFitter {
    pub fn new(config: ModelConfig, options: TrainOptions) -> Self {
        Self { config, options }
    }
}

impl ModelFitter for CandleFitter {
    fn fit_horizon(
        &self,
        horizon: usize,
        dataset: &HorizonDataset,
        load_from: Option<&Path>,
        save_to: &Path,
        cancel: &AtomicBool,
    ) -> Result<TrainSummary> {
        let mut trainer = HorizonTrainer::new(horizon, &self.config, self.options.clone())?;
        if let Some(dir) = load_from {
            trainer.load(dir)?;
        }
        trainer.fit(dataset, save_to, cancel)
    }
}

/// Compute threads given to each of `horizons` concurrent trainers.
pub fn threads_per_horizon(horizons: usize) -> usize {
    let available = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (available / horizons.max(1)).max(1)
}

/// Train every horizon concurrently, one thread and one rayon pool each.
///
/// All horizons run to completion or failure; the first failing horizon's
/// error is returned.
pub fn train_all(
    fitter: &dyn ModelFitter,
    datasets: &[HorizonDataset],
    load_from: Option<&Path>,
    save_to: &Path,
    cancel: &AtomicBool,
) -> Result<Vec<TrainSummary>> {
    let threads = threads_per_horizon(datasets.len());
    info!(
        "Training {} horizons with {} threads each",
        datasets.len(),
        threads
    );

    let results: Vec<Result<TrainSummary>> = thread::scope(|scope| {
        let handles: Vec<_> = datasets
            .iter()
            .enumerate()
            .map(|(h, dataset)| {
                thread::Builder::new()
                    .name(format!("ttp-train-{}", h))
                    .spawn_scoped(scope, move || -> Result<TrainSummary> {
                        let pool = rayon::ThreadPoolBuilder::new()
                            .num_threads(threads)
                            .thread_name(move |i| format!("ttp-train-{}-{}", h, i))
                            .build()
                            .map_err(|e| TtpError::Config(format!("thread pool: {}", e)))?;
                        pool.install(|| fitter.fit_horizon(h, dataset, load_from, save_to, cancel))
                    })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(h, handle)| match handle {
                Ok(handle) => handle.join().unwrap_or_else(|_| {
                    Err(TtpError::Cancelled(format!("trainer for horizon {} panicked", h)))
                }),
                Err(e) => Err(TtpError::Io(e)),
            })
            .collect()
    });

    let mut summaries = Vec::with_capacity(results.len());
    let mut first_error = None;
    for (h, result) in results.into_iter().enumerate() {
        match result {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                error!("[horizon {}] Training failed: {}", h, e);
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(summaries),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            past_chunks: 1,
            future_chunks: 2,
            num_epochs_cold: 3,
            num_epochs_continual: 2,
            checkpoint: 2,
            batch_size: 4,
            lr: 1e-2,
            seed: Some(11),
            ..Default::default()
        }
    }

    fn tiny_dataset(config: &ModelConfig, rows: usize) -> HorizonDataset {
        let dim = config.dim_in();
        let mut ds = HorizonDataset::new(dim);
        for i in 0..rows {
            let x: Vec<f64> = (0..dim).map(|j| ((i * 7 + j * 3) % 13) as f64).collect();
            let y = if i % 2 == 0 { 0.1 } else { 1.1 };
            ds.push(&x, y).unwrap();
        }
        ds
    }

    #[test]
    fn test_fit_writes_checkpoint_and_final_artifacts() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config();
        let options = TrainOptions::from_config(&config, false, false);
        let mut trainer = HorizonTrainer::new(0, &config, options).unwrap();
        assert_eq!(trainer.state(), TrainerState::Created);

        let summary = trainer
            .fit(&tiny_dataset(&config, 10), dir.path(), &AtomicBool::new(false))
            .unwrap();

        assert_eq!(trainer.state(), TrainerState::Finalized);
        assert_eq!(summary.epochs, 3);
        assert!(summary.train_loss.is_finite());
        assert!(summary.validate_loss.is_none());
        assert_eq!(trainer.losses().train.len(), 3);
        assert_eq!(trainer.normalizer().size(), 10);

        assert!(dir.path().join("py-0.pt").is_file());
        assert!(dir.path().join("cpp-0.pt").is_file());
        assert!(dir.path().join("cpp-meta-0.json").is_file());
        assert!(dir.path().join("loss-0.json").is_file());
        assert!(dir
            .path()
            .join("checkpoints")
            .join("py-0-checkpoint-2.pt")
            .is_file());
    }

    #[test]
    fn test_tuning_records_validation_loss() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config();
        let options = TrainOptions::from_config(&config, false, true);
        let mut trainer = HorizonTrainer::new(1, &config, options).unwrap();
        let summary = trainer
            .fit(&tiny_dataset(&config, 20), dir.path(), &AtomicBool::new(false))
            .unwrap();

        assert!(summary.validate_loss.is_some());
        assert_eq!(trainer.losses().validate.len(), 3);
    }

    #[test]
    fn test_tuning_train_loss_scores_final_weights() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config();
        let dim = config.dim_in();
        let x: Vec<f64> = (0..dim).map(|j| j as f64).collect();
        let mut ds = HorizonDataset::new(dim);
        for _ in 0..20 {
            ds.push(&x, 1.1).unwrap();
        }

        let options = TrainOptions::from_config(&config, false, true);
        let mut trainer = HorizonTrainer::new(0, &config, options).unwrap();
        trainer.fit(&ds, dir.path(), &AtomicBool::new(false)).unwrap();

        // identical rows: the whole-split loss equals the loss of any single row
        let mut row = x.clone();
        trainer.normalizer.apply_in_place(&mut row);
        let input = trainer.model.input_tensor(row).unwrap();
        let bins = Tensor::new(&[trainer.discretizer.bin(1.1) as u32], trainer.model.device()).unwrap();
        let expected = trainer
            .model
            .loss(&input, &bins)
            .unwrap()
            .to_scalar::<f64>()
            .unwrap();

        let recorded = *trainer.losses().train.last().unwrap();
        assert!((recorded - expected).abs() < 1e-9, "{} vs {}", recorded, expected);
        assert_eq!(trainer.losses().validate.len(), 3);
    }

    #[test]
    fn test_empty_dataset_is_insufficient() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config();
        let mut trainer =
            HorizonTrainer::new(4, &config, TrainOptions::from_config(&config, false, false))
                .unwrap();
        let err = trainer
            .fit(
                &HorizonDataset::new(config.dim_in()),
                dir.path(),
                &AtomicBool::new(false),
            )
            .unwrap_err();
        assert!(matches!(err, TtpError::InsufficientData { horizon: 4 }));
        assert_eq!(trainer.state(), TrainerState::Failed);
    }

    #[test]
    fn test_cancel_flag_stops_before_first_epoch() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config();
        let mut trainer =
            HorizonTrainer::new(0, &config, TrainOptions::from_config(&config, false, false))
                .unwrap();
        let err = trainer
            .fit(&tiny_dataset(&config, 8), dir.path(), &AtomicBool::new(true))
            .unwrap_err();
        assert!(matches!(err, TtpError::Cancelled(_)));
        assert!(!dir.path().join("py-0.pt").exists());
    }

    #[test]
    fn test_continual_step_extends_normalizer() {
        let dir = TempDir::new().unwrap();
        let config = tiny_config();
        let cold = CandleFitter::new(
            config.clone(),
            TrainOptions::from_config(&config, false, false),
        );
        cold.fit_horizon(
            0,
            &tiny_dataset(&config, 10),
            None,
            dir.path(),
            &AtomicBool::new(false),
        )
        .unwrap();

        let next = TempDir::new().unwrap();
        let mut trainer =
            HorizonTrainer::new(0, &config, TrainOptions::from_config(&config, true, false))
                .unwrap();
        trainer.load(dir.path()).unwrap();
        assert_eq!(trainer.state(), TrainerState::Loaded);
        let summary = trainer
            .fit(&tiny_dataset(&config, 6), next.path(), &AtomicBool::new(false))
            .unwrap();
        assert_eq!(summary.epochs, 2);
        assert_eq!(trainer.normalizer().size(), 16);
    }

    #[test]
    fn test_threads_per_horizon_is_at_least_one() {
        assert!(threads_per_horizon(1000) >= 1);
        assert!(threads_per_horizon(0) >= 1);
    }
}
