//! Offline evaluation and the labeled-set file format.
//!
//! A labeled set is a JSON-lines file, one `{"horizon", "x", "y"}` object per
//! row with raw (unnormalized) features and the transmission time in seconds.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::discretizer::{Discretizer, PointEstimate};
use crate::error::{Result, TtpError};
use crate::features::HorizonDataset;
use crate::predictor::{count_correct, Predictor};

/// Rows scored per forward pass.
const EVAL_BATCH: usize = 4096;

/// Class balance of one horizon's labels.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelStats {
    pub histogram: Vec<usize>,
    pub majority_bin: usize,
    /// Accuracy of always predicting `majority_bin`.
    pub majority_accuracy: f64,
}

pub fn label_stats(bins: &[u32], num_bins: usize) -> LabelStats {
    let mut histogram = vec![0usize; num_bins];
    for &b in bins {
        if let Some(slot) = histogram.get_mut(b as usize) {
            *slot += 1;
        }
    }
    let (majority_bin, count) = histogram
        .iter()
        .copied()
        .enumerate()
        .fold((0, 0), |best, (k, c)| if c > best.1 { (k, c) } else { best });
    let majority_accuracy = if bins.is_empty() {
        0.0
    } else {
        count as f64 / bins.len() as f64
    };
    LabelStats {
        histogram,
        majority_bin,
        majority_accuracy,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecoderError {
    pub estimate: PointEstimate,
    /// Mean absolute error in seconds.
    pub mae: f64,
    /// Mean squared error in seconds².
    pub mse: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub rows: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub majority_accuracy: f64,
    pub decoders: Vec<DecoderError>,
}

/// Score a predictor on a labeled dataset of raw rows.
pub fn evaluate(predictor: &Predictor, dataset: &HorizonDataset) -> Result<Evaluation> {
    if dataset.is_empty() {
        return Err(TtpError::Config("cannot evaluate an empty dataset".into()));
    }
    let discretizer: &Discretizer = predictor.discretizer();
    let bins = discretizer.bins(dataset.labels());
    let device = predictor.model().device().clone();
    let dim_in = dataset.dim_in();

    let mut loss_sum = 0.0;
    let mut correct = 0usize;
    let mut abs = [0.0f64; 3];
    let mut sq = [0.0f64; 3];

    let raw = dataset.raw_features();
    for (start, batch_bins) in (0..).step_by(EVAL_BATCH).zip(bins.chunks(EVAL_BATCH)) {
        let n = batch_bins.len();
        let rows = &raw[start * dim_in..(start + n) * dim_in];
        let logits = predictor.logits(rows)?;
        let targets = Tensor::new(batch_bins, &device)?;

        let loss = candle_nn::loss::cross_entropy(&logits, &targets)?.to_scalar::<f64>()?;
        loss_sum += loss * n as f64;
        correct += count_correct(&logits, &targets)?;

        let probs = candle_nn::ops::softmax(&logits, candle_core::D::Minus1)?.to_vec2::<f64>()?;
        for (i, dist) in probs.iter().enumerate() {
            let truth = dataset.label(start + i);
            for (k, estimate) in PointEstimate::ALL.iter().enumerate() {
                let err = discretizer.decode(dist, *estimate) - truth;
                abs[k] += err.abs();
                sq[k] += err * err;
            }
        }
    }

    let n = dataset.len() as f64;
    let decoders = PointEstimate::ALL
        .iter()
        .enumerate()
        .map(|(k, estimate)| DecoderError {
            estimate: *estimate,
            mae: abs[k] / n,
            mse: sq[k] / n,
        })
        .collect();

    Ok(Evaluation {
        rows: dataset.len(),
        loss: loss_sum / n,
        accuracy: correct as f64 / n,
        majority_accuracy: label_stats(&bins, discretizer.num_bins()).majority_accuracy,
        decoders,
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct LabeledRow {
    horizon: usize,
    x: Vec<f64>,
    y: f64,
}

/// Write every horizon's rows; returns the number of lines written.
pub fn write_labeled_set(path: &Path, datasets: &[HorizonDataset]) -> Result<usize> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let mut lines = 0;
    for (horizon, dataset) in datasets.iter().enumerate() {
        for row in dataset.rows() {
            let line = LabeledRow {
                horizon,
                x: row.x,
                y: row.y,
            };
            serde_json::to_writer(&mut writer, &line)?;
            writer.write_all(b"\n")?;
            lines += 1;
        }
    }
    writer.flush()?;
    info!("Wrote {} labeled rows to {}", lines, path.display());
    Ok(lines)
}

/// Read a labeled set into `horizons` datasets of width `dim_in`.
///
/// Rows with an out-of-range horizon or the wrong width are skipped.
pub fn read_labeled_set(path: &Path, horizons: usize, dim_in: usize) -> Result<Vec<HorizonDataset>> {
    let file = File::open(path)?;
    let mut datasets: Vec<HorizonDataset> =
        (0..horizons).map(|_| HorizonDataset::new(dim_in)).collect();

    let mut skipped = 0u64;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row: LabeledRow = match serde_json::from_str(&line) {
            Ok(row) => row,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        let pushed = match datasets.get_mut(row.horizon) {
            Some(dataset) => dataset.push(&row.x, row.y).is_ok(),
            None => false,
        };
        if !pushed {
            skipped += 1;
        }
    }
    if skipped > 0 {
        warn!("Skipped {} unusable rows in {}", skipped, path.display());
    }
    Ok(datasets)
}
