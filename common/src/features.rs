//! Turns assembled sessions into one supervised dataset per horizon.
//!
//! Row layout for `P` past chunks (62 values when `P = 8`):
//!
//! ```text
//! [ past_P .. past_1 ]           7 values each, oldest first
//!   delivery_rate cwnd in_flight min_rtt rtt size trans_time
//! [ next-chunk TCP ]             5 values (the anchor chunk)
//! [ target size ]                1 value
//! ```
//!
//! Label: transmission time of the target chunk in seconds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::assembler::Session;
use crate::config::{ModelConfig, PAST_CHUNK_FEATURES, TCP_FEATURES};
use crate::error::{Result, TtpError};
use crate::telemetry::SessionId;

/// A single `(x, y)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRow {
    pub x: Vec<f64>,
    pub y: f64,
}

/// Rows for one horizon model, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct HorizonDataset {
    dim_in: usize,
    features: Vec<f64>,
    labels: Vec<f64>,
}

impl HorizonDataset {
    pub fn new(dim_in: usize) -> Self {
        Self {
            dim_in,
            features: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn with_capacity(dim_in: usize, rows: usize) -> Self {
        Self {
            dim_in,
            features: Vec::with_capacity(rows * dim_in),
            labels: Vec::with_capacity(rows),
        }
    }

    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn push(&mut self, x: &[f64], y: f64) -> Result<()> {
        if x.len() != self.dim_in {
            return Err(TtpError::Config(format!(
                "row has {} features, expected {}",
                x.len(),
                self.dim_in
            )));
        }
        self.features.extend_from_slice(x);
        self.labels.push(y);
        Ok(())
    }

    /// Append row `index` of `other`.
    pub fn push_from(&mut self, other: &HorizonDataset, index: usize) {
        debug_assert_eq!(self.dim_in, other.dim_in);
        self.features.extend_from_slice(other.features(index));
        self.labels.push(other.labels[index]);
    }

    pub fn features(&self, index: usize) -> &[f64] {
        &self.features[index * self.dim_in..(index + 1) * self.dim_in]
    }

    pub fn label(&self, index: usize) -> f64 {
        self.labels[index]
    }

    pub fn labels(&self) -> &[f64] {
        &self.labels
    }

    /// Every row, row-major.
    pub fn raw_features(&self) -> &[f64] {
        &self.features
    }

    /// Append all rows of `other`.
    pub fn extend(&mut self, other: &HorizonDataset) {
        debug_assert_eq!(self.dim_in, other.dim_in);
        self.features.extend_from_slice(&other.features);
        self.labels.extend_from_slice(&other.labels);
    }

    /// Gather rows into a flat row-major buffer plus labels.
    pub fn gather(&self, indices: &[usize]) -> (Vec<f64>, Vec<f64>) {
        let mut x = Vec::with_capacity(indices.len() * self.dim_in);
        let mut y = Vec::with_capacity(indices.len());
        for &i in indices {
            x.extend_from_slice(self.features(i));
            y.push(self.labels[i]);
        }
        (x, y)
    }

    pub fn subset(&self, indices: &[usize]) -> HorizonDataset {
        let (features, labels) = self.gather(indices);
        HorizonDataset {
            dim_in: self.dim_in,
            features,
            labels,
        }
    }

    pub fn truncate(&mut self, rows: usize) {
        if rows < self.len() {
            self.labels.truncate(rows);
            self.features.truncate(rows * self.dim_in);
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = TrainingRow> + '_ {
        (0..self.len()).map(move |i| TrainingRow {
            x: self.features(i).to_vec(),
            y: self.labels[i],
        })
    }
}

#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    past_chunks: usize,
    future_chunks: usize,
    video_duration: i64,
}

impl FeatureBuilder {
    pub fn new(past_chunks: usize, future_chunks: usize, video_duration: i64) -> Self {
        Self {
            past_chunks,
            future_chunks,
            video_duration,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(
            config.past_chunks,
            config.future_chunks,
            config.video_duration,
        )
    }

    pub fn dim_in(&self) -> usize {
        PAST_CHUNK_FEATURES * self.past_chunks + TCP_FEATURES + 1
    }

    pub fn future_chunks(&self) -> usize {
        self.future_chunks
    }

    pub fn empty_datasets(&self) -> Vec<HorizonDataset> {
        (0..self.future_chunks)
            .map(|_| HorizonDataset::new(self.dim_in()))
            .collect()
    }

    /// Build `future_chunks` datasets from every session, in key order.
    pub fn build(&self, sessions: &BTreeMap<SessionId, Session>) -> Result<Vec<HorizonDataset>> {
        let mut datasets = self.empty_datasets();
        for session in sessions.values() {
            self.append_session(session, &mut datasets)?;
        }
        Ok(datasets)
    }

    pub fn append_session(&self, session: &Session, datasets: &mut [HorizonDataset]) -> Result<()> {
        debug_assert_eq!(datasets.len(), self.future_chunks);

        let mut row = Vec::with_capacity(self.dim_in());
        for (&anchor_ts, anchor) in &session.chunks {
            if anchor.trans_time.is_none() {
                continue;
            }

            row.clear();
            self.append_past_chunks(session, anchor_ts, &mut row);
            row.extend_from_slice(&anchor.tcp_features());
            let prefix = row.len();

            for (h, dataset) in datasets.iter_mut().enumerate() {
                let target_ts = anchor_ts + h as i64 * self.video_duration;
                let Some(target) = session.acked(target_ts) else {
                    continue;
                };
                let Some(trans_time) = target.trans_time else {
                    continue;
                };

                row.truncate(prefix);
                row.push(target.size);
                dataset.push(&row, trans_time)?;
            }
        }
        Ok(())
    }

    /// Past-chunk block, oldest first, padded from the nearest newer chunk.
    fn append_past_chunks(&self, session: &Session, anchor_ts: i64, row: &mut Vec<f64>) {
        let mut past: Vec<[f64; PAST_CHUNK_FEATURES]> = Vec::with_capacity(self.past_chunks);
        let mut padding = None;

        for i in 1..=self.past_chunks as i64 {
            let ts = anchor_ts - i * self.video_duration;
            if let Some(chunk) = session.acked(ts) {
                past.push(past_tuple(
                    chunk.tcp_features(),
                    chunk.size,
                    chunk.trans_time.unwrap_or_default(),
                ));
                continue;
            }

            let newer_ts = ts + self.video_duration;
            let Some(newer) = session.get(newer_ts) else {
                break;
            };
            padding = Some(if newer_ts == anchor_ts {
                past_tuple(newer.tcp_features(), 0.0, 0.0)
            } else {
                past_tuple(
                    newer.tcp_features(),
                    newer.size,
                    newer.trans_time.unwrap_or_default(),
                )
            });
            break;
        }

        if let Some(pad) = padding {
            while past.len() < self.past_chunks {
                past.push(pad);
            }
        }

        // collected newest first
        for tuple in past.iter().rev() {
            row.extend_from_slice(tuple);
        }
    }
}

fn past_tuple(tcp: [f64; TCP_FEATURES], size: f64, trans_time: f64) -> [f64; PAST_CHUNK_FEATURES] {
    [tcp[0], tcp[1], tcp[2], tcp[3], tcp[4], size, trans_time]
}
