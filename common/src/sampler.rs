//! Time-discounted replay of past days for continual learning.
//!
//! Day `d` (0 = the most recent full day) may contribute at most
//! `floor(γ^d / Σγ^i · max_rows)` rows per horizon, drawn uniformly without
//! replacement. Older days are down-weighted rather than dropped.

use chrono::{DateTime, Duration, Utc};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::assembler::ChunkAssembler;
use crate::config::ModelConfig;
use crate::error::Result;
use crate::features::{FeatureBuilder, HorizonDataset};
use crate::telemetry::{TelemetrySource, TimeWindow};

#[derive(Debug, Clone)]
pub struct ReplaySampler {
    max_rows: usize,
    discount: f64,
    max_days: usize,
    seed: Option<u64>,
}

impl ReplaySampler {
    pub fn new(max_rows: usize, discount: f64, max_days: usize, seed: Option<u64>) -> Self {
        Self {
            max_rows,
            discount,
            max_days,
            seed,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(
            config.cl_max_data_size,
            config.cl_discount,
            config.cl_max_days,
            config.seed,
        )
    }

    pub fn max_days(&self) -> usize {
        self.max_days
    }

    /// Per-day row caps, newest day first.
    pub fn day_caps(&self) -> Vec<usize> {
        let weights: Vec<f64> = (0..self.max_days)
            .map(|d| self.discount.powi(d as i32))
            .collect();
        let total: f64 = weights.iter().sum();
        weights
            .iter()
            .map(|w| (w / total * self.max_rows as f64).floor() as usize)
            .collect()
    }

    /// Window of day `d` counting back from `end`: `[end - (d+1) days, end - d days)`.
    pub fn day_window(end: DateTime<Utc>, day: usize) -> Result<TimeWindow> {
        let day = day as i64;
        TimeWindow::new(end - Duration::days(day + 1), end - Duration::days(day))
    }

    /// Draw one day's contribution into `out`, at most `cap` rows per horizon.
    pub fn draw_day(&self, day: usize, cap: usize, day_sets: &[HorizonDataset], out: &mut [HorizonDataset]) {
        let mut rng = match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed.wrapping_add(day as u64)),
            None => ChaCha8Rng::from_entropy(),
        };

        for (h, (available, acc)) in day_sets.iter().zip(out.iter_mut()).enumerate() {
            let take = cap.min(available.len());
            for i in index::sample(&mut rng, available.len(), take).into_iter() {
                acc.push_from(available, i);
            }
            info!(
                "[horizon {}] Sampled {} vs required {} in day -{}",
                h,
                take,
                cap,
                day + 1
            );
        }
    }

    /// Build the replay training sets from the days ending at `end`.
    pub fn sample<S>(
        &self,
        source: &S,
        assembler: &ChunkAssembler,
        builder: &FeatureBuilder,
        end: DateTime<Utc>,
    ) -> Result<Vec<HorizonDataset>>
    where
        S: TelemetrySource + ?Sized,
    {
        let mut out = builder.empty_datasets();
        for (day, cap) in self.day_caps().into_iter().enumerate() {
            let window = Self::day_window(end, day)?;
            let assembly = assembler.assemble(source, &window)?;
            let day_sets = builder.build(&assembly.sessions)?;
            self.draw_day(day, cap, &day_sets, &mut out);
        }
        for dataset in out.iter_mut() {
            dataset.truncate(self.max_rows);
        }
        Ok(out)
    }
}
