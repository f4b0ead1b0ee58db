//! Transmission time <-> class id.
//!
//! Bin 0 is half width: `[0, 0.5·B)`. Bin `k > 0` covers
//! `[(k - 0.5)·B, (k + 0.5)·B)`; the last bin also absorbs everything above.

use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;

/// How a probability distribution over bins is reduced to seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointEstimate {
    /// Center of the most likely bin.
    Argmax,
    /// Interpolated 0.5-quantile (minimizes L1 error).
    Median,
    /// Probability-weighted bin centers (minimizes L2 error).
    Expectation,
}

impl PointEstimate {
    pub const ALL: [PointEstimate; 3] = [
        PointEstimate::Argmax,
        PointEstimate::Median,
        PointEstimate::Expectation,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Discretizer {
    bin_size: f64,
    bin_max: usize,
}

impl Discretizer {
    pub fn new(bin_size: f64, bin_max: usize) -> Self {
        Self { bin_size, bin_max }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.bin_size, config.bin_max)
    }

    pub fn bin_size(&self) -> f64 {
        self.bin_size
    }

    pub fn bin_max(&self) -> usize {
        self.bin_max
    }

    pub fn num_bins(&self) -> usize {
        self.bin_max + 1
    }

    pub fn bin(&self, t: f64) -> usize {
        let k = ((t + 0.5 * self.bin_size) / self.bin_size).floor();
        if k.is_nan() || k <= 0.0 {
            0
        } else {
            (k as usize).min(self.bin_max)
        }
    }

    pub fn bins(&self, times: &[f64]) -> Vec<u32> {
        times.iter().map(|&t| self.bin(t) as u32).collect()
    }

    /// Representative time of a bin.
    pub fn center(&self, k: usize) -> f64 {
        if k == 0 {
            0.25 * self.bin_size
        } else {
            k as f64 * self.bin_size
        }
    }

    pub fn decode(&self, distribution: &[f64], estimate: PointEstimate) -> f64 {
        match estimate {
            PointEstimate::Argmax => self.decode_argmax(distribution),
            PointEstimate::Median => self.decode_median(distribution),
            PointEstimate::Expectation => self.decode_expectation(distribution),
        }
    }

    pub fn decode_argmax(&self, distribution: &[f64]) -> f64 {
        let best = distribution
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (k, &p)| {
                if p > best.1 {
                    (k, p)
                } else {
                    best
                }
            })
            .0;
        self.center(best)
    }

    pub fn decode_median(&self, distribution: &[f64]) -> f64 {
        let Some(last) = distribution.len().checked_sub(1) else {
            return 0.0;
        };

        let mut cumulative = 0.0;
        let mut k = last;
        for (i, &p) in distribution.iter().enumerate() {
            cumulative += p;
            if cumulative > 0.5 {
                k = i;
                break;
            }
        }

        let p = distribution[k];
        if p <= 0.0 {
            return self.center(k);
        }

        if k == 0 {
            // bin 0 spans half a bin starting at 0
            0.5 * self.bin_size * 0.5 / p
        } else {
            let below = cumulative - p;
            (k as f64 - 0.5 + (0.5 - below) / p) * self.bin_size
        }
    }

    pub fn decode_expectation(&self, distribution: &[f64]) -> f64 {
        distribution
            .iter()
            .enumerate()
            .map(|(k, &p)| p * self.center(k))
            .sum()
    }
}
