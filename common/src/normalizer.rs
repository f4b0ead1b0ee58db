//! Running per-feature mean/std carried with every model.
//!
//! `observe` merges a batch into the population statistics with the
//! sum-of-squares form, so observing `S1` then `S2` matches observing
//! `S1 ∪ S2` at once. Statistics are only updated while training.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TtpError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    #[serde(rename = "obs_size")]
    size: u64,
    #[serde(rename = "obs_mean")]
    mean: Vec<f64>,
    #[serde(rename = "obs_std")]
    std: Vec<f64>,
}

impl Normalizer {
    /// Empty statistics for `dim` features.
    pub fn new(dim: usize) -> Self {
        Self {
            size: 0,
            mean: vec![0.0; dim],
            std: vec![0.0; dim],
        }
    }

    pub fn from_parts(size: u64, mean: Vec<f64>, std: Vec<f64>) -> Result<Self> {
        if mean.len() != std.len() {
            return Err(TtpError::Config(format!(
                "normalizer mean has {} entries but std has {}",
                mean.len(),
                std.len()
            )));
        }
        Ok(Self { size, mean, std })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn std(&self) -> &[f64] {
        &self.std
    }

    pub fn is_fitted(&self) -> bool {
        self.size > 0
    }

    /// Merge a row-major batch of `rows.len() / dim` samples.
    pub fn observe(&mut self, rows: &[f64]) -> Result<()> {
        let dim = self.dim();
        if dim == 0 || rows.len() % dim != 0 {
            return Err(TtpError::Config(format!(
                "batch of {} values is not a multiple of {} features",
                rows.len(),
                dim
            )));
        }
        let n = (rows.len() / dim) as u64;
        if n == 0 {
            return Ok(());
        }

        let mut sum = vec![0.0; dim];
        let mut sum_sq = vec![0.0; dim];
        for row in rows.chunks_exact(dim) {
            for (j, &x) in row.iter().enumerate() {
                sum[j] += x;
                sum_sq[j] += x * x;
            }
        }

        let old_n = self.size as f64;
        let new_n = (self.size + n) as f64;
        for j in 0..dim {
            let old_sum_sq = old_n * (self.std[j] * self.std[j] + self.mean[j] * self.mean[j]);
            let mean = (old_n * self.mean[j] + sum[j]) / new_n;
            let mean_sq = (old_sum_sq + sum_sq[j]) / new_n;
            self.mean[j] = mean;
            // cancellation can push the variance a hair below zero
            self.std[j] = (mean_sq - mean * mean).max(0.0).sqrt();
        }
        self.size += n;
        Ok(())
    }

    /// `(x - mean) / std`, or `x - mean` where `std == 0`.
    pub fn apply(&self, x: &[f64]) -> Vec<f64> {
        let mut out = x.to_vec();
        self.apply_in_place(&mut out);
        out
    }

    /// Normalize a row-major buffer of any number of rows.
    pub fn apply_in_place(&self, rows: &mut [f64]) {
        let dim = self.dim();
        if dim == 0 {
            return;
        }
        for row in rows.chunks_exact_mut(dim) {
            for (j, x) in row.iter_mut().enumerate() {
                *x -= self.mean[j];
                if self.std[j] != 0.0 {
                    *x /= self.std[j];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-9, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_sequential_merge_matches_known_values() {
        let mut norm = Normalizer::new(2);
        norm.observe(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        norm.observe(&[5.0, 6.0]).unwrap();

        assert_eq!(norm.size(), 3);
        assert_close(norm.mean(), &[3.0, 4.0]);
        let var: Vec<f64> = norm.std().iter().map(|s| s * s).collect();
        assert_close(&var, &[8.0 / 3.0, 8.0 / 3.0]);
    }

    #[test]
    fn test_merge_matches_single_pass_for_any_split() {
        let data: Vec<f64> = (0..40).map(|i| ((i * 37) % 11) as f64 * 0.7 - 2.0).collect();
        let mut whole = Normalizer::new(4);
        whole.observe(&data).unwrap();

        for split in [4, 12, 20, 36] {
            let mut parts = Normalizer::new(4);
            parts.observe(&data[..split]).unwrap();
            parts.observe(&data[split..]).unwrap();
            assert_eq!(parts.size(), whole.size());
            assert_close(parts.mean(), whole.mean());
            assert_close(parts.std(), whole.std());
        }
    }

    #[test]
    fn test_apply_with_zero_std_only_centers() {
        let mut norm = Normalizer::new(2);
        norm.observe(&[1.0, 5.0, 3.0, 5.0]).unwrap();
        assert_eq!(norm.std()[1], 0.0);

        let out = norm.apply(&[4.0, 7.0]);
        assert_close(&out, &[2.0, 2.0]);
    }

    #[test]
    fn test_apply_is_pure() {
        let mut norm = Normalizer::new(1);
        norm.observe(&[2.0, 4.0, 6.0]).unwrap();
        let before = norm.clone();
        let a = norm.apply(&[5.0]);
        let b = norm.apply(&[5.0]);
        assert_eq!(a, b);
        assert_eq!(norm, before);
    }

    #[test]
    fn test_rejects_ragged_batch() {
        let mut norm = Normalizer::new(3);
        assert!(norm.observe(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_json_field_names() {
        let norm = Normalizer::from_parts(2, vec![1.0], vec![0.5]).unwrap();
        let json = serde_json::to_value(&norm).unwrap();
        assert_eq!(json["obs_size"], 2);
        assert_eq!(json["obs_mean"][0], 1.0);
        assert_eq!(json["obs_std"][0], 0.5);
    }
}
