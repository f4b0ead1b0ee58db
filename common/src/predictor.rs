//! Feed-forward transmission-time classifier and its inference wrapper.
//!
//! The network is `Linear(dim_in, 64) -> ReLU -> Linear(64, 64) -> ReLU ->
//! Linear(64, dim_out)` in double precision. Layer parameters are named after
//! their position in the sequence (`0.weight`, `2.bias`, ...) so the portable
//! artifact maps one-to-one onto a torch `Sequential` state dict.

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{linear, seq, Activation, Module, Sequential, VarBuilder, VarMap};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::artifact;
use crate::config::HIDDEN_SIZE;
use crate::discretizer::{Discretizer, PointEstimate};
use crate::error::{Result, TtpError};
use crate::normalizer::Normalizer;

/// Sequence positions of the three linear layers (ReLUs sit at 1 and 3).
pub const LAYER_PREFIXES: [&str; 3] = ["0", "2", "4"];

fn lock_poisoned() -> candle_core::Error {
    candle_core::Error::Msg("variable map lock poisoned".into())
}

pub struct TtpModel {
    var_map: VarMap,
    network: Sequential,
    dim_in: usize,
    dim_out: usize,
    device: Device,
}

impl TtpModel {
    /// Fresh network with candle's default initialization.
    pub fn new(dim_in: usize, dim_out: usize) -> Result<Self> {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F64, &device);

        let network = seq()
            .add(linear(dim_in, HIDDEN_SIZE, vb.pp(LAYER_PREFIXES[0]))?)
            .add(Activation::Relu)
            .add(linear(HIDDEN_SIZE, HIDDEN_SIZE, vb.pp(LAYER_PREFIXES[1]))?)
            .add(Activation::Relu)
            .add(linear(HIDDEN_SIZE, dim_out, vb.pp(LAYER_PREFIXES[2]))?);

        Ok(Self {
            var_map,
            network,
            dim_in,
            dim_out,
            device,
        })
    }

    /// Fresh network whose parameters depend only on `seed`.
    pub fn seeded(dim_in: usize, dim_out: usize, seed: u64) -> Result<Self> {
        let model = Self::new(dim_in, dim_out)?;
        model.reinitialize(&mut ChaCha8Rng::seed_from_u64(seed))?;
        Ok(model)
    }

    /// Redraw every parameter from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    pub fn reinitialize<R: Rng>(&self, rng: &mut R) -> Result<()> {
        let fan_ins = [self.dim_in, HIDDEN_SIZE, HIDDEN_SIZE];
        for (prefix, fan_in) in LAYER_PREFIXES.iter().zip(fan_ins) {
            let bound = 1.0 / (fan_in as f64).sqrt();
            for suffix in ["weight", "bias"] {
                let name = format!("{}.{}", prefix, suffix);
                let var = self.var(&name)?;
                let values: Vec<f64> = (0..var.elem_count())
                    .map(|_| rng.gen_range(-bound..bound))
                    .collect();
                var.set(&Tensor::from_vec(values, var.dims(), &self.device)?)?;
            }
        }
        Ok(())
    }

    pub fn dim_in(&self) -> usize {
        self.dim_in
    }

    pub fn dim_out(&self) -> usize {
        self.dim_out
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn all_vars(&self) -> Vec<Var> {
        self.var_map.all_vars()
    }

    /// Parameter names in sequence order.
    pub fn parameter_names() -> Vec<String> {
        LAYER_PREFIXES
            .iter()
            .flat_map(|p| [format!("{}.weight", p), format!("{}.bias", p)])
            .collect()
    }

    pub fn var(&self, name: &str) -> Result<Var> {
        let data = self.var_map.data().lock().map_err(|_| lock_poisoned())?;
        data.get(name)
            .cloned()
            .ok_or_else(|| TtpError::Tensor(candle_core::Error::Msg(format!("no parameter {}", name))))
    }

    /// Detached copies of every parameter, keyed by name.
    pub fn parameters(&self) -> Result<Vec<(String, Tensor)>> {
        Self::parameter_names()
            .into_iter()
            .map(|name| {
                let tensor = self.var(&name)?.as_tensor().copy()?;
                Ok((name, tensor))
            })
            .collect()
    }

    /// Raw scores for a `[batch, dim_in]` tensor.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.network.forward(x)?)
    }

    /// Mean categorical cross-entropy against `u32` class ids.
    pub fn loss(&self, x: &Tensor, bins: &Tensor) -> Result<Tensor> {
        let logits = self.forward(x)?;
        Ok(candle_nn::loss::cross_entropy(&logits, bins)?)
    }

    /// Row-major `f64` buffer to a `[rows, dim_in]` tensor.
    pub fn input_tensor(&self, rows: Vec<f64>) -> Result<Tensor> {
        if rows.len() % self.dim_in != 0 {
            return Err(TtpError::Config(format!(
                "input of {} values is not a multiple of {} features",
                rows.len(),
                self.dim_in
            )));
        }
        let n = rows.len() / self.dim_in;
        Ok(Tensor::from_vec(rows, (n, self.dim_in), &self.device)?)
    }
}

/// Number of rows predicted correctly by arg-max.
pub fn count_correct(logits: &Tensor, bins: &Tensor) -> Result<usize> {
    let predicted = logits.argmax(D::Minus1)?;
    let hits = predicted
        .eq(bins)?
        .to_dtype(DType::F64)?
        .sum_all()?
        .to_scalar::<f64>()?;
    Ok(hits as usize)
}

/// A trained model bundled with the statistics needed to feed it raw rows.
pub struct Predictor {
    model: TtpModel,
    normalizer: Normalizer,
    discretizer: Discretizer,
}

impl Predictor {
    pub fn new(model: TtpModel, normalizer: Normalizer, discretizer: Discretizer) -> Result<Self> {
        if normalizer.dim() != model.dim_in() {
            return Err(TtpError::Config(format!(
                "normalizer has {} features but model expects {}",
                normalizer.dim(),
                model.dim_in()
            )));
        }
        if discretizer.num_bins() != model.dim_out() {
            return Err(TtpError::Config(format!(
                "discretizer has {} bins but model outputs {}",
                discretizer.num_bins(),
                model.dim_out()
            )));
        }
        Ok(Self {
            model,
            normalizer,
            discretizer,
        })
    }

    pub fn into_parts(self) -> (TtpModel, Normalizer, Discretizer) {
        (self.model, self.normalizer, self.discretizer)
    }

    pub fn model(&self) -> &TtpModel {
        &self.model
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn discretizer(&self) -> &Discretizer {
        &self.discretizer
    }

    /// Scores for raw (unnormalized) row-major input.
    pub fn logits(&self, raw_rows: &[f64]) -> Result<Tensor> {
        let mut rows = raw_rows.to_vec();
        self.normalizer.apply_in_place(&mut rows);
        let x = self.model.input_tensor(rows)?;
        self.model.forward(&x)
    }

    /// Probability of every bin for one raw feature vector.
    pub fn predict_distribution(&self, raw_x: &[f64]) -> Result<Vec<f64>> {
        if raw_x.len() != self.model.dim_in() {
            return Err(TtpError::Config(format!(
                "feature vector has {} values, expected {}",
                raw_x.len(),
                self.model.dim_in()
            )));
        }
        let logits = self.logits(raw_x)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;
        Ok(probs.squeeze(0)?.to_vec1::<f64>()?)
    }

    pub fn predict_distributions(&self, raw_rows: &[f64]) -> Result<Vec<Vec<f64>>> {
        if raw_rows.is_empty() {
            return Ok(Vec::new());
        }
        let logits = self.logits(raw_rows)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?;
        Ok(probs.to_vec2::<f64>()?)
    }

    /// Point estimate in seconds.
    pub fn predict(&self, raw_x: &[f64], estimate: PointEstimate) -> Result<f64> {
        let distribution = self.predict_distribution(raw_x)?;
        Ok(self.discretizer.decode(&distribution, estimate))
    }
}

/// One predictor per horizon, loaded from a published model directory.
pub struct TtpEnsemble {
    predictors: Vec<Predictor>,
}

impl TtpEnsemble {
    /// Load the portable model and meta of every horizon in `dir`.
    pub fn load<P: AsRef<Path>>(dir: P, horizons: usize, discretizer: Discretizer) -> Result<Self> {
        let dir = dir.as_ref();
        let predictors = (0..horizons)
            .map(|h| artifact::load_portable(dir, h, discretizer))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { predictors })
    }

    pub fn horizons(&self) -> usize {
        self.predictors.len()
    }

    pub fn predictor(&self, horizon: usize) -> Option<&Predictor> {
        self.predictors.get(horizon)
    }

    pub fn predict_distribution(&self, horizon: usize, raw_x: &[f64]) -> Result<Vec<f64>> {
        self.predictors
            .get(horizon)
            .ok_or_else(|| {
                TtpError::Config(format!(
                    "horizon {} out of range ({} loaded)",
                    horizon,
                    self.predictors.len()
                ))
            })?
            .predict_distribution(raw_x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_shape() {
        let model = TtpModel::new(62, 21).unwrap();
        let x = Tensor::zeros((3, 62), DType::F64, model.device()).unwrap();
        let logits = model.forward(&x).unwrap();
        assert_eq!(logits.dims(), &[3, 21]);
    }

    #[test]
    fn test_parameter_names_match_sequential_layout() {
        let model = TtpModel::new(10, 4).unwrap();
        let params = model.parameters().unwrap();
        let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            ["0.weight", "0.bias", "2.weight", "2.bias", "4.weight", "4.bias"]
        );
        assert_eq!(params[0].1.dims(), &[HIDDEN_SIZE, 10]);
        assert_eq!(params[5].1.dims(), &[4]);
    }

    #[test]
    fn test_seeded_init_is_deterministic() {
        let a = TtpModel::seeded(6, 3, 42).unwrap();
        let b = TtpModel::seeded(6, 3, 42).unwrap();
        let c = TtpModel::seeded(6, 3, 43).unwrap();
        let flat = |m: &TtpModel| -> Vec<f64> {
            m.parameters()
                .unwrap()
                .into_iter()
                .flat_map(|(_, t)| t.flatten_all().unwrap().to_vec1::<f64>().unwrap())
                .collect()
        };
        assert_eq!(flat(&a), flat(&b));
        assert_ne!(flat(&a), flat(&c));
        let bound = 1.0 / 6f64.sqrt();
        assert!(a.parameters().unwrap()[0]
            .1
            .flatten_all()
            .unwrap()
            .to_vec1::<f64>()
            .unwrap()
            .iter()
            .all(|w| w.abs() <= bound));
    }

    #[test]
    fn test_distribution_sums_to_one_and_normalizer_untouched() {
        let model = TtpModel::seeded(4, 21, 7).unwrap();
        let mut normalizer = Normalizer::new(4);
        normalizer
            .observe(&[1.0, 2.0, 3.0, 4.0, 2.0, 3.0, 4.0, 5.0])
            .unwrap();
        let before = normalizer.clone();
        let predictor = Predictor::new(model, normalizer, Discretizer::new(0.5, 20)).unwrap();

        let dist = predictor.predict_distribution(&[1.5, 2.5, 3.5, 4.5]).unwrap();
        assert_eq!(dist.len(), 21);
        assert!((dist.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(dist.iter().all(|p| *p >= 0.0));
        assert_eq!(predictor.normalizer(), &before);

        let t = predictor
            .predict(&[1.5, 2.5, 3.5, 4.5], PointEstimate::Expectation)
            .unwrap();
        assert!((0.0..=10.0).contains(&t));
    }

    #[test]
    fn test_wrong_width_rejected() {
        let model = TtpModel::new(4, 21).unwrap();
        let predictor = Predictor::new(model, Normalizer::new(4), Discretizer::new(0.5, 20)).unwrap();
        assert!(matches!(
            predictor.predict_distribution(&[1.0, 2.0]),
            Err(TtpError::Config(_))
        ));
    }

    #[test]
    fn test_count_correct() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0.1f64, 2.0, 0.3], [3.0, 0.0, 0.0]], &device).unwrap();
        let bins = Tensor::new(&[1u32, 2], &device).unwrap();
        assert_eq!(count_correct(&logits, &bins).unwrap(), 1);
    }
}
