//! On-disk model artifacts.
//!
//! Per horizon `h` a model directory holds:
//!
//! - `py-{h}.pt`: safetensors with `net.`-prefixed parameters plus the
//!   normalizer (`obs_size`, `obs_mean`, `obs_std`) and shape metadata
//!   (`dim_in`, `bin_max`, `bin_size`). Used to resume training.
//! - `cpp-{h}.pt`: safetensors with the bare forward parameters only.
//! - `cpp-meta-{h}.json`: `{"obs_size", "obs_mean", "obs_std"}`.
//! - `loss-{h}.json`: per-epoch training (and validation) loss.
//!
//! Intermediate checkpoints carry a `-checkpoint-{epoch}` suffix and live in
//! the `checkpoints/` subdirectory. Every file is written to a temporary file
//! in the target directory and renamed into place.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::discretizer::Discretizer;
use crate::error::{Result, TtpError};
use crate::normalizer::Normalizer;
use crate::predictor::{Predictor, TtpModel};

pub const CHECKPOINT_DIR: &str = "checkpoints";

const NATIVE_PREFIX: &str = "net.";

pub fn native_file(horizon: usize, suffix: &str) -> String {
    format!("py-{}{}.pt", horizon, suffix)
}

pub fn portable_file(horizon: usize, suffix: &str) -> String {
    format!("cpp-{}{}.pt", horizon, suffix)
}

pub fn meta_file(horizon: usize, suffix: &str) -> String {
    format!("cpp-meta-{}{}.json", horizon, suffix)
}

pub fn loss_file(horizon: usize) -> String {
    format!("loss-{}.json", horizon)
}

pub fn checkpoint_suffix(epoch: usize) -> String {
    format!("-checkpoint-{}", epoch)
}

/// Per-epoch losses of one horizon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossCurve {
    pub train: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validate: Vec<f64>,
}

/// Where a save lands: the final artifacts or a numbered checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveKind {
    Final,
    Checkpoint(usize),
}

impl SaveKind {
    fn dir(&self, save_dir: &Path) -> PathBuf {
        match self {
            SaveKind::Final => save_dir.to_path_buf(),
            SaveKind::Checkpoint(_) => save_dir.join(CHECKPOINT_DIR),
        }
    }

    fn suffix(&self) -> String {
        match self {
            SaveKind::Final => String::new(),
            SaveKind::Checkpoint(epoch) => checkpoint_suffix(*epoch),
        }
    }
}

fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = NamedTempFile::new_in(dir).map_err(|e| TtpError::model_io(dir, e))?;
    write(tmp.path())?;
    tmp.persist(path)
        .map_err(|e| TtpError::model_io(path, e.error))?;
    Ok(())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, |tmp| {
        fs::write(tmp, &bytes).map_err(|e| TtpError::model_io(tmp, e))
    })
}

fn write_safetensors_atomic(path: &Path, tensors: &HashMap<String, Tensor>) -> Result<()> {
    write_atomic(path, |tmp| {
        candle_core::safetensors::save(tensors, tmp).map_err(|e| TtpError::model_io(tmp, e))
    })
}

fn read_safetensors(path: &Path) -> Result<HashMap<String, Tensor>> {
    if !path.is_file() {
        return Err(TtpError::model_io(path, "file not found"));
    }
    candle_core::safetensors::load(path, &Device::Cpu).map_err(|e| TtpError::model_io(path, e))
}

fn take<'a>(tensors: &'a HashMap<String, Tensor>, name: &str, path: &Path) -> Result<&'a Tensor> {
    tensors
        .get(name)
        .ok_or_else(|| TtpError::model_io(path, format!("missing tensor {}", name)))
}

fn scalar_i64(tensors: &HashMap<String, Tensor>, name: &str, path: &Path) -> Result<i64> {
    let values = take(tensors, name, path)?
        .to_vec1::<i64>()
        .map_err(|e| TtpError::model_io(path, e))?;
    values
        .first()
        .copied()
        .ok_or_else(|| TtpError::model_io(path, format!("empty tensor {}", name)))
}

/// Copy `{prefix}{name}` tensors into the model, checking every shape.
fn assign_parameters(
    model: &TtpModel,
    tensors: &HashMap<String, Tensor>,
    prefix: &str,
    path: &Path,
) -> Result<()> {
    for name in TtpModel::parameter_names() {
        let tensor = take(tensors, &format!("{}{}", prefix, name), path)?;
        let var = model.var(&name)?;
        if tensor.dims() != var.dims() {
            return Err(TtpError::model_io(
                path,
                format!(
                    "{} has shape {:?}, expected {:?}",
                    name,
                    tensor.dims(),
                    var.dims()
                ),
            ));
        }
        let tensor = tensor
            .to_dtype(candle_core::DType::F64)
            .map_err(|e| TtpError::model_io(path, e))?;
        var.set(&tensor)?;
    }
    Ok(())
}

/// Write the native, portable and meta files for one horizon.
pub fn save_horizon(
    save_dir: &Path,
    horizon: usize,
    kind: SaveKind,
    model: &TtpModel,
    normalizer: &Normalizer,
    discretizer: &Discretizer,
) -> Result<()> {
    let dir = kind.dir(save_dir);
    fs::create_dir_all(&dir).map_err(|e| TtpError::model_io(&dir, e))?;
    let suffix = kind.suffix();

    save_native(
        &dir.join(native_file(horizon, &suffix)),
        model,
        normalizer,
        discretizer,
    )?;
    save_portable(&dir.join(portable_file(horizon, &suffix)), model)?;
    save_meta(&dir.join(meta_file(horizon, &suffix)), normalizer)?;

    debug!("Saved horizon {} models to {}", horizon, dir.display());
    Ok(())
}

pub fn save_native(
    path: &Path,
    model: &TtpModel,
    normalizer: &Normalizer,
    discretizer: &Discretizer,
) -> Result<()> {
    let device = model.device();
    let mut tensors: HashMap<String, Tensor> = model
        .parameters()?
        .into_iter()
        .map(|(name, t)| (format!("{}{}", NATIVE_PREFIX, name), t))
        .collect();

    tensors.insert(
        "obs_size".into(),
        Tensor::new(&[normalizer.size() as i64], device)?,
    );
    tensors.insert("obs_mean".into(), Tensor::new(normalizer.mean(), device)?);
    tensors.insert("obs_std".into(), Tensor::new(normalizer.std(), device)?);
    tensors.insert("dim_in".into(), Tensor::new(&[model.dim_in() as i64], device)?);
    tensors.insert(
        "bin_max".into(),
        Tensor::new(&[discretizer.bin_max() as i64], device)?,
    );
    tensors.insert(
        "bin_size".into(),
        Tensor::new(&[discretizer.bin_size()], device)?,
    );

    write_safetensors_atomic(path, &tensors)
}

/// Read a native artifact back into a trainable predictor.
pub fn load_native(path: &Path) -> Result<Predictor> {
    let tensors = read_safetensors(path)?;

    let dim_in = scalar_i64(&tensors, "dim_in", path)? as usize;
    let bin_max = scalar_i64(&tensors, "bin_max", path)? as usize;
    let bin_size = take(&tensors, "bin_size", path)?
        .to_vec1::<f64>()
        .map_err(|e| TtpError::model_io(path, e))?
        .first()
        .copied()
        .ok_or_else(|| TtpError::model_io(path, "empty tensor bin_size"))?;

    let size = scalar_i64(&tensors, "obs_size", path)?;
    let mean = take(&tensors, "obs_mean", path)?
        .to_vec1::<f64>()
        .map_err(|e| TtpError::model_io(path, e))?;
    let std = take(&tensors, "obs_std", path)?
        .to_vec1::<f64>()
        .map_err(|e| TtpError::model_io(path, e))?;
    let normalizer = Normalizer::from_parts(size.max(0) as u64, mean, std)
        .map_err(|e| TtpError::model_io(path, e))?;

    let model = TtpModel::new(dim_in, bin_max + 1)?;
    assign_parameters(&model, &tensors, NATIVE_PREFIX, path)?;

    Predictor::new(model, normalizer, Discretizer::new(bin_size, bin_max))
        .map_err(|e| TtpError::model_io(path, e))
}

pub fn save_portable(path: &Path, model: &TtpModel) -> Result<()> {
    let tensors: HashMap<String, Tensor> = model.parameters()?.into_iter().collect();
    write_safetensors_atomic(path, &tensors)
}

pub fn save_meta(path: &Path, normalizer: &Normalizer) -> Result<()> {
    write_json_atomic(path, normalizer)
}

pub fn load_meta(path: &Path) -> Result<Normalizer> {
    let bytes = fs::read(path).map_err(|e| TtpError::model_io(path, e))?;
    let normalizer: Normalizer =
        serde_json::from_slice(&bytes).map_err(|e| TtpError::model_io(path, e))?;
    if normalizer.mean().len() != normalizer.std().len() {
        return Err(TtpError::model_io(path, "obs_mean and obs_std differ in length"));
    }
    Ok(normalizer)
}

/// Load the forward-only model and meta of horizon `h` from `dir`.
pub fn load_portable(dir: &Path, horizon: usize, discretizer: Discretizer) -> Result<Predictor> {
    let path = dir.join(portable_file(horizon, ""));
    let tensors = read_safetensors(&path)?;

    let first = take(&tensors, "0.weight", &path)?;
    let last = take(&tensors, "4.weight", &path)?;
    let (dim_in, dim_out) = match (first.dims(), last.dims()) {
        ([_, dim_in], [dim_out, _]) => (*dim_in, *dim_out),
        _ => return Err(TtpError::model_io(&path, "weights are not matrices")),
    };

    let model = TtpModel::new(dim_in, dim_out)?;
    assign_parameters(&model, &tensors, "", &path)?;

    let meta_path = dir.join(meta_file(horizon, ""));
    let normalizer = load_meta(&meta_path)?;
    Predictor::new(model, normalizer, discretizer).map_err(|e| TtpError::model_io(&meta_path, e))
}

pub fn save_loss(save_dir: &Path, horizon: usize, curve: &LossCurve) -> Result<()> {
    fs::create_dir_all(save_dir).map_err(|e| TtpError::model_io(save_dir, e))?;
    write_json_atomic(&save_dir.join(loss_file(horizon)), curve)
}

/// Whether `dir` already holds final model files.
pub fn has_models(dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(false);
    }
    for entry in fs::read_dir(dir).map_err(|e| TtpError::model_io(dir, e))? {
        let entry = entry.map_err(|e| TtpError::model_io(dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if (name.starts_with("py-") || name.starts_with("cpp-"))
            && (name.ends_with(".pt") || name.ends_with(".json"))
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Fail unless every horizon has a native artifact in `dir`.
pub fn require_native(dir: &Path, horizons: usize) -> Result<()> {
    for h in 0..horizons {
        let path = dir.join(native_file(h, ""));
        if !path.is_file() {
            return Err(TtpError::model_io(path, "missing model to resume from"));
        }
    }
    Ok(())
}

/// Every file a complete publication of `horizons` models must contain.
pub fn published_files(horizons: usize) -> Vec<String> {
    (0..horizons)
        .flat_map(|h| [native_file(h, ""), portable_file(h, ""), meta_file(h, "")])
        .collect()
}
