//! Trained checkpoint: a JSON manifest naming the two exported networks.
//!
//! ```json
//! {
//!   "state_dictFC": "flow_comp.onnx",
//!   "state_dictAT": "arb_time_flow_interp.onnx",
//!   "epoch": 199,
//!   "valPSNR": [29.4]
//! }
//! ```
//!
//! Model paths are relative to the manifest. `checkpoint` may also point at a
//! directory holding `checkpoint.json`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::backend::{model_hash, resolve_trt_cache_dir, trt_cache_key, Device};
use crate::flow::{FlowEstimator, FLOW_CONTRACT};
use crate::interpolator::{ArbitraryTimeInterpolator, REFINE_CONTRACT};
use crate::model::{ChannelContract, OrtModel};
use crate::types::Dimensions;

pub const MANIFEST_FILE: &str = "checkpoint.json";
pub const FLOW_KEY: &str = "state_dictFC";
pub const INTERP_KEY: &str = "state_dictAT";

#[derive(Debug, Clone, Deserialize)]
struct RawManifest {
    #[serde(rename = "state_dictFC")]
    flow: Option<String>,
    #[serde(rename = "state_dictAT")]
    interp: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    epoch: Option<u64>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default, rename = "valPSNR")]
    val_psnr: Option<serde_json::Value>,
}

/// Training metadata carried along with the weights; informational only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointInfo {
    pub detail: Option<String>,
    pub epoch: Option<u64>,
    pub timestamp: Option<String>,
    pub best_val_psnr: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub manifest_path: PathBuf,
    pub flow_model: PathBuf,
    pub interp_model: PathBuf,
    pub info: CheckpointInfo,
}

impl Checkpoint {
    /// Parse the manifest and resolve both model paths. Fails before any
    /// model is touched if either named parameter set is absent.
    pub fn open(path: &Path) -> Result<Self> {
        let manifest_path = if path.is_dir() {
            path.join(MANIFEST_FILE)
        } else {
            path.to_path_buf()
        };

        let text = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("failed to read checkpoint {}", manifest_path.display()))?;
        let raw: RawManifest = serde_json::from_str(&text)
            .with_context(|| format!("invalid checkpoint manifest {}", manifest_path.display()))?;

        let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        let flow_model = required_model(base, raw.flow.as_deref(), FLOW_KEY, &manifest_path)?;
        let interp_model =
            required_model(base, raw.interp.as_deref(), INTERP_KEY, &manifest_path)?;

        let best_val_psnr = raw.val_psnr.as_ref().and_then(best_psnr);
        Ok(Self {
            manifest_path,
            flow_model,
            interp_model,
            info: CheckpointInfo {
                detail: raw.detail,
                epoch: raw.epoch,
                timestamp: raw.timestamp,
                best_val_psnr,
            },
        })
    }

    /// Build both inference sessions for `working` resolution on `device`.
    pub fn load_models(
        &self,
        device: Device,
        trt_cache_base: &Path,
        working: Dimensions,
    ) -> Result<(FlowEstimator, ArbitraryTimeInterpolator)> {
        info!(
            checkpoint = %self.manifest_path.display(),
            epoch = ?self.info.epoch,
            val_psnr = ?self.info.best_val_psnr,
            device = %device,
            "Loading checkpoint"
        );

        let flow = load_one(
            "flow estimator",
            &self.flow_model,
            device,
            trt_cache_base,
            working,
            FLOW_CONTRACT,
        )?;
        let interp = load_one(
            "arbitrary-time interpolator",
            &self.interp_model,
            device,
            trt_cache_base,
            working,
            REFINE_CONTRACT,
        )?;

        Ok((
            FlowEstimator::new(Box::new(flow)),
            ArbitraryTimeInterpolator::new(Box::new(interp)),
        ))
    }
}

fn required_model(
    base: &Path,
    value: Option<&str>,
    key: &str,
    manifest: &Path,
) -> Result<PathBuf> {
    match value {
        Some(rel) if !rel.trim().is_empty() => Ok(base.join(rel)),
        _ => bail!(
            "checkpoint {} is missing required parameter set \"{key}\"",
            manifest.display()
        ),
    }
}

/// `valPSNR` is a scalar or the per-epoch history; report the best value.
fn best_psnr(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(serde_json::Value::as_f64)
            .reduce(f64::max),
        _ => None,
    }
}

fn load_one(
    label: &str,
    model_path: &Path,
    device: Device,
    trt_cache_base: &Path,
    working: Dimensions,
    contract: ChannelContract,
) -> Result<OrtModel> {
    if !model_path.is_file() {
        bail!("{label} model not found: {}", model_path.display());
    }
    let trt_cache_dir = if device == Device::Tensorrt {
        let hash = model_hash(model_path)?;
        let key = trt_cache_key(&hash, working.height, working.width);
        Some(resolve_trt_cache_dir(trt_cache_base, Some(&key)))
    } else {
        None
    };
    OrtModel::load(label, model_path, device, trt_cache_dir.as_deref(), contract)
}
