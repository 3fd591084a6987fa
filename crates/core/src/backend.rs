//! Compute device selection and `ort::Session` construction.
//!
//! The device is always passed in explicitly; nothing here consults global
//! state to decide where inference runs.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::tensor::Normalization;

/// Where the learned models execute.
///
/// `Tensorrt` falls back to CUDA EP when the TensorRT runtime is missing;
/// `Cuda` falls back to CPU inside ORT when no GPU is usable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    #[default]
    Cuda,
    Tensorrt,
}

impl Device {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }

    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Self::Cpu)
    }

    /// Mean subtraction is skipped on CPU unless explicitly requested; the
    /// exported networks are known to produce color casts there otherwise.
    pub fn normalization(&self, normalize_on_cpu: bool) -> Normalization {
        if self.is_accelerator() || normalize_on_cpu {
            Normalization::channel_mean()
        } else {
            Normalization::identity()
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub device: Device,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Build an `ort::Session` for `config.model_path` on `config.device`.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let model_path = config.model_path;
    let started = Instant::now();

    let session = match config.device {
        Device::Cpu => {
            debug!(device = "cpu", model = %model_path.display(), "Building CPU session");
            builder.commit_from_file(model_path)
        }
        Device::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available — inference will fall back to CPU");
            }
            debug!(device = "cuda", model = %model_path.display(), "Building session with CUDA EP");
            builder
                .with_execution_providers([cuda.build()])?
                .commit_from_file(model_path)
        }
        Device::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }
            let cache_path = cache_dir.to_string_lossy().to_string();
            info!(
                cache_dir = %cache_dir.display(),
                model = %model_path.display(),
                "Initializing TensorRT session (first run may take several minutes)"
            );
            builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(model_path)
        }
    }
    .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?;

    info!(
        device = %config.device,
        model = %model_path.display(),
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Inference session ready"
    );

    Ok(session)
}

/// Hex SHA-256 of a model file, used to key TensorRT engine caches.
pub fn model_hash(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open model: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed to read model: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Format: `{model_hash[..16]}_{input_h}x{input_w}`
pub fn trt_cache_key(model_hash: &str, input_h: u32, input_w: u32) -> String {
    let short = &model_hash[..model_hash.len().min(16)];
    format!("{short}_{input_h}x{input_w}")
}

pub fn resolve_trt_cache_dir(base_dir: &Path, cache_key: Option<&str>) -> PathBuf {
    match cache_key {
        Some(key) => base_dir.join(key),
        None => base_dir.to_path_buf(),
    }
}
