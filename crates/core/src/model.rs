//! The single seam between pipeline logic and the numerical backend.
//!
//! Both learned networks (flow estimation and arbitrary-time refinement) are
//! consumed only through [`InferenceModel::infer`]: one `[1, C, H, W]` tensor
//! in, one tensor out. [`OrtModel`] runs an exported ONNX graph; closures
//! implement the trait too, which keeps the pipeline testable on CPU without
//! model files.

use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use half::f16;
use ndarray::{Array4, Ix4};
use ort::{
    session::Session,
    tensor::TensorElementType,
    value::{Tensor, TensorRef, ValueType},
};
use tracing::debug;

use crate::backend::{build_session, Device, SessionConfig};

/// A frozen network exposed as a pure tensor-to-tensor function.
pub trait InferenceModel {
    fn label(&self) -> &str {
        "model"
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;
}

impl<F> InferenceModel for F
where
    F: FnMut(&Array4<f32>) -> Result<Array4<f32>>,
{
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        self(input)
    }
}

/// Expected channel counts of a network's input and output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelContract {
    pub input_channels: usize,
    pub output_channels: usize,
}

impl ChannelContract {
    pub const fn new(input_channels: usize, output_channels: usize) -> Self {
        Self {
            input_channels,
            output_channels,
        }
    }

    /// Check a declared channel dimension; dynamic (`-1`) or absent dims pass.
    pub fn check_declared(&self, label: &str, input: Option<i64>, output: Option<i64>) -> Result<()> {
        if let Some(c) = input.filter(|c| *c > 0) {
            ensure!(
                c as usize == self.input_channels,
                "{label}: model declares {c} input channels, expected {}",
                self.input_channels
            );
        }
        if let Some(c) = output.filter(|c| *c > 0) {
            ensure!(
                c as usize == self.output_channels,
                "{label}: model declares {c} output channels, expected {}",
                self.output_channels
            );
        }
        Ok(())
    }

    pub fn check_input(&self, label: &str, input: &Array4<f32>) -> Result<()> {
        let channels = input.shape()[1];
        ensure!(
            channels == self.input_channels,
            "{label}: got {channels}-channel input, expected {}",
            self.input_channels
        );
        Ok(())
    }

    pub fn check_output(&self, label: &str, output: &Array4<f32>) -> Result<()> {
        let channels = output.shape()[1];
        ensure!(
            channels == self.output_channels,
            "{label}: model produced {channels} channels, expected {}",
            self.output_channels
        );
        Ok(())
    }
}

/// ONNX Runtime–backed [`InferenceModel`].
pub struct OrtModel {
    label: String,
    session: Session,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

impl OrtModel {
    /// Load `model_path` on `device` and verify it against `contract`.
    pub fn load(
        label: &str,
        model_path: &Path,
        device: Device,
        trt_cache_dir: Option<&Path>,
        contract: ChannelContract,
    ) -> Result<Self> {
        debug!(
            model = %model_path.display(),
            label,
            device = %device,
            "Loading ONNX model"
        );

        let config = SessionConfig {
            model_path,
            device,
            trt_cache_dir,
        };
        let session = build_session(&config)?;

        let Some(input) = session.inputs().first() else {
            bail!("{label}: model has no inputs");
        };
        let Some(output) = session.outputs().first() else {
            bail!("{label}: model has no outputs");
        };

        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let (is_fp16, declared_in) = tensor_signature(input.dtype());
        let (_, declared_out) = tensor_signature(output.dtype());

        contract
            .check_declared(label, declared_in, declared_out)
            .with_context(|| format!("incompatible model file: {}", model_path.display()))?;

        debug!(
            label,
            %input_name,
            %output_name,
            is_fp16,
            "Detected model IO"
        );

        Ok(Self {
            label: label.to_string(),
            session,
            input_name,
            output_name,
            is_fp16,
        })
    }
}

fn tensor_signature(value_type: &ValueType) -> (bool, Option<i64>) {
    match value_type {
        ValueType::Tensor { ty, shape, .. } => (
            *ty == TensorElementType::Float16,
            shape.get(1).copied(),
        ),
        _ => (false, None),
    }
}

impl InferenceModel for OrtModel {
    fn label(&self) -> &str {
        &self.label
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let t_run = std::time::Instant::now();
        let output = if self.is_fp16 {
            let half_input = input.mapv(f16::from_f32);
            let tensor = Tensor::from_array(half_input)?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => &tensor])
                .with_context(|| format!("{}: inference failed", self.label))?;
            let view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
            view.mapv(f16::to_f32)
        } else {
            let tensor = TensorRef::from_array_view(input.view())?;
            let outputs = self
                .session
                .run(ort::inputs![self.input_name.as_str() => tensor])
                .with_context(|| format!("{}: inference failed", self.label))?;
            let view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
            view.to_owned()
        };

        debug!(
            label = %self.label,
            session_run_ms = format!("{:.1}", t_run.elapsed().as_secs_f64() * 1000.0),
            "ONNX inference"
        );

        output
            .into_dimensionality::<Ix4>()
            .with_context(|| format!("{}: expected a 4-D output tensor", self.label))
    }
}
