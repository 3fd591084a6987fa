//! Arbitrary-time flow refinement and visibility estimation.

use anyhow::{ensure, Result};
use ndarray::Array4;
use tracing::debug;

use crate::model::{ChannelContract, InferenceModel};
use crate::tensor::{concat_channels, take_channels};

/// 3+3 frames, 2+2 flows, 2+2 time-scaled flows, 3+3 coarse warps → 2+2 flow deltas + 1 logit.
pub const REFINE_CONTRACT: ChannelContract = ChannelContract::new(20, 5);

/// Everything the refinement network sees for one time step.
pub struct RefineInputs<'a> {
    pub i0: &'a Array4<f32>,
    pub i1: &'a Array4<f32>,
    pub f01: &'a Array4<f32>,
    pub f10: &'a Array4<f32>,
    pub ft0: &'a Array4<f32>,
    pub ft1: &'a Array4<f32>,
    pub warped0: &'a Array4<f32>,
    pub warped1: &'a Array4<f32>,
}

/// Network output, split: corrections to `F_t0`/`F_t1` and the raw visibility logit.
#[derive(Debug, Clone, PartialEq)]
pub struct Refinement {
    pub delta_t0: Array4<f32>,
    pub delta_t1: Array4<f32>,
    pub visibility_logit: Array4<f32>,
}

impl Refinement {
    /// `V_t0 = sigmoid(logit)`, in (0, 1).
    pub fn visibility_t0(&self) -> Array4<f32> {
        self.visibility_logit.mapv(sigmoid)
    }
}

/// Complement of a visibility map: `V_t1 = 1 - V_t0`.
pub fn complement(visibility: &Array4<f32>) -> Array4<f32> {
    visibility.mapv(|v| 1.0 - v)
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub struct ArbitraryTimeInterpolator {
    model: Box<dyn InferenceModel>,
}

impl ArbitraryTimeInterpolator {
    pub fn new(model: Box<dyn InferenceModel>) -> Self {
        Self { model }
    }

    pub fn refine(&mut self, inputs: &RefineInputs<'_>) -> Result<Refinement> {
        // Channel order is fixed by how the network was trained.
        let stacked = concat_channels(&[
            inputs.i0.view(),
            inputs.i1.view(),
            inputs.f01.view(),
            inputs.f10.view(),
            inputs.ft1.view(),
            inputs.ft0.view(),
            inputs.warped1.view(),
            inputs.warped0.view(),
        ])?;
        REFINE_CONTRACT.check_input(self.model.label(), &stacked)?;

        let output = self.model.infer(&stacked)?;
        drop(stacked);
        REFINE_CONTRACT.check_output(self.model.label(), &output)?;
        ensure!(
            output.shape()[2..] == inputs.i0.shape()[2..],
            "refinement output {:?} does not match input spatial size {:?}",
            output.shape(),
            inputs.i0.shape()
        );

        let refinement = Refinement {
            delta_t0: take_channels(&output, 0..2)?,
            delta_t1: take_channels(&output, 2..4)?,
            visibility_logit: take_channels(&output, 4..5)?,
        };

        debug!(
            logit_min = refinement
                .visibility_logit
                .iter()
                .cloned()
                .fold(f32::INFINITY, f32::min),
            logit_max = refinement
                .visibility_logit
                .iter()
                .cloned()
                .fold(f32::NEG_INFINITY, f32::max),
            "Flow refined"
        );

        Ok(refinement)
    }
}
