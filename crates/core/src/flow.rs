//! Bidirectional optical flow between the two frames of a pair.

use anyhow::{ensure, Result};
use ndarray::Array4;
use tracing::debug;

use crate::model::{ChannelContract, InferenceModel};
use crate::tensor::{concat_channels, take_channels};

/// I0 and I1 stacked: 3 + 3 channels in, forward + backward flow out.
pub const FLOW_CONTRACT: ChannelContract = ChannelContract::new(6, 4);

/// Forward (frame0→frame1) and backward (frame1→frame0) motion fields, `[1,2,H,W]` each.
#[derive(Debug, Clone, PartialEq)]
pub struct BidirectionalFlow {
    pub forward: Array4<f32>,
    pub backward: Array4<f32>,
}

pub struct FlowEstimator {
    model: Box<dyn InferenceModel>,
}

impl FlowEstimator {
    pub fn new(model: Box<dyn InferenceModel>) -> Self {
        Self { model }
    }

    /// Run the flow network once for the pair `(i0, i1)`.
    pub fn estimate(&mut self, i0: &Array4<f32>, i1: &Array4<f32>) -> Result<BidirectionalFlow> {
        ensure!(
            i0.shape() == i1.shape(),
            "frame pair shape mismatch: {:?} vs {:?}",
            i0.shape(),
            i1.shape()
        );

        let input = concat_channels(&[i0.view(), i1.view()])?;
        FLOW_CONTRACT.check_input(self.model.label(), &input)?;

        let output = self.model.infer(&input)?;
        FLOW_CONTRACT.check_output(self.model.label(), &output)?;
        ensure!(
            output.shape()[2..] == i0.shape()[2..],
            "flow output {:?} does not match input spatial size {:?}",
            output.shape(),
            i0.shape()
        );

        let flow = BidirectionalFlow {
            forward: take_channels(&output, 0..2)?,
            backward: take_channels(&output, 2..4)?,
        };

        debug!(
            forward_mean_abs = mean_abs(&flow.forward),
            backward_mean_abs = mean_abs(&flow.backward),
            "Flow computed"
        );

        Ok(flow)
    }
}

fn mean_abs(arr: &Array4<f32>) -> f32 {
    if arr.is_empty() {
        return 0.0;
    }
    arr.iter().map(|v| v.abs()).sum::<f32>() / arr.len() as f32
}
