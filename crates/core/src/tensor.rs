//! Conversions between packed RGB frames and `[1, C, H, W]` model tensors.

use anyhow::{bail, ensure, Context, Result};
use ndarray::{concatenate, s, Array4, ArrayView4, Axis};

use crate::types::Dimensions;

/// Per-channel mean the networks were trained with (std is 1 for every channel).
pub const CHANNEL_MEAN: [f32; 3] = [0.429, 0.431, 0.397];

/// Mean subtraction applied after scaling samples to [0,1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
}

impl Normalization {
    pub fn identity() -> Self {
        Self { mean: [0.0; 3] }
    }

    pub fn channel_mean() -> Self {
        Self { mean: CHANNEL_MEAN }
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Self::channel_mean()
    }
}

/// Scatter packed RGB24 into a normalized `[1,3,H,W]` tensor.
pub fn rgb_to_nchw(data: &[u8], dims: Dimensions, norm: &Normalization) -> Result<Array4<f32>> {
    let h = dims.height as usize;
    let w = dims.width as usize;
    let expected = h * w * 3;
    if data.len() != expected {
        bail!(
            "Data length mismatch: expected {} ({}x{}x3), got {}",
            expected,
            h,
            w,
            data.len()
        );
    }

    let hw = h * w;
    let mut nchw = Array4::<f32>::zeros((1, 3, h, w));
    let planes = nchw
        .as_slice_mut()
        .context("freshly allocated tensor must be contiguous")?;

    for (i, px) in data.chunks_exact(3).enumerate() {
        planes[i] = px[0] as f32 / 255.0 - norm.mean[0];
        planes[hw + i] = px[1] as f32 / 255.0 - norm.mean[1];
        planes[2 * hw + i] = px[2] as f32 / 255.0 - norm.mean[2];
    }

    Ok(nchw)
}

/// Undo [`rgb_to_nchw`]: add the mean back, clamp and gather planes into RGB24.
pub fn nchw_to_rgb(arr: &Array4<f32>, norm: &Normalization) -> Result<Vec<u8>> {
    let shape = arr.shape();
    ensure!(
        shape[0] == 1 && shape[1] == 3,
        "expected a [1,3,H,W] tensor, got {:?}",
        shape
    );
    let hw = shape[2] * shape[3];
    let contiguous = arr.as_standard_layout();
    let planes = contiguous
        .as_slice()
        .context("standard layout must be contiguous")?;

    let (r_plane, rest) = planes.split_at(hw);
    let (g_plane, b_plane) = rest.split_at(hw);

    let mut rgb = vec![0u8; hw * 3];
    for (i, dst) in rgb.chunks_exact_mut(3).enumerate() {
        dst[0] = quantize(r_plane[i] + norm.mean[0]);
        dst[1] = quantize(g_plane[i] + norm.mean[1]);
        dst[2] = quantize(b_plane[i] + norm.mean[2]);
    }
    Ok(rgb)
}

fn quantize(v: f32) -> u8 {
    (v * 255.0 + 0.5).clamp(0.0, 255.0) as u8
}

/// Concatenate `[1,Ci,H,W]` tensors along the channel axis.
pub fn concat_channels(parts: &[ArrayView4<'_, f32>]) -> Result<Array4<f32>> {
    concatenate(Axis(1), parts).context("tensors must share batch and spatial dimensions")
}

/// Owned copy of channels `range` of a `[1,C,H,W]` tensor.
pub fn take_channels(arr: &Array4<f32>, range: std::ops::Range<usize>) -> Result<Array4<f32>> {
    let channels = arr.shape()[1];
    ensure!(
        range.end <= channels,
        "channel range {:?} out of bounds for {channels}-channel tensor",
        range
    );
    Ok(arr.slice(s![.., range, .., ..]).to_owned())
}
