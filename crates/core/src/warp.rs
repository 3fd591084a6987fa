//! Backward warping: resample a frame along a dense motion field.
//!
//! For every output pixel `(x, y)` the source is sampled at
//! `(x + u(x, y), y + v(x, y))` where `u`/`v` are flow channels 0/1.
//! Sampling is bilinear; taps that fall outside the source contribute zero.

use anyhow::{ensure, Result};
use ndarray::Array4;

use crate::types::Dimensions;

/// Stateless backward-warp operator bound to one working resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackWarp {
    dims: Dimensions,
}

impl BackWarp {
    pub fn new(dims: Dimensions) -> Self {
        Self { dims }
    }

    /// Warp `img` (`[1,C,H,W]`) with `flow` (`[1,2,H,W]`).
    pub fn warp(&self, img: &Array4<f32>, flow: &Array4<f32>) -> Result<Array4<f32>> {
        let h = self.dims.height as usize;
        let w = self.dims.width as usize;
        let img_shape = img.shape();
        let flow_shape = flow.shape();

        ensure!(
            img_shape[0] == 1 && img_shape[2] == h && img_shape[3] == w,
            "warp input {:?} does not match working resolution {}",
            img_shape,
            self.dims
        );
        ensure!(
            flow_shape == [1, 2, h, w],
            "flow field {:?} must be [1, 2, {h}, {w}]",
            flow_shape
        );

        let channels = img_shape[1];
        let mut out = Array4::<f32>::zeros((1, channels, h, w));

        for y in 0..h {
            for x in 0..w {
                let (Some(sx), Some(sy)) = (
                    source_coord(x, flow[[0, 0, y, x]], w),
                    source_coord(y, flow[[0, 1, y, x]], h),
                ) else {
                    continue;
                };

                let x0f = sx.floor();
                let y0f = sy.floor();
                let fx = sx - x0f;
                let fy = sy - y0f;
                let x0 = x0f as i64;
                let y0 = y0f as i64;

                let taps = [
                    (x0, y0, (1.0 - fx) * (1.0 - fy)),
                    (x0 + 1, y0, fx * (1.0 - fy)),
                    (x0, y0 + 1, (1.0 - fx) * fy),
                    (x0 + 1, y0 + 1, fx * fy),
                ];

                for c in 0..channels {
                    let mut acc = 0.0f32;
                    for &(tx, ty, weight) in &taps {
                        if weight == 0.0 || tx < 0 || ty < 0 || tx >= w as i64 || ty >= h as i64
                        {
                            continue;
                        }
                        acc += weight * img[[0, c, ty as usize, tx as usize]];
                    }
                    out[[0, c, y, x]] = acc;
                }
            }
        }

        Ok(out)
    }
}

/// Sample position along one axis, clamped to `[-1, len]`. Every tap outside
/// that range is zero-filled anyway; non-finite positions sample nothing.
fn source_coord(pos: usize, offset: f32, len: usize) -> Option<f32> {
    let s = pos as f32 + offset;
    s.is_finite().then(|| s.clamp(-1.0, len as f32))
}
