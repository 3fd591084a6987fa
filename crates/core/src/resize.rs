//! Pure-Rust bilinear resampling of `[1, C, H, W]` tensors.

use anyhow::{ensure, Result};
use ndarray::Array4;

use crate::types::Dimensions;

/// Bilinear resize with pixel-center alignment and edge clamping.
///
/// Used to move frames between the original resolution and the model's
/// working resolution. Same-size requests return an unchanged copy.
pub fn resize_bilinear(src: &Array4<f32>, target: Dimensions) -> Result<Array4<f32>> {
    let shape = src.shape();
    let (n, c, src_h, src_w) = (shape[0], shape[1], shape[2], shape[3]);
    let dst_h = target.height as usize;
    let dst_w = target.width as usize;

    ensure!(
        src_h > 0 && src_w > 0,
        "cannot resize an empty {src_w}x{src_h} tensor"
    );
    ensure!(
        dst_h > 0 && dst_w > 0,
        "cannot resize to empty target {target}"
    );

    if src_h == dst_h && src_w == dst_w {
        return Ok(src.clone());
    }

    // Horizontal taps are shared by every row and channel.
    let x_taps: Vec<(usize, usize, f32)> = (0..dst_w)
        .map(|dst_x| source_taps(dst_x, src_w, dst_w))
        .collect();

    let mut dst = Array4::<f32>::zeros((n, c, dst_h, dst_w));
    for dst_y in 0..dst_h {
        let (y0, y1, fy) = source_taps(dst_y, src_h, dst_h);
        for b in 0..n {
            for ch in 0..c {
                for (dst_x, &(x0, x1, fx)) in x_taps.iter().enumerate() {
                    let p00 = src[[b, ch, y0, x0]];
                    let p10 = src[[b, ch, y0, x1]];
                    let p01 = src[[b, ch, y1, x0]];
                    let p11 = src[[b, ch, y1, x1]];

                    let top = p00 * (1.0 - fx) + p10 * fx;
                    let bot = p01 * (1.0 - fx) + p11 * fx;
                    dst[[b, ch, dst_y, dst_x]] = top * (1.0 - fy) + bot * fy;
                }
            }
        }
    }

    Ok(dst)
}

/// Map a destination index to its two source neighbours and the blend factor.
fn source_taps(dst: usize, src_len: usize, dst_len: usize) -> (usize, usize, f32) {
    let pos = (dst as f64 + 0.5) * src_len as f64 / dst_len as f64 - 0.5;
    let i0 = pos.floor().max(0.0) as usize;
    let i0 = i0.min(src_len - 1);
    let i1 = (i0 + 1).min(src_len - 1);
    let f = (pos - i0 as f64).clamp(0.0, 1.0) as f32;
    (i0, i1, f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(h: usize, w: usize) -> Array4<f32> {
        Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| (c * 100 + y * 10 + x) as f32)
    }

    #[test]
    fn test_same_size_is_identity() {
        let src = ramp(4, 6);
        let out = resize_bilinear(&src, Dimensions::new(6, 4)).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn test_output_shape() {
        let src = ramp(32, 64);
        let out = resize_bilinear(&src, Dimensions::new(70, 40)).unwrap();
        assert_eq!(out.shape(), &[1, 3, 40, 70]);
    }

    #[test]
    fn test_solid_color_preserved() {
        let src = Array4::<f32>::from_elem((1, 3, 32, 32), 0.25);
        let out = resize_bilinear(&src, Dimensions::new(45, 17)).unwrap();
        assert!(out.iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_downscale_by_two_averages_pairs() {
        let src = Array4::from_shape_fn((1, 1, 2, 4), |(_, _, _, x)| x as f32);
        let out = resize_bilinear(&src, Dimensions::new(2, 1)).unwrap();
        assert!((out[[0, 0, 0, 0]] - 0.5).abs() < 1e-6);
        assert!((out[[0, 0, 0, 1]] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_upscale_stays_within_source_range() {
        let src = ramp(3, 3);
        let out = resize_bilinear(&src, Dimensions::new(9, 9)).unwrap();
        let (min, max) = (0.0f32, 222.0f32);
        assert!(out.iter().all(|&v| v >= min - 1e-4 && v <= max + 1e-4));
        assert_eq!(out[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_empty_target_rejected() {
        let src = ramp(2, 2);
        assert!(resize_bilinear(&src, Dimensions::new(0, 2)).is_err());
    }
}
