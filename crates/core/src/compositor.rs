//! Synthesis of one intermediate frame at fraction `t` between I0 and I1.
//!
//! Steps per call of [`Compositor::synthesize`]:
//! 1. approximate `F_t0`/`F_t1` from the pair's bidirectional flow,
//! 2. coarse-warp both frames,
//! 3. refine the flows and estimate visibility,
//! 4. re-warp with the refined flows,
//! 5. blend with visibility and temporal weights.
//!
//! Rescaling the result to the original resolution is [`Compositor::rescale`].

use anyhow::{ensure, Result};
use ndarray::Array4;
use tracing::debug;

use crate::flow::BidirectionalFlow;
use crate::interpolator::{complement, ArbitraryTimeInterpolator, RefineInputs};
use crate::resize::resize_bilinear;
use crate::types::Dimensions;
use crate::warp::BackWarp;

/// Below this total weight a pixel falls back to a single warped candidate.
pub const BLEND_EPSILON: f32 = 1e-8;

/// Quadratic flow-interpolation coefficients for fraction `t`.
///
/// `F_t0 = c0·F01 + c1·F10`, `F_t1 = c2·F01 + c3·F10`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowCoefficients {
    pub c0: f32,
    pub c1: f32,
    pub c2: f32,
    pub c3: f32,
}

impl FlowCoefficients {
    pub fn for_fraction(t: f32) -> Self {
        let temp = -t * (1.0 - t);
        Self {
            c0: temp,
            c1: t * t,
            c2: (1.0 - t) * (1.0 - t),
            c3: temp,
        }
    }

    /// Returns `(F_t0, F_t1)`.
    pub fn apply(&self, flow: &BidirectionalFlow) -> (Array4<f32>, Array4<f32>) {
        let ft0 = &flow.forward * self.c0 + &flow.backward * self.c1;
        let ft1 = &flow.forward * self.c2 + &flow.backward * self.c3;
        (ft0, ft1)
    }
}

/// Temporal blend weights `(w0, w1) = (1 - t, t)`.
pub fn blend_weights(t: f32) -> (f32, f32) {
    (1.0 - t, t)
}

/// Visibility- and time-weighted average of two warped candidates.
///
/// `v0` is `[1,1,H,W]` and broadcast over the color channels; `V_t1 = 1 - v0`.
/// Where `w0·V_t0 + w1·V_t1` vanishes the pixel copies the candidate with
/// the larger temporal weight.
pub fn blend(
    warped0: &Array4<f32>,
    warped1: &Array4<f32>,
    v0: &Array4<f32>,
    t: f32,
) -> Result<Array4<f32>> {
    let shape = warped0.shape();
    ensure!(shape[0] == 1, "blend expects a batch of one, got {:?}", shape);
    ensure!(
        warped1.shape() == shape,
        "warped candidates differ in shape: {:?} vs {:?}",
        shape,
        warped1.shape()
    );
    ensure!(
        v0.shape() == [1, 1, shape[2], shape[3]],
        "visibility map {:?} does not match candidates {:?}",
        v0.shape(),
        shape
    );

    let (w0, w1) = blend_weights(t);
    let prefer_first = w0 >= w1;
    let v1 = complement(v0);

    let mut out = Array4::<f32>::zeros(warped0.raw_dim());
    let mut guarded = 0usize;
    for ((_, c, y, x), o) in out.indexed_iter_mut() {
        let g0 = warped0[[0, c, y, x]];
        let g1 = warped1[[0, c, y, x]];
        let n0 = w0 * v0[[0, 0, y, x]];
        let n1 = w1 * v1[[0, 0, y, x]];
        let denom = n0 + n1;
        if denom.abs() > BLEND_EPSILON {
            *o = (n0 * g0 + n1 * g1) / denom;
        } else {
            guarded += 1;
            *o = if prefer_first { g0 } else { g1 };
        }
    }

    if guarded > 0 {
        debug!(guarded, t, "Blend weights vanished; used single-candidate fallback");
    }

    Ok(out)
}

/// Runs steps 1–5 for one fraction and owns the frozen refinement network.
pub struct Compositor {
    warp: BackWarp,
    interpolator: ArbitraryTimeInterpolator,
}

impl Compositor {
    pub fn new(warp: BackWarp, interpolator: ArbitraryTimeInterpolator) -> Self {
        Self { warp, interpolator }
    }

    /// Synthesize the frame at `t` (working resolution, normalized tensor).
    pub fn synthesize(
        &mut self,
        i0: &Array4<f32>,
        i1: &Array4<f32>,
        flow: &BidirectionalFlow,
        t: f32,
    ) -> Result<Array4<f32>> {
        ensure!(t > 0.0 && t < 1.0, "interpolation fraction {t} outside (0, 1)");

        let (ft0, ft1) = FlowCoefficients::for_fraction(t).apply(flow);
        let coarse0 = self.warp.warp(i0, &ft0)?;
        let coarse1 = self.warp.warp(i1, &ft1)?;

        let refinement = self.interpolator.refine(&RefineInputs {
            i0,
            i1,
            f01: &flow.forward,
            f10: &flow.backward,
            ft0: &ft0,
            ft1: &ft1,
            warped0: &coarse0,
            warped1: &coarse1,
        })?;
        drop((coarse0, coarse1));

        let refined_t0 = ft0 + &refinement.delta_t0;
        let refined_t1 = ft1 + &refinement.delta_t1;
        let v0 = refinement.visibility_t0();
        drop(refinement);

        let warped0 = self.warp.warp(i0, &refined_t0)?;
        let warped1 = self.warp.warp(i1, &refined_t1)?;
        drop((refined_t0, refined_t1));

        let frame = blend(&warped0, &warped1, &v0, t)?;
        debug!(t, "Intermediate frame composited");
        Ok(frame)
    }

    /// Bring a working-resolution frame back to `original`.
    pub fn rescale(frame: &Array4<f32>, original: Dimensions) -> Result<Array4<f32>> {
        resize_bilinear(frame, original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow_with(forward: f32, backward: f32) -> BidirectionalFlow {
        BidirectionalFlow {
            forward: Array4::from_elem((1, 2, 2, 2), forward),
            backward: Array4::from_elem((1, 2, 2, 2), backward),
        }
    }

    fn zero_refiner() -> ArbitraryTimeInterpolator {
        ArbitraryTimeInterpolator::new(Box::new(|input: &Array4<f32>| -> Result<Array4<f32>> {
            let s = input.shape();
            Ok(Array4::<f32>::zeros((1, 5, s[2], s[3])))
        }))
    }

    #[test]
    fn test_coefficients_at_midpoint() {
        let c = FlowCoefficients::for_fraction(0.5);
        assert_eq!(c.c0, -0.25);
        assert_eq!(c.c1, 0.25);
        assert_eq!(c.c2, 0.25);
        assert_eq!(c.c3, -0.25);

        let (ft0, ft1) = c.apply(&flow_with(4.0, 8.0));
        // -0.25·4 + 0.25·8 and 0.25·4 - 0.25·8
        assert!(ft0.iter().all(|&v| v == 1.0));
        assert!(ft1.iter().all(|&v| v == -1.0));
    }

    #[test]
    fn test_coefficients_at_quarter() {
        let c = FlowCoefficients::for_fraction(0.25);
        assert!((c.c0 + 0.1875).abs() < 1e-7);
        assert!((c.c1 - 0.0625).abs() < 1e-7);
        assert!((c.c2 - 0.5625).abs() < 1e-7);
        assert_eq!(c.c0, c.c3);
    }

    #[test]
    fn test_blend_weights() {
        assert_eq!(blend_weights(0.25), (0.75, 0.25));
        assert_eq!(blend_weights(0.0), (1.0, 0.0));
    }

    #[test]
    fn test_blend_equal_visibility_is_temporal_lerp() {
        let g0 = Array4::from_elem((1, 3, 2, 2), 0.2);
        let g1 = Array4::from_elem((1, 3, 2, 2), 0.6);
        let v0 = Array4::from_elem((1, 1, 2, 2), 0.5);
        let out = blend(&g0, &g1, &v0, 0.25).unwrap();
        assert!(out.iter().all(|&v| (v - 0.3).abs() < 1e-6));
    }

    #[test]
    fn test_blend_full_visibility_selects_candidate() {
        let g0 = Array4::from_elem((1, 3, 2, 2), 0.2);
        let g1 = Array4::from_elem((1, 3, 2, 2), 0.6);
        let only_first = Array4::from_elem((1, 1, 2, 2), 1.0);
        let out = blend(&g0, &g1, &only_first, 0.7).unwrap();
        assert!(out.iter().all(|&v| (v - 0.2).abs() < 1e-6));
    }

    #[test]
    fn test_blend_zero_denominator_falls_back() {
        // V_t0 = 0 and t = 0: both weighted terms vanish.
        let g0 = Array4::from_elem((1, 3, 2, 2), 0.2);
        let g1 = Array4::from_elem((1, 3, 2, 2), 0.6);
        let v0 = Array4::zeros((1, 1, 2, 2));
        let out = blend(&g0, &g1, &v0, 0.0).unwrap();
        assert!(out.iter().all(|v| v.is_finite()));
        assert!(out.iter().all(|&v| v == 0.2));

        // Mirror case: V_t0 = 1 and t = 1 favours the second candidate.
        let v0 = Array4::ones((1, 1, 2, 2));
        let out = blend(&g0, &g1, &v0, 1.0).unwrap();
        assert!(out.iter().all(|&v| v == 0.6));
    }

    #[test]
    fn test_blend_per_pixel_visibility() {
        let g0 = Array4::from_elem((1, 3, 1, 2), 1.0);
        let g1 = Array4::from_elem((1, 3, 1, 2), 0.0);
        let v0 = Array4::from_shape_vec((1, 1, 1, 2), vec![1.0, 0.0]).unwrap();
        let out = blend(&g0, &g1, &v0, 0.5).unwrap();
        for c in 0..3 {
            assert_eq!(out[[0, c, 0, 0]], 1.0);
            assert_eq!(out[[0, c, 0, 1]], 0.0);
        }
    }

    #[test]
    fn test_blend_shape_mismatch() {
        let g0 = Array4::<f32>::zeros((1, 3, 2, 2));
        let g1 = Array4::<f32>::zeros((1, 3, 2, 2));
        let v0 = Array4::<f32>::zeros((1, 1, 4, 2));
        assert!(blend(&g0, &g1, &v0, 0.5).is_err());
    }

    #[test]
    fn test_synthesize_with_zero_motion_is_crossfade() {
        let dims = Dimensions::new(2, 2);
        let mut compositor = Compositor::new(BackWarp::new(dims), zero_refiner());
        let i0 = Array4::from_elem((1, 3, 2, 2), 0.0);
        let i1 = Array4::from_elem((1, 3, 2, 2), 1.0);
        let flow = flow_with(0.0, 0.0);

        for &t in &[0.25f32, 0.5, 0.75] {
            let out = compositor.synthesize(&i0, &i1, &flow, t).unwrap();
            assert!(out.iter().all(|&v| (v - t).abs() < 1e-6), "t={t}");
        }
    }

    #[test]
    fn test_synthesize_rewarps_each_frame_with_its_refined_flow() {
        // One row, six pixels. I0 ramps 1..6, I1 ramps 10..60.
        let dims = Dimensions::new(6, 1);
        let i0 = Array4::from_shape_fn((1, 3, 1, 6), |(_, _, _, x)| (x + 1) as f32);
        let i1 = Array4::from_shape_fn((1, 3, 1, 6), |(_, _, _, x)| 10.0 * (x + 1) as f32);

        // F01 = (4, 0), F10 = 0, so at t = 0.5: F_t0 = (-1, 0), F_t1 = (1, 0).
        let mut forward = Array4::<f32>::zeros((1, 2, 1, 6));
        forward.slice_mut(ndarray::s![0, 0, .., ..]).fill(4.0);
        let flow = BidirectionalFlow {
            forward,
            backward: Array4::zeros((1, 2, 1, 6)),
        };

        // Deltas (+2, 0) and (+1, 0) give refined flows (1, 0) and (2, 0).
        let refiner = ArbitraryTimeInterpolator::new(Box::new(
            |input: &Array4<f32>| -> Result<Array4<f32>> {
                // Stacked order puts F_t1 before F_t0.
                assert_eq!(input[[0, 10, 0, 0]], 1.0);
                assert_eq!(input[[0, 12, 0, 0]], -1.0);
                let mut out = Array4::<f32>::zeros((1, 5, 1, 6));
                out.slice_mut(ndarray::s![0, 0, .., ..]).fill(2.0);
                out.slice_mut(ndarray::s![0, 2, .., ..]).fill(1.0);
                Ok(out)
            },
        ));

        let mut compositor = Compositor::new(BackWarp::new(dims), refiner);
        let out = compositor.synthesize(&i0, &i1, &flow, 0.5).unwrap();

        // g0(x) = I0(x + 1), g1(x) = I1(x + 2), zero past the right edge;
        // equal visibility at t = 0.5 averages them.
        let expected = [16.0, 21.5, 27.0, 32.5, 3.0, 0.0];
        for c in 0..3 {
            for (x, &want) in expected.iter().enumerate() {
                let got = out[[0, c, 0, x]];
                assert!((got - want).abs() < 1e-4, "x={x}: got {got}, expected {want}");
            }
        }
    }

    #[test]
    fn test_synthesize_rejects_endpoint_fractions() {
        let dims = Dimensions::new(2, 2);
        let mut compositor = Compositor::new(BackWarp::new(dims), zero_refiner());
        let i0 = Array4::zeros((1, 3, 2, 2));
        let flow = flow_with(0.0, 0.0);
        assert!(compositor.synthesize(&i0, &i0, &flow, 0.0).is_err());
        assert!(compositor.synthesize(&i0, &i0, &flow, 1.0).is_err());
    }

    #[test]
    fn test_rescale_to_original_dimensions() {
        let frame = Array4::from_elem((1, 3, 32, 64), 0.5);
        let out = Compositor::rescale(&frame, Dimensions::new(70, 40)).unwrap();
        assert_eq!(out.shape(), &[1, 3, 40, 70]);
        assert!(out.iter().all(|&v| (v - 0.5).abs() < 1e-6));
    }
}
