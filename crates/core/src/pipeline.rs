//! Drives a frame sequence through flow estimation and compositing.
//!
//! For `F` input frames and factor `N` the output holds
//! `F + (F - 1)(N - 1)` frames: each original frame followed by its `N - 1`
//! intermediates, with the final original frame appended once at the end.

use std::time::{Duration, Instant};

use anyhow::{ensure, Result};
use ndarray::Array4;
use tracing::{debug, info};

use crate::compositor::Compositor;
use crate::flow::FlowEstimator;
use crate::frame_store::{FrameStore, FrameWriter};
use crate::interpolator::ArbitraryTimeInterpolator;
use crate::resize::resize_bilinear;
use crate::tensor::{nchw_to_rgb, rgb_to_nchw, Normalization};
use crate::types::{Dimensions, Frame};
use crate::warp::BackWarp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    LoadingCheckpoint,
    ProcessingPairs,
    Done,
    Failed,
}

/// Fractions `1/N, 2/N, …, (N-1)/N`.
pub fn timesteps_for_factor(factor: u32) -> Vec<f32> {
    (1..factor).map(|i| i as f32 / factor as f32).collect()
}

/// Number of frames written for `frames` inputs at `factor`.
pub fn expected_output_len(frames: usize, factor: u32) -> usize {
    if frames == 0 {
        return 0;
    }
    frames + (frames - 1) * (factor as usize).saturating_sub(1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub input_frames: usize,
    pub output_frames: usize,
    pub original: Dimensions,
    pub working: Dimensions,
    pub elapsed: Duration,
}

/// One decoded frame: the untouched RGB plus its working-resolution tensor.
struct Prepared {
    rgb: Frame,
    tensor: Array4<f32>,
}

pub struct SlomoPipeline {
    factor: u32,
    normalization: Normalization,
    state: PipelineState,
}

impl SlomoPipeline {
    pub fn new(factor: u32, normalization: Normalization) -> Result<Self> {
        ensure!(factor >= 2, "slow-motion factor must be at least 2, got {factor}");
        Ok(Self {
            factor,
            normalization,
            state: PipelineState::Init,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    fn transition(&mut self, next: PipelineState) {
        debug!(from = ?self.state, to = ?next, "Pipeline state");
        self.state = next;
    }

    /// Interpolate every consecutive pair in `store` into `writer`.
    ///
    /// `load_models` is given the working resolution and must return both
    /// networks; `progress` receives `(frames_written, total_output)` after
    /// every write.
    pub fn run<L, P>(
        &mut self,
        store: &FrameStore,
        writer: &mut FrameWriter,
        load_models: L,
        progress: P,
    ) -> Result<RunSummary>
    where
        L: FnOnce(Dimensions) -> Result<(FlowEstimator, ArbitraryTimeInterpolator)>,
        P: FnMut(usize, usize),
    {
        ensure!(
            self.state == PipelineState::Init,
            "pipeline already ran (state {:?})",
            self.state
        );
        let result = self.run_inner(store, writer, load_models, progress);
        match &result {
            Ok(_) => self.transition(PipelineState::Done),
            Err(_) => self.transition(PipelineState::Failed),
        }
        result
    }

    fn run_inner<L, P>(
        &mut self,
        store: &FrameStore,
        writer: &mut FrameWriter,
        load_models: L,
        mut progress: P,
    ) -> Result<RunSummary>
    where
        L: FnOnce(Dimensions) -> Result<(FlowEstimator, ArbitraryTimeInterpolator)>,
        P: FnMut(usize, usize),
    {
        let started = Instant::now();
        ensure!(!store.is_empty(), "no frames found in {}", store.dir().display());

        let original = store.dimensions()?;
        let working = original.working();
        let frame_count = store.len();
        let total = expected_output_len(frame_count, self.factor);

        self.transition(PipelineState::LoadingCheckpoint);
        let (mut flow, interp) = load_models(working)?;
        let mut compositor = Compositor::new(BackWarp::new(working), interp);

        info!(
            frames = frame_count,
            factor = self.factor,
            original = %original,
            working = %working,
            total_output = total,
            "Interpolating frame sequence"
        );

        self.transition(PipelineState::ProcessingPairs);
        let timesteps = timesteps_for_factor(self.factor);
        let mut current = self.prepare(store, 0, original, working)?;

        for index in 1..frame_count {
            let next = self.prepare(store, index, original, working)?;

            writer.write(&current.rgb)?;
            progress(writer.written(), total);

            let pair_flow = flow.estimate(&current.tensor, &next.tensor)?;
            for &t in &timesteps {
                let composed = compositor.synthesize(&current.tensor, &next.tensor, &pair_flow, t)?;
                let rescaled = Compositor::rescale(&composed, original)?;
                drop(composed);
                let rgb = nchw_to_rgb(&rescaled, &self.normalization)?;
                writer.write(&Frame::new(rgb, original))?;
                progress(writer.written(), total);
            }
            drop(pair_flow);

            debug!(pair = index, written = writer.written(), "Pair complete");
            // The right frame of this pair is the left frame of the next.
            current = next;
        }

        writer.write(&current.rgb)?;
        progress(writer.written(), total);

        let summary = RunSummary {
            input_frames: frame_count,
            output_frames: writer.written(),
            original,
            working,
            elapsed: started.elapsed(),
        };
        info!(
            output_frames = summary.output_frames,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "Interpolation finished"
        );
        Ok(summary)
    }

    fn prepare(
        &self,
        store: &FrameStore,
        index: usize,
        original: Dimensions,
        working: Dimensions,
    ) -> Result<Prepared> {
        let rgb = store.read(index)?;
        ensure!(
            rgb.dimensions() == original,
            "resolution mismatch at frame {}: {} differs from {}",
            index + 1,
            rgb.dimensions(),
            original
        );
        let full = rgb_to_nchw(&rgb.data, original, &self.normalization)?;
        let tensor = if working == original {
            full
        } else {
            resize_bilinear(&full, working)?
        };
        Ok(Prepared { rgb, tensor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timesteps() {
        assert_eq!(timesteps_for_factor(2), vec![0.5]);
        assert_eq!(timesteps_for_factor(4), vec![0.25, 0.5, 0.75]);
        for n in 2..=16 {
            let ts = timesteps_for_factor(n);
            assert_eq!(ts.len(), (n - 1) as usize);
            assert!(ts.windows(2).all(|w| w[0] < w[1]));
            assert!(ts.iter().all(|&t| t > 0.0 && t < 1.0));
        }
    }

    #[test]
    fn test_expected_output_len() {
        assert_eq!(expected_output_len(2, 4), 5);
        assert_eq!(expected_output_len(10, 2), 19);
        assert_eq!(expected_output_len(1, 8), 1);
        assert_eq!(expected_output_len(0, 8), 0);
        for frames in 1..20usize {
            for n in 2..10u32 {
                assert_eq!(
                    expected_output_len(frames, n),
                    (frames - 1) * n as usize + 1
                );
            }
        }
    }

    #[test]
    fn test_factor_below_two_rejected() {
        assert!(SlomoPipeline::new(1, Normalization::identity()).is_err());
        let pipeline = SlomoPipeline::new(2, Normalization::identity()).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Init);
        assert_eq!(pipeline.factor(), 2);
    }

    #[test]
    fn test_empty_store_fails_without_loading_models() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let store = FrameStore::open(input.path()).unwrap();
        let mut writer = FrameWriter::create(output.path()).unwrap();
        let mut pipeline = SlomoPipeline::new(2, Normalization::identity()).unwrap();

        let err = pipeline
            .run(
                &store,
                &mut writer,
                |_| -> Result<(FlowEstimator, ArbitraryTimeInterpolator)> {
                    panic!("models must not load for an empty store")
                },
                |_, _| {},
            )
            .unwrap_err();
        assert!(err.to_string().contains("no frames found"));
        assert_eq!(pipeline.state(), PipelineState::Failed);
    }
}
