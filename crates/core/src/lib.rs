//! Neural frame-rate upsampling: bidirectional flow, arbitrary-time
//! refinement and visibility-weighted compositing over PNG frame sequences.

pub mod backend;
pub mod checkpoint;
pub mod compositor;
pub mod config;
pub mod ffmpeg;
pub mod flow;
pub mod frame_store;
pub mod interpolator;
pub mod job;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod resize;
pub mod runtime;
pub mod tensor;
pub mod types;
pub mod warp;
