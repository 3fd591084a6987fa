use serde::{Deserialize, Serialize};

/// Model input sizes must be a multiple of this (five 2× down-samplings in the U-Nets).
pub const WORKING_ALIGN: u32 = 32;

/// Packed 8-bit RGB frame, row-major, as stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, dims: Dimensions) -> Self {
        Self {
            data,
            width: dims.width,
            height: dims.height,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }
}

/// Frame resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Resolution the learned models run at: each axis rounded down to a
    /// multiple of [`WORKING_ALIGN`], never below one alignment unit.
    pub fn working(&self) -> Self {
        Self {
            width: align_down(self.width),
            height: align_down(self.height),
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

fn align_down(dim: u32) -> u32 {
    ((dim / WORKING_ALIGN) * WORKING_ALIGN).max(WORKING_ALIGN)
}
