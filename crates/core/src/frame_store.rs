//! Numbered PNG frame sequences on disk.
//!
//! Files are named `%06d.png`, 1-indexed and gap-free. [`FrameStore`] reads
//! an existing sequence; [`FrameWriter`] owns the output counter and writes
//! strictly in order.

use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use image::{ExtendedColorType, ImageFormat};
use tracing::debug;

use crate::types::{Dimensions, Frame};

/// printf-style pattern shared with ffmpeg.
pub const FRAME_PATTERN: &str = "%06d.png";

/// File name of the frame at 1-based `index`.
pub fn frame_file_name(index: usize) -> String {
    format!("{index:06}.png")
}

fn parse_frame_index(name: &str) -> Option<usize> {
    let stem = name.strip_suffix(".png")?;
    if stem.len() < 6 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Read-only view of a decoded frame sequence.
#[derive(Debug, Clone)]
pub struct FrameStore {
    dir: PathBuf,
    paths: Vec<PathBuf>,
}

impl FrameStore {
    /// Scan `dir` for `%06d.png` files. Other files are ignored; a missing
    /// index in `1..=count` is an error.
    pub fn open(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read frame directory {}", dir.display()))?;

        let mut indexed = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(parse_frame_index) else {
                continue;
            };
            indexed.push((index, entry.path()));
        }
        indexed.sort_by_key(|(index, _)| *index);

        for (expected, (index, path)) in (1..).zip(indexed.iter()) {
            ensure!(
                *index == expected,
                "frame sequence in {} has a gap: expected {}, found {}",
                dir.display(),
                frame_file_name(expected),
                path.display()
            );
        }

        debug!(dir = %dir.display(), frames = indexed.len(), "Opened frame store");

        Ok(Self {
            dir: dir.to_path_buf(),
            paths: indexed.into_iter().map(|(_, path)| path).collect(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Decode frame `index` (0-based position in the sequence) as 8-bit RGB.
    pub fn read(&self, index: usize) -> Result<Frame> {
        let Some(path) = self.paths.get(index) else {
            bail!(
                "frame {} out of range (store holds {})",
                index + 1,
                self.paths.len()
            );
        };
        let img = image::open(path)
            .with_context(|| format!("failed to decode frame {}", path.display()))?
            .into_rgb8();
        let (width, height) = img.dimensions();
        Ok(Frame::new(img.into_raw(), Dimensions::new(width, height)))
    }

    /// Dimensions of the first frame, without decoding the rest.
    pub fn dimensions(&self) -> Result<Dimensions> {
        let Some(first) = self.paths.first() else {
            bail!("frame store {} is empty", self.dir.display());
        };
        let (width, height) = image::image_dimensions(first)
            .with_context(|| format!("failed to read {}", first.display()))?;
        Ok(Dimensions::new(width, height))
    }
}

/// Sequential PNG writer. The next index advances only after a successful write.
#[derive(Debug)]
pub struct FrameWriter {
    dir: PathBuf,
    next_index: usize,
}

impl FrameWriter {
    /// Start writing at `000001.png` in `dir`, creating it if needed.
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            next_index: 1,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of frames written so far.
    pub fn written(&self) -> usize {
        self.next_index - 1
    }

    /// Write an 8-bit RGB frame and return its path.
    pub fn write(&mut self, frame: &Frame) -> Result<PathBuf> {
        let dims = frame.dimensions();
        ensure!(
            frame.data.len() == dims.pixel_count() * 3,
            "frame buffer of {} bytes does not fit {} RGB",
            frame.data.len(),
            dims
        );

        let path = self.dir.join(frame_file_name(self.next_index));
        image::save_buffer_with_format(
            &path,
            &frame.data,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
            ImageFormat::Png,
        )
        .with_context(|| format!("failed to write {}", path.display()))?;
        self.next_index += 1;
        Ok(path)
    }
}
