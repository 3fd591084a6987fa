//! End-to-end conversion: video in, slow-motion video out.
//!
//! Frames are extracted into `<work_dir>/input`, interpolated into
//! `<work_dir>/output` and encoded to the requested `.mkv`. The working
//! directory is recreated at the start and removed at the end (also on
//! failure) unless `keep_temp` is set. Only directories marked with
//! [`WORK_DIR_MARKER`] are ever cleared.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use tracing::{info, warn};

use crate::backend::Device;
use crate::checkpoint::Checkpoint;
use crate::ffmpeg::Ffmpeg;
use crate::frame_store::{FrameStore, FrameWriter};
use crate::pipeline::{RunSummary, SlomoPipeline};

#[derive(Debug, Clone, PartialEq)]
pub struct SlomoRequest {
    pub video: PathBuf,
    pub checkpoint: PathBuf,
    pub output: PathBuf,
    pub fps: f64,
    pub factor: u32,
    pub device: Device,
    pub normalize_on_cpu: bool,
    pub work_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
    pub ffmpeg_dir: Option<PathBuf>,
    pub keep_temp: bool,
}

impl SlomoRequest {
    /// Reject bad arguments before any file is touched.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.factor >= 2,
            "slow-motion factor (--sf) has to be at least 2, got {}",
            self.factor
        );
        ensure!(
            self.fps.is_finite() && self.fps >= 1.0,
            "--fps has to be at least 1, got {}",
            self.fps
        );
        let is_mkv = self
            .output
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mkv"));
        ensure!(
            is_mkv,
            "output needs to have an mkv container: {}",
            self.output.display()
        );
        Ok(())
    }
}

/// Written into every working directory this tool creates. Only directories
/// carrying it are ever cleared or removed.
pub const WORK_DIR_MARKER: &str = ".slomo-workdir";

/// `<root>/input` and `<root>/output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Prepare `root` for a run. Leftovers of a previous run are wiped; an
    /// existing non-empty directory without the marker is refused untouched.
    pub fn create(root: &Path) -> Result<Self> {
        if root.exists() {
            ensure!(
                root.is_dir(),
                "working directory {} exists and is not a directory",
                root.display()
            );
            if is_marked(root) {
                std::fs::remove_dir_all(root).with_context(|| {
                    format!("failed to clear working directory {}", root.display())
                })?;
            } else {
                let mut entries = std::fs::read_dir(root)
                    .with_context(|| format!("failed to read {}", root.display()))?;
                ensure!(
                    entries.next().is_none(),
                    "refusing to use {} as working directory: it is not empty and was not created by slomo",
                    root.display()
                );
            }
        }

        let dir = Self {
            root: root.to_path_buf(),
        };
        for sub in [dir.input(), dir.output()] {
            std::fs::create_dir_all(&sub)
                .with_context(|| format!("failed to create {}", sub.display()))?;
        }
        let marker = root.join(WORK_DIR_MARKER);
        std::fs::write(&marker, b"")
            .with_context(|| format!("failed to write {}", marker.display()))?;
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn output(&self) -> PathBuf {
        self.root.join("output")
    }

    pub fn remove(&self) -> Result<()> {
        ensure!(
            is_marked(&self.root),
            "not removing {}: working directory marker is missing",
            self.root.display()
        );
        std::fs::remove_dir_all(&self.root)
            .with_context(|| format!("failed to remove working directory {}", self.root.display()))
    }
}

fn is_marked(root: &Path) -> bool {
    root.join(WORK_DIR_MARKER).is_file()
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub output: PathBuf,
    pub run: RunSummary,
}

/// Run the whole conversion. `progress` receives `(frames_written, total_output)`.
pub fn run_job<P>(request: &SlomoRequest, progress: P) -> Result<JobSummary>
where
    P: FnMut(usize, usize),
{
    request.validate()?;
    // Missing parameter sets are a configuration error; surface it before extraction.
    let checkpoint = Checkpoint::open(&request.checkpoint)?;

    let work = WorkDir::create(&request.work_dir)?;
    let result = convert(request, &checkpoint, &work, progress);

    if request.keep_temp {
        info!(dir = %work.root().display(), "Keeping working directory");
    } else if let Err(error) = work.remove() {
        warn!(error = %format!("{error:#}"), "Failed to clean up working directory");
    }

    result
}

fn convert<P>(
    request: &SlomoRequest,
    checkpoint: &Checkpoint,
    work: &WorkDir,
    progress: P,
) -> Result<JobSummary>
where
    P: FnMut(usize, usize),
{
    let ffmpeg = Ffmpeg::new(request.ffmpeg_dir.clone());
    ffmpeg.extract_frames(&request.video, &work.input())?;

    let store = FrameStore::open(&work.input())?;
    let mut writer = FrameWriter::create(&work.output())?;
    let normalization = request.device.normalization(request.normalize_on_cpu);
    let mut pipeline = SlomoPipeline::new(request.factor, normalization)?;

    let run = pipeline.run(
        &store,
        &mut writer,
        |working| checkpoint.load_models(request.device, &request.trt_cache_dir, working),
        progress,
    )?;

    ffmpeg.encode_video(&work.output(), request.fps, &request.output)?;
    info!(
        output = %request.output.display(),
        frames = run.output_frames,
        "Slow-motion video written"
    );

    Ok(JobSummary {
        output: request.output.clone(),
        run,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(work_dir: &Path) -> SlomoRequest {
        SlomoRequest {
            video: PathBuf::from("in.mp4"),
            checkpoint: PathBuf::from("checkpoint.json"),
            output: PathBuf::from("out.mkv"),
            fps: 30.0,
            factor: 4,
            device: Device::Cpu,
            normalize_on_cpu: false,
            work_dir: work_dir.to_path_buf(),
            trt_cache_dir: PathBuf::from("trt_cache"),
            ffmpeg_dir: None,
            keep_temp: false,
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(request(Path::new("w")).validate().is_ok());
        let mut upper = request(Path::new("w"));
        upper.output = PathBuf::from("OUT.MKV");
        assert!(upper.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_small_factor() {
        let mut req = request(Path::new("w"));
        req.factor = 1;
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("at least 2"));
    }

    #[test]
    fn test_validate_rejects_low_fps() {
        let mut req = request(Path::new("w"));
        req.fps = 0.5;
        assert!(req.validate().unwrap_err().to_string().contains("--fps"));
        req.fps = f64::NAN;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_requires_mkv() {
        let mut req = request(Path::new("w"));
        req.output = PathBuf::from("out.mp4");
        assert!(req.validate().unwrap_err().to_string().contains("mkv"));
        req.output = PathBuf::from("mkv");
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_work_dir_is_recreated_clean() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join(".tmpSuperSloMo");
        let first = WorkDir::create(&root).unwrap();
        std::fs::write(first.input().join("000001.png"), b"stale").unwrap();

        let work = WorkDir::create(&root).unwrap();
        assert!(work.input().is_dir());
        assert!(work.output().is_dir());
        assert_eq!(std::fs::read_dir(work.input()).unwrap().count(), 0);

        work.remove().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_work_dir_refuses_foreign_directory() {
        let temp = tempfile::tempdir().unwrap();
        let videos = temp.path().join("videos");
        std::fs::create_dir_all(&videos).unwrap();
        std::fs::write(videos.join("holiday.mp4"), b"precious").unwrap();

        let err = WorkDir::create(&videos).unwrap_err();
        assert!(err.to_string().contains("not created by slomo"));
        assert_eq!(std::fs::read(videos.join("holiday.mp4")).unwrap(), b"precious");
        assert!(!videos.join(WORK_DIR_MARKER).exists());
    }

    #[test]
    fn test_work_dir_accepts_existing_empty_directory() {
        let temp = tempfile::tempdir().unwrap();
        let work = WorkDir::create(temp.path()).unwrap();
        assert!(work.input().is_dir());
        assert!(temp.path().join(WORK_DIR_MARKER).is_file());
    }

    #[test]
    fn test_work_dir_rejects_file_path() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("notes.txt");
        std::fs::write(&file, b"keep").unwrap();
        assert!(WorkDir::create(&file).is_err());
        assert_eq!(std::fs::read(&file).unwrap(), b"keep");
    }

    #[test]
    fn test_remove_requires_marker() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("work");
        let work = WorkDir::create(&root).unwrap();
        std::fs::remove_file(root.join(WORK_DIR_MARKER)).unwrap();
        assert!(work.remove().is_err());
        assert!(root.exists());
    }

    #[test]
    fn test_invalid_request_touches_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("work");
        let mut req = request(&root);
        req.factor = 0;
        assert!(run_job(&req, |_, _| {}).is_err());
        assert!(!root.exists());
    }

    #[test]
    fn test_missing_checkpoint_key_fails_before_extraction() {
        let temp = tempfile::tempdir().unwrap();
        let ckpt = temp.path().join("checkpoint.json");
        std::fs::write(&ckpt, r#"{"state_dictFC": "fc.onnx"}"#).unwrap();

        let root = temp.path().join("work");
        let mut req = request(&root);
        req.checkpoint = ckpt;
        let err = run_job(&req, |_, _| {}).unwrap_err();
        assert!(err.to_string().contains("state_dictAT"));
        assert!(!root.exists());
    }
}
