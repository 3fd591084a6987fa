//! External ffmpeg invocations: video → numbered PNG frames and back.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::thread;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::frame_store::FRAME_PATTERN;

/// Arguments for decoding every frame of `video` into `frames_dir`.
///
/// `-vsync 0` keeps one PNG per decoded frame (no duplication or dropping).
pub fn extract_args(video: &Path, frames_dir: &Path) -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-y".into(),
        "-i".into(),
        video.to_string_lossy().into_owned(),
        "-vsync".into(),
        "0".into(),
        frames_dir.join(FRAME_PATTERN).to_string_lossy().into_owned(),
    ]
}

/// Arguments for assembling `frames_dir` into a lossless `output` at `fps`.
pub fn encode_args(frames_dir: &Path, fps: f64, output: &Path) -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-y".into(),
        "-r".into(),
        fps.to_string(),
        "-i".into(),
        frames_dir.join(FRAME_PATTERN).to_string_lossy().into_owned(),
        "-vcodec".into(),
        "ffvhuff".into(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Runs `ffmpeg` one-shot jobs from an optional tool directory.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    program: String,
    tool_dir: Option<PathBuf>,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Ffmpeg {
    pub fn new(tool_dir: Option<PathBuf>) -> Self {
        Self {
            program: "ffmpeg".to_string(),
            tool_dir,
        }
    }

    pub fn extract_frames(&self, video: &Path, frames_dir: &Path) -> Result<()> {
        info!(video = %video.display(), "Extracting frames");
        self.run(&extract_args(video, frames_dir), "ffmpeg_stderr")
            .with_context(|| format!("failed to extract frames from {}", video.display()))
    }

    pub fn encode_video(&self, frames_dir: &Path, fps: f64, output: &Path) -> Result<()> {
        info!(output = %output.display(), fps, "Encoding video");
        self.run(&encode_args(frames_dir, fps, output), "ffmpeg_encode_stderr")
            .with_context(|| format!("failed to encode {}", output.display()))
    }

    fn run(&self, args: &[String], stderr_target: &'static str) -> Result<()> {
        let command_line = format!("{} {}", self.program, args.join(" "));
        debug!(cmd = %command_line, "Launching FFmpeg");

        let mut child = crate::runtime::command_for(&self.program, self.tool_dir.as_deref())
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to launch {}; is it installed?", self.program))?;

        // Drain stderr so a chatty ffmpeg cannot block on a full pipe.
        let drain = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) if !line.is_empty() => {
                            log_stderr_line(stderr_target, &line);
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, "ffmpeg stderr read error");
                            break;
                        }
                    }
                }
                tail
            })
        });

        let status = child.wait().context("failed to wait for ffmpeg")?;
        let tail = drain
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            bail!(
                "`{command_line}` exited with status {status}: {}",
                Vec::from(tail).join(" | ")
            );
        }
        Ok(())
    }
}

const STDERR_TAIL_LINES: usize = 5;

// `tracing` targets must be static, so dispatch per known target.
fn log_stderr_line(target: &'static str, line: &str) {
    match target {
        "ffmpeg_encode_stderr" => debug!(target: "ffmpeg_encode_stderr", "{}", line),
        _ => debug!(target: "ffmpeg_stderr", "{}", line),
    }
}
