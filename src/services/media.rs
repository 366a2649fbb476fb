//! Video probing and frame sampling via the FFmpeg CLI tools.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::models::job::VideoMetadata;

/// Callback receiving extraction progress as a percentage (0-100).
pub type ExtractProgress<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// Source of video metadata and sampled frames.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn probe(&self, video: &Path) -> Result<VideoMetadata, MediaError>;

    /// Sample frames at `rate` frames/second into `out_dir`.
    ///
    /// Returns the frame image paths in ascending frame order.
    async fn extract_frames(
        &self,
        video: &Path,
        out_dir: &Path,
        rate: f64,
        duration: f64,
        on_progress: ExtractProgress<'_>,
    ) -> Result<Vec<PathBuf>, MediaError>;
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Video file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),

    #[error("Invalid probe output: {0}")]
    InvalidProbeOutput(#[from] serde_json::Error),

    #[error("No video stream found")]
    NoVideoStream,

    #[error("Unusable video metadata: {0}")]
    InvalidMetadata(String),

    #[error("Frame extraction failed (exit code {code:?}): {stderr}")]
    ExtractionFailed { code: Option<i32>, stderr: String },

    #[error("Frame extraction timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    /// True when the input itself is unusable, as opposed to a tooling failure.
    pub fn is_metadata_error(&self) -> bool {
        matches!(
            self,
            MediaError::FileNotFound(_)
                | MediaError::ProbeFailed(_)
                | MediaError::InvalidProbeOutput(_)
                | MediaError::NoVideoStream
                | MediaError::InvalidMetadata(_)
        )
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

/// FFmpeg/ffprobe backed frame source.
#[derive(Debug, Clone)]
pub struct FfmpegFrameSource {
    ffmpeg: String,
    ffprobe: String,
    timeout: Duration,
}

impl FfmpegFrameSource {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            timeout,
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn probe(&self, video: &Path) -> Result<VideoMetadata, MediaError> {
        if !video.exists() {
            return Err(MediaError::FileNotFound(video.to_path_buf()));
        }

        let output = Command::new(&self.ffprobe)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(video)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| MediaError::Spawn {
                tool: self.ffprobe.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(MediaError::ProbeFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        parse_probe_output(&output.stdout)
    }

    async fn extract_frames(
        &self,
        video: &Path,
        out_dir: &Path,
        rate: f64,
        duration: f64,
        on_progress: ExtractProgress<'_>,
    ) -> Result<Vec<PathBuf>, MediaError> {
        let pattern = out_dir.join("frame_%05d.jpg");
        let mut child = Command::new(&self.ffmpeg)
            .args(["-y", "-v", "error", "-nostats", "-progress", "pipe:1", "-i"])
            .arg(video)
            .args(["-vf", &format!("fps={rate}"), "-q:v", "2"])
            .arg(&pattern)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MediaError::Spawn {
                tool: self.ffmpeg.clone(),
                source,
            })?;

        debug!(video = %video.display(), rate, "Extracting frames");

        let stdout = child.stdout.take().ok_or_else(|| {
            MediaError::Io(std::io::Error::other("ffmpeg stdout not captured"))
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            MediaError::Io(std::io::Error::other("ffmpeg stderr not captured"))
        })?;

        let total_us = (duration * 1_000_000.0).max(1.0);
        let run = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(out_time_us) = parse_out_time_us(&line) {
                    on_progress((out_time_us as f64 / total_us * 100.0).clamp(0.0, 100.0));
                }
            }
            let mut err_text = String::new();
            stderr.read_to_string(&mut err_text).await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, err_text))
        };

        let (status, err_text) = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(video = %video.display(), "Frame extraction timed out, killing ffmpeg");
                return Err(MediaError::Timeout(self.timeout.as_secs()));
            }
        };

        if !status.success() {
            return Err(MediaError::ExtractionFailed {
                code: status.code(),
                stderr: err_text.trim().to_string(),
            });
        }

        on_progress(100.0);
        list_frames(out_dir).await
    }
}

/// Parse ffprobe JSON into [`VideoMetadata`].
pub fn parse_probe_output(stdout: &[u8]) -> Result<VideoMetadata, MediaError> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)?;

    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or(MediaError::NoVideoStream)?;

    let duration = probe
        .format
        .duration
        .as_deref()
        .or(stream.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| MediaError::InvalidMetadata("missing duration".to_string()))?;

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .ok_or_else(|| MediaError::InvalidMetadata("missing frame rate".to_string()))?;

    if duration <= 0.0 || !duration.is_finite() {
        return Err(MediaError::InvalidMetadata(format!("duration {duration}")));
    }

    Ok(VideoMetadata::new(
        duration,
        fps,
        stream.width.unwrap_or(0),
        stream.height.unwrap_or(0),
    ))
}

/// Parse an ffprobe rate such as "30000/1001" or "25".
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };

    (value.is_finite() && value > 0.0).then_some(value)
}

/// Extract `out_time_us` (or the mislabelled `out_time_ms`, also microseconds) from a progress line.
fn parse_out_time_us(line: &str) -> Option<i64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.parse().ok().filter(|v: &i64| *v >= 0),
        _ => None,
    }
}

async fn list_frames(dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut frames = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "jpg") {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}
