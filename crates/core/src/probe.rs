use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use log::debug;
use serde::Deserialize;
use tokio::process::Command;

use crate::error::ProbeError;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub size: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    #[serde(default)]
    pub index: i32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub nb_frames: Option<String>,
    pub avg_frame_rate: Option<String>,
    pub duration: Option<String>,
}

/// Frame counts beyond this only come from corrupt container metadata
const MAX_PLAUSIBLE_FRAMES: u64 = u32::MAX as u64;

/// What the pipeline needs to know about a source file
#[derive(Debug, Clone, PartialEq)]
pub struct MediaMetadata {
    /// Container-level tags
    pub tags: HashMap<String, String>,
    pub size_bytes: u64,
    /// Frames in the first video stream, if the container says
    pub frame_count: Option<u64>,
}

impl MediaMetadata {
    pub fn comment(&self) -> Option<&str> {
        crate::ledger::comment_tag(&self.tags)
    }

    /// Reduce raw prober JSON to the fields the pipeline uses
    pub fn from_json(path: &Path, json: &str) -> Result<Self, ProbeError> {
        let data: FFProbeData = serde_json::from_str(json).map_err(|source| ProbeError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_probe(path, data))
    }

    fn from_probe(path: &Path, data: FFProbeData) -> Self {
        let size_bytes = data
            .format
            .size
            .as_deref()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .or_else(|| std::fs::metadata(path).ok().map(|m| m.len()))
            .unwrap_or(0);

        let video = data
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"));

        let frame_count = video.and_then(|stream| {
            stream
                .nb_frames
                .as_deref()
                .and_then(|n| n.trim().parse::<u64>().ok())
                .filter(|n| (1..=MAX_PLAUSIBLE_FRAMES).contains(n))
                .or_else(|| {
                    let duration = stream
                        .duration
                        .as_deref()
                        .or(data.format.duration.as_deref())
                        .and_then(|d| d.trim().parse::<f64>().ok())?;
                    let fps = parse_frame_rate(stream.avg_frame_rate.as_deref()?)?;
                    let frames = (duration * fps).round();
                    (frames.is_finite() && frames >= 1.0 && frames <= MAX_PLAUSIBLE_FRAMES as f64)
                        .then_some(frames as u64)
                })
        });

        Self {
            tags: data.format.tags.unwrap_or_default(),
            size_bytes,
            frame_count,
        }
    }
}

/// Parse ffprobe's `num/den` frame rate notation
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((n, d)) => (n.trim().parse::<f64>().ok()?, d.trim().parse::<f64>().ok()?),
        None => (rate.trim().parse::<f64>().ok()?, 1.0),
    };
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}

/// Run ffprobe on a file and parse its JSON report.
///
/// The child is killed if this future is dropped, so the caller may race it
/// against an abort request.
pub async fn probe(ffprobe_bin: &Path, path: &Path) -> Result<MediaMetadata, ProbeError> {
    debug!("Probing {}", path.display());

    let output = Command::new(ffprobe_bin)
        .arg("-v")
        .arg("quiet")
        .arg("-loglevel")
        .arg("error")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ProbeError::Spawn {
            path: path.to_path_buf(),
            source,
        })?;

    if !output.status.success() {
        return Err(ProbeError::Exit {
            path: path.to_path_buf(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let json = String::from_utf8_lossy(&output.stdout);
    MediaMetadata::from_json(path, &json)
}
