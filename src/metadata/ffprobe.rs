// FFprobe wrapper for video metadata

use std::path::Path;

use serde::Deserialize;

use crate::error::{MediaError, Result};
use crate::jobs::cancel::CancelToken;
use crate::tools::{run_with_deadline, Tool, ToolCaps};

#[derive(Debug, Deserialize)]
struct FFprobeOutput {
    streams: Option<Vec<FFprobeStream>>,
    format: Option<FFprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FFprobeStream {
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FFprobeFormat {
    duration: Option<String>,
    format_name: Option<String>,
    bit_rate: Option<String>,
}

/// First video stream plus container info
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub duration: f64,
    pub codec: String,
    pub fps: Option<f64>,
    pub bitrate: Option<i64>,
    pub container: Option<String>,
}

/// Run ffprobe on a file. A missing ffprobe is a Tool error.
pub fn probe(caps: &ToolCaps, path: &Path, cancel: &CancelToken) -> Result<VideoProbe> {
    let mut cmd = caps.command(Tool::Ffprobe)?;
    cmd.args([
        "-v", "error",
        "-select_streams", "v:0",
        "-print_format", "json",
        "-show_format",
        "-show_streams",
    ])
    .arg(path);

    let output = run_with_deadline(&mut cmd, cancel)?;
    if !output.success() {
        return Err(MediaError::Tool(format!("ffprobe failed: {}", output.stderr_text())));
    }

    parse_probe_json(&output.stdout)
}

fn parse_probe_json(raw: &[u8]) -> Result<VideoProbe> {
    let probe_output: FFprobeOutput = serde_json::from_slice(raw)
        .map_err(|e| MediaError::Tool(format!("Failed to parse ffprobe output: {}", e)))?;

    let mut meta = VideoProbe::default();

    if let Some(stream) = probe_output.streams.as_ref().and_then(|s| s.first()) {
        meta.codec = stream.codec_name.clone().unwrap_or_default();
        meta.width = stream.width.unwrap_or(0);
        meta.height = stream.height.unwrap_or(0);
        meta.fps = parse_frame_rate(stream.r_frame_rate.as_deref());
        if let Some(d) = parse_seconds(stream.duration.as_deref()) {
            meta.duration = d;
        }
    }

    if let Some(ref format) = probe_output.format {
        // Container duration wins; stream durations are often missing or rounded
        if let Some(d) = parse_seconds(format.duration.as_deref()) {
            meta.duration = d;
        }
        meta.bitrate = format.bit_rate.as_ref().and_then(|s| s.parse().ok());
        meta.container = format.format_name.clone();
    }

    Ok(meta)
}

/// Parse frame rate string like "30000/1001" to f64
fn parse_frame_rate(rate_str: Option<&str>) -> Option<f64> {
    let rate_str = rate_str?;
    if let Some((num, den)) = rate_str.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    rate_str.parse().ok()
}

fn parse_seconds(duration_str: Option<&str>) -> Option<f64> {
    duration_str?.parse().ok()
}
