// Tool-backed thumbnail capture
//
// Video: one frame at ~0.5s piped out of ffmpeg as MJPEG.
// Stills (RAW, PSD): the tool renders into a temp JPEG which is read back.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{MediaError, Result};
use crate::jobs::cancel::CancelToken;
use crate::preview::ThumbOptions;
use crate::tools::{run_checked, Tool, ToolCaps};

/// Grab a single scaled frame from a video.
pub fn capture_video_frame(
    caps: &ToolCaps,
    source_path: &Path,
    options: &ThumbOptions,
    cancel: &CancelToken,
) -> Result<Vec<u8>> {
    let mut cmd = caps.command(Tool::Ffmpeg)?;

    let scale_filter = format!("scale={}:-1", options.max_edge);

    cmd.args(["-v", "error", "-ss", &options.video_seek, "-i"])
        .arg(source_path)
        .args([
            "-frames:v", "1",      // Single frame
            "-vf", &scale_filter,
            "-f", "image2pipe",
            "-vcodec", "mjpeg",
            "-an",
            "-sn",
            "pipe:1",
        ]);

    let output = run_checked(&mut cmd, cancel)?;
    if output.stdout.is_empty() {
        return Err(MediaError::Tool("ffmpeg produced no frame".to_string()));
    }
    Ok(output.stdout)
}

/// Temp file that is removed on drop
struct TempOutput(PathBuf);

impl TempOutput {
    fn new(prefix: &str) -> Self {
        let name = format!("{}-{}.jpg", prefix, uuid::Uuid::new_v4());
        Self(std::env::temp_dir().join(name))
    }
}

impl Drop for TempOutput {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Run `build(out_path)` and read the JPEG it wrote.
fn render_to_temp<F>(prefix: &str, cancel: &CancelToken, build: F) -> Result<Vec<u8>>
where
    F: FnOnce(&Path) -> Command,
{
    let out = TempOutput::new(prefix);
    let mut cmd = build(&out.0);
    run_checked(&mut cmd, cancel)?;

    let bytes = std::fs::read(&out.0)?;
    if bytes.is_empty() {
        return Err(MediaError::Tool("Thumbnail file is empty".to_string()));
    }
    Ok(bytes)
}

/// `sips -s format jpeg -Z <edge> <src> --out <tmp>`
pub fn render_with_sips(
    caps: &ToolCaps,
    source_path: &Path,
    options: &ThumbOptions,
    cancel: &CancelToken,
) -> Result<Vec<u8>> {
    let sips = caps.command(Tool::Sips)?;
    let edge = options.max_edge.to_string();
    render_to_temp("sips-thumb", cancel, move |out| {
        let mut cmd = sips;
        cmd.args(["-s", "format", "jpeg", "-Z", &edge])
            .arg(source_path)
            .arg("--out")
            .arg(out);
        cmd
    })
}

/// ImageMagick (`magick` or legacy `convert`) rendering of the first layer
pub fn render_with_magick(
    caps: &ToolCaps,
    tool: Tool,
    source_path: &Path,
    options: &ThumbOptions,
    cancel: &CancelToken,
) -> Result<Vec<u8>> {
    let magick = caps.command(tool)?;
    let geometry = format!("{0}x{0}", options.max_edge);
    let first_layer = format!("{}[0]", source_path.display());
    render_to_temp("magick-thumb", cancel, move |out| {
        let mut cmd = magick;
        cmd.arg(&first_layer)
            .args(["-thumbnail", &geometry])
            .arg(format!("jpeg:{}", out.display()));
        cmd
    })
}

/// Embedded preview JPEG from a RAW file (`dcraw -e -c`)
pub fn extract_dcraw_preview(caps: &ToolCaps, source_path: &Path, cancel: &CancelToken) -> Result<Vec<u8>> {
    let mut cmd = caps.command(Tool::Dcraw)?;
    cmd.args(["-e", "-c"]).arg(source_path);
    let output = run_checked(&mut cmd, cancel)?;
    if output.stdout.is_empty() {
        return Err(MediaError::Tool("dcraw produced no preview".to_string()));
    }
    Ok(output.stdout)
}

/// Parse `pixelWidth: N` / `pixelHeight: N` lines from `sips -g`
pub fn parse_sips_size(out: &str) -> Option<(u32, u32)> {
    let mut w = 0;
    let mut h = 0;
    for line in out.lines().map(str::trim) {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("pixelWidth:"), Some(v)) => w = v.parse().unwrap_or(0),
            (Some("pixelHeight:"), Some(v)) => h = v.parse().unwrap_or(0),
            _ => {}
        }
    }
    (w > 0 && h > 0).then_some((w, h))
}

/// `sips -g pixelWidth -g pixelHeight <src>`
pub fn read_size_with_sips(caps: &ToolCaps, source_path: &Path, cancel: &CancelToken) -> Result<(u32, u32)> {
    let mut cmd = caps.command(Tool::Sips)?;
    cmd.args(["-g", "pixelWidth", "-g", "pixelHeight"]).arg(source_path);
    let output = run_checked(&mut cmd, cancel)?;
    parse_sips_size(&output.stdout_text())
        .ok_or_else(|| MediaError::Tool("Failed to parse size from sips output".to_string()))
}
