// Camera RAW parser
//
// Dimensions: sips, then dcraw -i -v.
// Thumbnail: sips render, then the embedded preview via dcraw -e.

use std::path::Path;
use std::sync::Arc;

use regex::Regex;

use crate::constants::RAW_EXTENSIONS;
use crate::error::{MediaError, Result};
use crate::jobs::cancel::CancelToken;
use crate::metadata::{extension_of, MediaMetadata, ParseOutput};
use crate::preview::{thumb, ThumbOptions};
use crate::tools::{run_checked, Tool, ToolCaps};

use super::Parser;

pub struct RawParser {
    caps: Arc<ToolCaps>,
    thumbs: ThumbOptions,
}

impl RawParser {
    pub fn new(caps: Arc<ToolCaps>, thumbs: ThumbOptions) -> Self {
        Self { caps, thumbs }
    }

    fn read_size(&self, path: &Path, cancel: &CancelToken) -> Result<(u32, u32)> {
        let mut last_err = MediaError::Tool("no RAW size tool available (sips, dcraw)".to_string());

        if self.caps.has(Tool::Sips) {
            match thumb::read_size_with_sips(&self.caps, path, cancel) {
                Ok(size) => return Ok(size),
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => last_err = e,
            }
        }
        if self.caps.has(Tool::Dcraw) {
            match read_size_with_dcraw(&self.caps, path, cancel) {
                Ok(size) => return Ok(size),
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn render_thumbnail(&self, path: &Path, cancel: &CancelToken) -> Result<Vec<u8>> {
        let mut last_err = MediaError::Tool("no RAW preview tool available (sips, dcraw)".to_string());

        if self.caps.has(Tool::Sips) {
            match thumb::render_with_sips(&self.caps, path, &self.thumbs, cancel) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => last_err = e,
            }
        }
        if self.caps.has(Tool::Dcraw) {
            match thumb::extract_dcraw_preview(&self.caps, path, cancel) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

impl Parser for RawParser {
    fn name(&self) -> &str {
        "external.raw"
    }

    fn can_handle(&self, extension: &str) -> bool {
        RAW_EXTENSIONS.contains(&extension)
    }

    fn parse(&self, path: &Path, cancel: &CancelToken) -> Result<ParseOutput> {
        let mut meta = MediaMetadata::with_format(extension_of(path).to_uppercase());
        meta.annotate("parser", self.name());

        match self.read_size(path, cancel) {
            Ok((w, h)) => {
                meta.width = w;
                meta.height = h;
            }
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => meta.annotate("size_error", e.to_string()),
        }

        let thumbnail = match self.render_thumbnail(path, cancel) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => {
                meta.annotate("thumbnail_error", e.to_string());
                None
            }
        };

        Ok(ParseOutput { metadata: meta, thumbnail })
    }
}

/// Parse `Image size:  6024 x 4024` from `dcraw -i -v`
pub fn parse_dcraw_size(out: &str) -> Option<(u32, u32)> {
    let re = Regex::new(r"(?m)^Image size:\s*(\d+)\s*x\s*(\d+)").ok()?;
    let caps = re.captures(out)?;
    let w = caps.get(1)?.as_str().parse().ok()?;
    let h = caps.get(2)?.as_str().parse().ok()?;
    (w > 0 && h > 0).then_some((w, h))
}

fn read_size_with_dcraw(caps: &ToolCaps, path: &Path, cancel: &CancelToken) -> Result<(u32, u32)> {
    let mut cmd = caps.command(Tool::Dcraw)?;
    cmd.args(["-i", "-v"]).arg(path);
    let output = run_checked(&mut cmd, cancel)?;
    parse_dcraw_size(&output.stdout_text())
        .ok_or_else(|| MediaError::Tool("Failed to parse size from dcraw output".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dcraw_size() {
        let out = "Filename: a.cr2\nCamera: Canon EOS R5\nImage size:  8192 x 5464\nOutput size: 8192 x 5464\n";
        assert_eq!(parse_dcraw_size(out), Some((8192, 5464)));
        assert_eq!(parse_dcraw_size("Camera: unknown\n"), None);
        assert_eq!(parse_dcraw_size("Image size: 0 x 10\n"), None);
    }

    #[test]
    fn test_no_tools_annotates_both() {
        let parser = RawParser::new(Arc::new(ToolCaps::none()), ThumbOptions::default());
        let out = parser.parse(Path::new("/r/IMG_0001.CR2"), &CancelToken::new()).unwrap();
        assert_eq!(out.metadata.format, "CR2");
        assert!(out.metadata.extra_str("size_error").unwrap().contains("no RAW size tool"));
        assert!(out.metadata.extra_str("thumbnail_error").is_some());
        assert!(out.thumbnail.is_none());
    }

    #[test]
    fn test_handles() {
        let parser = RawParser::new(Arc::new(ToolCaps::none()), ThumbOptions::default());
        for ext in ["cr2", "cr3", "nef", "arw", "dng", "raf", "orf", "rw2", "pef", "srw", "3fr"] {
            assert!(parser.can_handle(ext));
        }
        assert!(!parser.can_handle("jpg"));
    }
}
