// Photoshop document parser
//
// The composite is rendered by the first available of sips, magick and the
// legacy convert. Canvas size is read from the PSD header directly, so it
// does not depend on any tool.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::constants::PSD_EXTENSIONS;
use crate::error::{MediaError, Result};
use crate::jobs::cancel::CancelToken;
use crate::metadata::{extension_of, MediaMetadata, ParseOutput};
use crate::preview::{thumb, ThumbOptions};
use crate::tools::{Tool, ToolCaps};

use super::Parser;

const PSD_SIGNATURE: &[u8; 4] = b"8BPS";

pub struct PsdParser {
    caps: Arc<ToolCaps>,
    thumbs: ThumbOptions,
}

impl PsdParser {
    pub fn new(caps: Arc<ToolCaps>, thumbs: ThumbOptions) -> Self {
        Self { caps, thumbs }
    }

    fn render_thumbnail(&self, path: &Path, cancel: &CancelToken) -> Result<Vec<u8>> {
        let mut last_err =
            MediaError::Tool("no PSD render tool available (sips, magick, convert)".to_string());

        if self.caps.has(Tool::Sips) {
            match thumb::render_with_sips(&self.caps, path, &self.thumbs, cancel) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => last_err = e,
            }
        }
        for tool in [Tool::Magick, Tool::Convert] {
            if !self.caps.has(tool) {
                continue;
            }
            match thumb::render_with_magick(&self.caps, tool, path, &self.thumbs, cancel) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

impl Parser for PsdParser {
    fn name(&self) -> &str {
        "external.psd"
    }

    fn can_handle(&self, extension: &str) -> bool {
        PSD_EXTENSIONS.contains(&extension)
    }

    fn parse(&self, path: &Path, cancel: &CancelToken) -> Result<ParseOutput> {
        let mut meta = MediaMetadata::with_format(extension_of(path).to_uppercase());
        meta.annotate("parser", self.name());

        match read_psd_header(path) {
            Ok(header) => {
                meta.width = header.width;
                meta.height = header.height;
                meta.annotate("channels", header.channels);
                meta.annotate("bit_depth", header.depth);
            }
            Err(e) => meta.annotate("size_error", e.to_string()),
        }

        cancel.check()?;

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsdHeader {
    pub width: u32,
    pub height: u32,
    pub channels: u16,
    pub depth: u16,
}

/// Fixed 26-byte header: signature, version (1 = PSD, 2 = PSB), 6 reserved,
/// channels, height, width, depth, color mode. All big-endian.
pub fn parse_psd_header(buf: &[u8]) -> Option<PsdHeader> {
    if buf.len() < 26 || &buf[0..4] != PSD_SIGNATURE {
        return None;
    }
    let be16 = |at: usize| u16::from_be_bytes([buf[at], buf[at + 1]]);
    let be32 = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);

    let version = be16(4);
    if version != 1 && version != 2 {
        return None;
    }
    Some(PsdHeader {
        channels: be16(12),
        height: be32(14),
        width: be32(18),
        depth: be16(22),
    })
}

fn read_psd_header(path: &Path) -> Result<PsdHeader> {
    let mut buf = [0u8; 26];
    File::open(path)?.read_exact(&mut buf)?;
    parse_psd_header(&buf).ok_or_else(|| MediaError::Parse("Not a PSD/PSB header".to_string()))
}
