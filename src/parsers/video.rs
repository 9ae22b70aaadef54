// Video parser: ffprobe for stream info, ffmpeg for a poster frame.
//
// Missing tools are soft failures. The asset still indexes with the format
// taken from the extension and `probe_error` / `thumbnail_error` annotations.

use std::path::Path;
use std::sync::Arc;

use crate::constants::VIDEO_EXTENSIONS;
use crate::error::Result;
use crate::jobs::cancel::CancelToken;
use crate::metadata::{extension_of, ffprobe, MediaMetadata, ParseOutput};
use crate::preview::{thumb, ThumbOptions};
use crate::tools::ToolCaps;

use super::Parser;

pub struct VideoParser {
    caps: Arc<ToolCaps>,
    thumbs: ThumbOptions,
}

impl VideoParser {
    pub fn new(caps: Arc<ToolCaps>, thumbs: ThumbOptions) -> Self {
        Self { caps, thumbs }
    }
}

impl Parser for VideoParser {
    fn name(&self) -> &str {
        "native.video"
    }

    fn can_handle(&self, extension: &str) -> bool {
        VIDEO_EXTENSIONS.contains(&extension)
    }

    fn parse(&self, path: &Path, cancel: &CancelToken) -> Result<ParseOutput> {
        let mut meta = MediaMetadata::with_format(extension_of(path).to_uppercase());
        meta.annotate("parser", self.name());

        match ffprobe::probe(&self.caps, path, cancel) {
            Ok(probe) => {
                meta.width = probe.width;
                meta.height = probe.height;
                meta.duration = probe.duration;
                meta.codec = probe.codec;
                if let Some(fps) = probe.fps {
                    meta.annotate("fps", fps);
                }
                if let Some(bitrate) = probe.bitrate {
                    meta.annotate("bitrate", bitrate);
                }
                if let Some(container) = probe.container {
                    meta.annotate("container", container);
                }
            }
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => {
                log::warn!("Probe failed for {}: {}", path.display(), e);
                meta.annotate("probe_error", e.to_string());
            }
        }

        let thumbnail = match thumb::capture_video_frame(&self.caps, path, &self.thumbs, cancel) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => {
                log::warn!("Frame grab failed for {}: {}", path.display(), e);
                meta.annotate("thumbnail_error", e.to_string());
                None
            }
        };

        Ok(ParseOutput { metadata: meta, thumbnail })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tools_are_soft_failures() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"not really a video").unwrap();

        let parser = VideoParser::new(Arc::new(ToolCaps::none()), ThumbOptions::default());
        let out = parser.parse(&path, &CancelToken::new()).unwrap();

        assert_eq!(out.metadata.format, "MP4");
        assert!(out.metadata.extra_str("probe_error").unwrap().contains("ffprobe"));
        assert!(out.metadata.extra_str("thumbnail_error").unwrap().contains("ffmpeg"));
        assert!(out.thumbnail.is_none());
    }

    #[test]
    fn test_handles() {
        let parser = VideoParser::new(Arc::new(ToolCaps::none()), ThumbOptions::default());
        for ext in ["mp4", "mov", "avi", "mkv", "webm", "flv"] {
            assert!(parser.can_handle(ext));
        }
        assert!(!parser.can_handle("jpg"));
    }
}
