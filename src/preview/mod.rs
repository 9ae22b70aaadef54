// Preview module
//
// Thumbnails are returned as bytes and stored by the asset store:
// - Decoded images are resized in-process with the image crate
// - Video frames and tool-rendered stills come from preview::thumb

pub mod thumb;

use std::io::Cursor;

use image::{DynamicImage, ImageFormat};

use crate::constants::THUMB_MAX_EDGE;
use crate::error::Result;

/// Options for thumbnail generation.
#[derive(Debug, Clone)]
pub struct ThumbOptions {
    /// Longest edge in pixels
    pub max_edge: u32,
    pub video_seek: String,
}

impl Default for ThumbOptions {
    fn default() -> Self {
        Self {
            max_edge: THUMB_MAX_EDGE,
            video_seek: crate::constants::VIDEO_THUMB_SEEK_SECS.to_string(),
        }
    }
}

/// Resize into a max_edge box and encode. JPEG sources stay JPEG; everything
/// else becomes PNG so transparency survives.
pub fn encode_thumbnail(img: &DynamicImage, source: ImageFormat, options: &ThumbOptions) -> Result<Vec<u8>> {
    let thumb = if img.width() > options.max_edge || img.height() > options.max_edge {
        img.thumbnail(options.max_edge, options.max_edge)
    } else {
        img.clone()
    };

    let mut buf = Cursor::new(Vec::new());
    if source == ImageFormat::Jpeg {
        // JPEG has no alpha channel
        DynamicImage::ImageRgb8(thumb.to_rgb8()).write_to(&mut buf, ImageFormat::Jpeg)?;
    } else {
        thumb.write_to(&mut buf, ImageFormat::Png)?;
    }
    Ok(buf.into_inner())
}
