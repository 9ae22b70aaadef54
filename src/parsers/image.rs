// Native still-image parser

use std::path::Path;

use ::image::{ImageFormat, ImageReader};

use crate::constants::IMAGE_EXTENSIONS;
use crate::error::{MediaError, Result};
use crate::hash::{dhash, dhash_to_hex};
use crate::jobs::cancel::CancelToken;
use crate::metadata::{exif, MediaMetadata, ParseOutput};
use crate::preview::{encode_thumbnail, ThumbOptions};

use super::Parser;

pub struct ImageParser {
    thumbs: ThumbOptions,
}

impl ImageParser {
    pub fn new(thumbs: ThumbOptions) -> Self {
        Self { thumbs }
    }
}

impl Parser for ImageParser {
    fn name(&self) -> &str {
        "native.image"
    }

    fn can_handle(&self, extension: &str) -> bool {
        IMAGE_EXTENSIONS.contains(&extension)
    }

    fn parse(&self, path: &Path, cancel: &CancelToken) -> Result<ParseOutput> {
        let reader = ImageReader::open(path)?.with_guessed_format()?;
        let format = reader
            .format()
            .ok_or_else(|| MediaError::Parse(format!("Unrecognized image data: {}", path.display())))?;

        // An unreadable header means a corrupt file, which is permanent
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| MediaError::Parse(e.to_string()))?;
        cancel.check()?;

        let mut meta = MediaMetadata::with_format(format_name(format));
        meta.width = width;
        meta.height = height;
        meta.annotate("parser", self.name());

        if let Some(exif) = exif::extract(path) {
            exif.merge_into(&mut meta.extra);
        }

        // Pixel data can still be damaged past the header
        let img = match ImageReader::open(path)?.with_guessed_format()?.decode() {
            Ok(img) => img,
            Err(e) => {
                log::warn!("Decode failed for {}: {}", path.display(), e);
                meta.annotate("thumbnail_error", e.to_string());
                return Ok(ParseOutput { metadata: meta, thumbnail: None });
            }
        };
        cancel.check()?;

        meta.annotate("phash", dhash_to_hex(dhash(&img)));

        let thumbnail = match encode_thumbnail(&img, format, &self.thumbs) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::warn!("Thumbnail encode failed for {}: {}", path.display(), e);
                meta.annotate("thumbnail_error", e.to_string());
                None
            }
        };

        Ok(ParseOutput { metadata: meta, thumbnail })
    }
}

fn format_name(format: ImageFormat) -> String {
    match format {
        ImageFormat::Jpeg => "JPEG".to_string(),
        ImageFormat::Png => "PNG".to_string(),
        ImageFormat::Gif => "GIF".to_string(),
        ImageFormat::WebP => "WEBP".to_string(),
        ImageFormat::Bmp => "BMP".to_string(),
        other => format!("{:?}", other).to_uppercase(),
    }
}
