// Metadata extraction module

pub mod exif;
pub mod ffprobe;

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What a parser learned about one file.
///
/// `format` is mandatory for an indexed asset; everything else is best-effort.
/// Soft failures are recorded in `extra` under `*_error` keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    #[serde(default, alias = "Width")]
    pub width: u32,
    #[serde(default, alias = "Height")]
    pub height: u32,
    /// Seconds
    #[serde(default, alias = "Duration")]
    pub duration: f64,
    #[serde(default, alias = "Format")]
    pub format: String,
    #[serde(default, alias = "Codec", skip_serializing_if = "String::is_empty")]
    pub codec: String,
    #[serde(default, alias = "Extra")]
    pub extra: Map<String, Value>,
}

impl MediaMetadata {
    pub fn with_format(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            ..Default::default()
        }
    }

    pub fn annotate(&mut self, key: &str, value: impl Into<Value>) {
        self.extra.insert(key.to_string(), value.into());
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    /// Perceptual hash of the image content, if the parser computed one
    pub fn phash(&self) -> Option<u64> {
        self.extra_str("phash").and_then(crate::hash::dhash_from_hex)
    }
}

/// Parser result: metadata plus optional thumbnail bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseOutput {
    #[serde(alias = "Metadata")]
    pub metadata: MediaMetadata,
    #[serde(default, alias = "Thumbnail", with = "thumbnail_base64")]
    pub thumbnail: Option<Vec<u8>>,
}

impl ParseOutput {
    pub fn new(metadata: MediaMetadata) -> Self {
        Self { metadata, thumbnail: None }
    }
}

/// Thumbnails travel as base64 strings in JSON.
mod thumbnail_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            Some(text) if !text.is_empty() => STANDARD
                .decode(text.trim())
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

/// Lowercase extension without the dot, empty when there is none
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

/// Sniff a MIME type for stored thumbnail bytes
pub fn thumbnail_mime(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::Gif) => "image/gif",
        Ok(image::ImageFormat::WebP) => "image/webp",
        Ok(image::ImageFormat::Bmp) => "image/bmp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of(Path::new("/r/A.JPG")), "jpg");
        assert_eq!(extension_of(Path::new("/r/archive.tar.gz")), "gz");
        assert_eq!(extension_of(Path::new("/r/README")), "");
    }

    #[test]
    fn test_parse_output_json_shape() {
        let json = r#"{
            "metadata": {"width": 10, "height": 20, "format": "XYZ", "extra": {"k": "v"}},
            "thumbnail": "AQID"
        }"#;
        let out: ParseOutput = serde_json::from_str(json).unwrap();
        assert_eq!(out.metadata.width, 10);
        assert_eq!(out.metadata.format, "XYZ");
        assert_eq!(out.metadata.extra_str("k"), Some("v"));
        assert_eq!(out.thumbnail, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_parse_output_accepts_capitalized_keys() {
        let json = r#"{"Metadata": {"Width": 5, "Format": "ABC"}, "Thumbnail": null}"#;
        let out: ParseOutput = serde_json::from_str(json).unwrap();
        assert_eq!(out.metadata.width, 5);
        assert_eq!(out.metadata.format, "ABC");
        assert!(out.thumbnail.is_none());
    }

    #[test]
    fn test_phash_from_extra() {
        let mut meta = MediaMetadata::with_format("JPEG");
        meta.annotate("phash", "00000000000000ff");
        assert_eq!(meta.phash(), Some(0xff));
    }

    #[test]
    fn test_thumbnail_mime() {
        assert_eq!(thumbnail_mime(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]), "image/jpeg");
        assert_eq!(thumbnail_mime(b"not an image"), "application/octet-stream");
    }
}
