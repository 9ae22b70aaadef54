// Catch-all parser, registered last at priority 0

use std::path::Path;

use crate::constants::FALLBACK_PARSER_NAME;
use crate::error::Result;
use crate::jobs::cancel::CancelToken;
use crate::metadata::{extension_of, MediaMetadata, ParseOutput};

use super::Parser;

/// Accepts every extension and records a placeholder with the extension
/// as format. Files without an extension get "UNKNOWN".
pub struct FallbackParser;

impl Parser for FallbackParser {
    fn name(&self) -> &str {
        FALLBACK_PARSER_NAME
    }

    fn can_handle(&self, _extension: &str) -> bool {
        true
    }

    fn parse(&self, path: &Path, _cancel: &CancelToken) -> Result<ParseOutput> {
        let ext = extension_of(path);
        let format = if ext.is_empty() { "UNKNOWN".to_string() } else { ext.to_uppercase() };

        let mut meta = MediaMetadata::with_format(format);
        meta.annotate("parser", "dummy");
        meta.annotate("note", "placeholder metadata, no parser for this format");
        Ok(ParseOutput::new(meta))
    }
}
