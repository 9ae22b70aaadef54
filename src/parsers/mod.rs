// Parser registry
//
// Priority-ordered dispatch from a file extension to the parser that owns it.
// The first parser that accepts an extension is authoritative; there is no
// retry across parsers.

pub mod external;
pub mod fallback;
pub mod image;
pub mod psd;
pub mod raw;
pub mod video;

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ExternalParserConfig;
use crate::constants::{PRIORITY_EXTERNAL_TOOL, PRIORITY_FALLBACK, PRIORITY_NATIVE};
use crate::error::{MediaError, Result};
use crate::jobs::cancel::CancelToken;
use crate::metadata::ParseOutput;
use crate::preview::ThumbOptions;
use crate::tools::ToolCaps;

/// A capability that turns one file into metadata plus an optional thumbnail.
///
/// Parsers own nothing persistent. They must check `cancel` at tool
/// boundaries and return `Cancelled`/`DeadlineExceeded` when it fires.
pub trait Parser: Send + Sync {
    fn name(&self) -> &str;

    /// `extension` is lowercase without the dot
    fn can_handle(&self, extension: &str) -> bool;

    fn parse(&self, path: &Path, cancel: &CancelToken) -> Result<ParseOutput>;
}

struct Entry {
    parser: Arc<dyn Parser>,
    priority: i32,
}

#[derive(Default)]
pub struct ParserRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a parser by name. Re-registering moves the parser to
    /// the end of its priority band.
    pub fn register(&self, parser: Arc<dyn Parser>, priority: i32) {
        let mut entries = self.entries.write();
        entries.retain(|e| e.parser.name() != parser.name());
        log::debug!("Registered parser {} (priority {})", parser.name(), priority);
        entries.push(Entry { parser, priority });
        // Stable sort keeps insertion order among equal priorities
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.parser.name() != name);
        entries.len() != before
    }

    /// The parser that would handle `extension`
    pub fn parser_for(&self, extension: &str) -> Option<Arc<dyn Parser>> {
        let ext = extension.trim_start_matches('.').to_lowercase();
        self.entries
            .read()
            .iter()
            .find(|e| e.parser.can_handle(&ext))
            .map(|e| Arc::clone(&e.parser))
    }

    /// Parse `path` with the first parser accepting `extension`.
    /// The lock is released before the parser runs.
    pub fn process(&self, path: &Path, extension: &str, cancel: &CancelToken) -> Result<ParseOutput> {
        let parser = self
            .parser_for(extension)
            .ok_or_else(|| MediaError::NoParser(extension.to_string()))?;
        cancel.check()?;
        log::debug!("Parsing {} with {}", path.display(), parser.name());
        parser.parse(path, cancel)
    }

    /// (name, priority) in dispatch order
    pub fn names(&self) -> Vec<(String, i32)> {
        self.entries
            .read()
            .iter()
            .map(|e| (e.parser.name().to_string(), e.priority))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// The bootstrap registry: native image/video, tool-backed RAW/PSD,
/// configured external parsers and the catch-all fallback.
pub fn default_registry(caps: Arc<ToolCaps>, externals: &[ExternalParserConfig]) -> ParserRegistry {
    let thumbs = ThumbOptions::default();
    let registry = ParserRegistry::new();

    registry.register(Arc::new(image::ImageParser::new(thumbs.clone())), PRIORITY_NATIVE);
    registry.register(
        Arc::new(video::VideoParser::new(Arc::clone(&caps), thumbs.clone())),
        PRIORITY_NATIVE,
    );
    registry.register(
        Arc::new(raw::RawParser::new(Arc::clone(&caps), thumbs.clone())),
        PRIORITY_EXTERNAL_TOOL,
    );
    registry.register(
        Arc::new(psd::PsdParser::new(Arc::clone(&caps), thumbs)),
        PRIORITY_EXTERNAL_TOOL,
    );

    for config in externals {
        registry.register(Arc::new(external::ExternalParser::from_config(config)), config.priority);
    }

    registry.register(Arc::new(fallback::FallbackParser), PRIORITY_FALLBACK);

    log::info!(
        "Parser registry ready: {}",
        registry
            .names()
            .iter()
            .map(|(name, prio)| format!("{}({})", name, prio))
            .collect::<Vec<_>>()
            .join(", ")
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MediaMetadata;
    use std::path::PathBuf;

    struct Named {
        name: &'static str,
        exts: &'static [&'static str],
    }

    impl Parser for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn can_handle(&self, extension: &str) -> bool {
            self.exts.contains(&extension)
        }

        fn parse(&self, _path: &Path, _cancel: &CancelToken) -> Result<ParseOutput> {
            let mut meta = MediaMetadata::with_format("TEST");
            meta.annotate("parser", self.name);
            Ok(ParseOutput::new(meta))
        }
    }

    fn named(name: &'static str, exts: &'static [&'static str]) -> Arc<dyn Parser> {
        Arc::new(Named { name, exts })
    }

    fn parsed_by(registry: &ParserRegistry, ext: &str) -> String {
        let out = registry
            .process(&PathBuf::from("/r/file"), ext, &CancelToken::new())
            .unwrap();
        out.metadata.extra_str("parser").unwrap().to_string()
    }

    #[test]
    fn test_priority_order_and_ties() {
        let registry = ParserRegistry::new();
        registry.register(named("low", &["jpg"]), 1);
        registry.register(named("first", &["jpg"]), 10);
        registry.register(named("second", &["jpg"]), 10);

        assert_eq!(parsed_by(&registry, "jpg"), "first");
        let names: Vec<String> = registry.names().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["first", "second", "low"]);
    }

    #[test]
    fn test_register_upserts_by_name() {
        let registry = ParserRegistry::new();
        registry.register(named("a", &["jpg"]), 10);
        registry.register(named("b", &["jpg"]), 5);
        registry.register(named("a", &["png"]), 1);

        assert_eq!(registry.len(), 2);
        assert_eq!(parsed_by(&registry, "jpg"), "b");
        assert_eq!(parsed_by(&registry, "png"), "a");
    }

    #[test]
    fn test_no_parser() {
        let registry = ParserRegistry::new();
        registry.register(named("a", &["jpg"]), 10);
        let err = registry
            .process(Path::new("/r/x.xyz"), "xyz", &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, MediaError::NoParser(ext) if ext == "xyz"));
        assert!(registry.unregister("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let registry = ParserRegistry::new();
        registry.register(named("x", &["mp4"]), 3);
        registry.register(named("y", &["mp4"]), 3);
        for _ in 0..20 {
            assert_eq!(parsed_by(&registry, "mp4"), "x");
        }
    }

    #[test]
    fn test_cancelled_before_dispatch() {
        let registry = ParserRegistry::new();
        registry.register(named("a", &["jpg"]), 10);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = registry.process(Path::new("/r/a.jpg"), "jpg", &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_default_registry_routes_extensions() {
        let registry = default_registry(Arc::new(ToolCaps::none()), &[]);
        let route = |ext: &str| registry.parser_for(ext).unwrap().name().to_string();
        assert_eq!(route("jpg"), "native.image");
        assert_eq!(route("JPEG"), "native.image");
        assert_eq!(route("mov"), "native.video");
        assert_eq!(route("cr2"), "external.raw");
        assert_eq!(route("psd"), "external.psd");
        assert_eq!(route("xyz"), "dummy.fallback");
    }

    #[test]
    fn test_concurrent_register_and_process() {
        let registry = Arc::new(ParserRegistry::new());
        registry.register(named("base", &["jpg"]), 0);

        std::thread::scope(|s| {
            let r = Arc::clone(&registry);
            s.spawn(move || {
                for i in 0..100 {
                    r.register(named("churn", &["png"]), i);
                }
            });
            for _ in 0..4 {
                let r = Arc::clone(&registry);
                s.spawn(move || {
                    for _ in 0..100 {
                        assert_eq!(parsed_by(&r, "jpg"), "base");
                    }
                });
            }
        });
        assert_eq!(registry.len(), 2);
    }
}
