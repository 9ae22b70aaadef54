// External parser protocol
//
// `<executable> <path>` must print one JSON object shaped like ParseOutput
// (`metadata` plus an optional base64 `thumbnail`) and exit 0.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::config::ExternalParserConfig;
use crate::error::{MediaError, Result};
use crate::jobs::cancel::CancelToken;
use crate::metadata::ParseOutput;
use crate::tools::run_with_deadline;

const EXTERNAL_PARSER_DEADLINE: Duration = Duration::from_secs(30);

pub struct ExternalParser {
    name: String,
    executable: PathBuf,
    extensions: Vec<String>,
}

impl ExternalParser {
    pub fn new(id: &str, executable: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            name: format!("external.{}", id),
            executable: executable.into(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &ExternalParserConfig) -> Self {
        Self::new(&config.id, config.executable.clone(), &config.extensions)
    }
}

impl super::Parser for ExternalParser {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, extension: &str) -> bool {
        self.extensions.iter().any(|e| e == extension)
    }

    fn parse(&self, path: &Path, cancel: &CancelToken) -> Result<ParseOutput> {
        let deadline = cancel.child_with_timeout(EXTERNAL_PARSER_DEADLINE);
        let mut cmd = Command::new(&self.executable);
        cmd.arg(path);

        let output = run_with_deadline(&mut cmd, &deadline)?;
        if !output.success() {
            return Err(MediaError::ExternalParser(format!(
                "{} exited with {}: {}",
                self.name,
                output.status,
                output.stderr_text()
            )));
        }

        let mut parsed: ParseOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            MediaError::ExternalParser(format!("{} returned malformed JSON: {}", self.name, e))
        })?;
        if !parsed.metadata.extra.contains_key("parser") {
            parsed.metadata.annotate("parser", self.name.as_str());
        }
        Ok(parsed)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::parsers::Parser;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn parser(exe: PathBuf) -> ExternalParser {
        ExternalParser::new("test", exe, &[".XYZ".to_string()])
    }

    #[test]
    fn test_valid_output() {
        let dir = TempDir::new().unwrap();
        let exe = script(
            &dir,
            "ok.sh",
            r#"printf '{"metadata":{"format":"XYZ","width":4,"extra":{"source":"script"}},"thumbnail":"iVBORw0KGgo="}'"#,
        );
        let p = parser(exe);
        assert_eq!(p.name(), "external.test");
        assert!(p.can_handle("xyz"));

        let out = p.parse(Path::new("/r/a.xyz"), &CancelToken::new()).unwrap();
        assert_eq!(out.metadata.format, "XYZ");
        assert_eq!(out.metadata.width, 4);
        assert_eq!(out.metadata.extra_str("source"), Some("script"));
        assert_eq!(out.metadata.extra_str("parser"), Some("external.test"));
        assert_eq!(out.thumbnail.as_deref(), Some(&b"\x89PNG\r\n\x1a\n"[..]));
    }

    #[test]
    fn test_nonzero_exit_captures_stderr() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "fail.sh", "echo boom >&2\nexit 3");
        let err = parser(exe).parse(Path::new("/r/a.xyz"), &CancelToken::new()).unwrap_err();
        match err {
            MediaError::ExternalParser(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_json() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "bad.sh", "echo not json");
        let err = parser(exe).parse(Path::new("/r/a.xyz"), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, MediaError::ExternalParser(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_deadline_kills_child() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "slow.sh", "exec sleep 5");
        let cancel = CancelToken::new().child_with_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = parser(exe).parse(Path::new("/r/a.xyz"), &cancel).unwrap_err();
        assert!(matches!(err, MediaError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_deadline_kills_wrapper_script_children() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "wrapper.sh", "sleep 8\necho '{}'");
        let cancel = CancelToken::new().child_with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = parser(exe).parse(Path::new("/r/a.xyz"), &cancel).unwrap_err();
        assert!(matches!(err, MediaError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
