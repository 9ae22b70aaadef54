// External tool resolver and runner
//
// Tools are optional. The engine probes once at startup and hands the
// resulting ToolCaps to every parser, so no PATH lookups happen per task.
// Resolution order per tool:
// 1) Environment variable override (MEDIA_ASSISTANT_FFPROBE_PATH, etc.)
// 2) Sidecar next to the executable (also bin/)
// 3) PATH

use std::collections::HashMap;
use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use crate::error::{MediaError, Result};
use crate::jobs::cancel::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Sips,
    Magick,
    Convert,
    Dcraw,
    Ffprobe,
    Ffmpeg,
}

impl Tool {
    pub const ALL: [Tool; 6] = [
        Tool::Sips,
        Tool::Magick,
        Tool::Convert,
        Tool::Dcraw,
        Tool::Ffprobe,
        Tool::Ffmpeg,
    ];

    pub fn binary_name(self) -> &'static str {
        match self {
            Tool::Sips => "sips",
            Tool::Magick => "magick",
            Tool::Convert => "convert",
            Tool::Dcraw => "dcraw",
            Tool::Ffprobe => "ffprobe",
            Tool::Ffmpeg => "ffmpeg",
        }
    }

    fn env_key(self) -> String {
        format!("MEDIA_ASSISTANT_{}_PATH", self.binary_name().to_uppercase())
    }
}

/// Get the directory containing the current executable
fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

fn resolve_tool(tool: Tool) -> Option<PathBuf> {
    if let Ok(v) = env::var(tool.env_key()) {
        let p = PathBuf::from(&v);
        if p.is_file() {
            return Some(p);
        }
        log::warn!("{} override {} does not exist, ignoring", tool.env_key(), v);
    }

    let mut filename = tool.binary_name().to_string();
    if cfg!(windows) {
        filename.push_str(".exe");
    }

    if let Some(dir) = exe_dir() {
        let candidate = dir.join(&filename);
        if candidate.is_file() {
            return Some(candidate);
        }
        let bin_candidate = dir.join("bin").join(&filename);
        if bin_candidate.is_file() {
            return Some(bin_candidate);
        }
    }

    which::which(tool.binary_name()).ok()
}

/// Snapshot of which external tools exist on this host.
#[derive(Debug, Clone, Default)]
pub struct ToolCaps {
    paths: HashMap<Tool, PathBuf>,
}

impl ToolCaps {
    /// Resolve every known tool once.
    pub fn probe() -> Self {
        let mut paths = HashMap::new();
        for tool in Tool::ALL {
            if let Some(path) = resolve_tool(tool) {
                log::debug!("Found {} at {}", tool.binary_name(), path.display());
                paths.insert(tool, path);
            }
        }
        let caps = Self { paths };
        log::info!(
            "External tools available: [{}]",
            caps.available()
                .iter()
                .map(|t| t.binary_name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        caps
    }

    /// No tools at all. Tool-backed parsers degrade to annotations.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: Tool, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(tool, path.into());
        self
    }

    pub fn path(&self, tool: Tool) -> Option<&Path> {
        self.paths.get(&tool).map(|p| p.as_path())
    }

    pub fn has(&self, tool: Tool) -> bool {
        self.paths.contains_key(&tool)
    }

    pub fn available(&self) -> Vec<Tool> {
        Tool::ALL.into_iter().filter(|t| self.has(*t)).collect()
    }

    /// Command for `tool`, or a Tool error naming what is missing.
    pub fn command(&self, tool: Tool) -> Result<Command> {
        self.path(tool)
            .map(Command::new)
            .ok_or_else(|| MediaError::Tool(format!("{} not found", tool.binary_name())))
    }
}

/// Captured output of a finished tool run.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Run a command to completion, killing it when `cancel` is cancelled or its
/// deadline passes. Output is drained on reader threads so a chatty child
/// cannot block on a full pipe.
///
/// On unix the child leads its own process group and the whole group is
/// killed, so wrapper scripts cannot leave a grandchild holding the pipes.
pub fn run_with_deadline(cmd: &mut Command, cancel: &CancelToken) -> Result<ToolOutput> {
    cancel.check()?;

    let program = cmd.get_program().to_string_lossy().to_string();
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| MediaError::Tool(format!("Failed to run {}: {}", program, e)))?;

    let stdout_reader = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            buf
        })
    });

    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None => {
                if let Err(e) = cancel.check() {
                    kill_tree(&mut child);
                    let _ = child.wait();
                    // Readers are left to finish on their own once every
                    // holder of the pipes is gone
                    drop(stdout_reader);
                    drop(stderr_reader);
                    log::debug!("Killed {} ({})", program, e);
                    return Err(e);
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    };

    // Stragglers the tool backgrounded would keep the pipes open
    kill_group(&child);

    let stdout = join_reader(stdout_reader, &program)?;
    let stderr = join_reader(stderr_reader, &program)?;

    Ok(ToolOutput { status, stdout, stderr })
}

fn kill_tree(child: &mut Child) {
    kill_group(child);
    let _ = child.kill();
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: plain syscall on a group we created; ESRCH is ignored
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

fn join_reader(handle: Option<thread::JoinHandle<Vec<u8>>>, program: &str) -> Result<Vec<u8>> {
    match handle {
        Some(h) => h
            .join()
            .map_err(|_| MediaError::Tool(format!("Output reader for {} panicked", program))),
        None => Ok(Vec::new()),
    }
}

/// Run a tool and require a zero exit status.
pub fn run_checked(cmd: &mut Command, cancel: &CancelToken) -> Result<ToolOutput> {
    let program = cmd.get_program().to_string_lossy().to_string();
    let output = run_with_deadline(cmd, cancel)?;
    if !output.success() {
        return Err(MediaError::Tool(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            output.stderr_text()
        )));
    }
    Ok(output)
}
