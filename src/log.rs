//! Job transcript logging.
//!
//! A `JobLog` is created once per invocation and passed explicitly to every
//! phase. Each line goes to `tracing` and is also appended to the job
//! transcript file (`LEVEL - message`, subprocess output verbatim) that the
//! batch layer collects alongside the exit code.
use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Marker that external programs print when they exhaust memory.
pub const SUBPROCESS_MEMORY_MARKER: &str = "MemoryError";

const DIVIDER_WIDTH: usize = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    fn prefix(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        }
    }
}

pub struct JobLog {
    path: Option<PathBuf>,
    file: Mutex<Option<BufWriter<File>>>,
    captured: Option<Mutex<Vec<String>>>,
    memory_error_seen: AtomicBool,
}

impl JobLog {
    /// Log to `tracing` only.
    pub fn new() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
            captured: None,
            memory_error_seen: AtomicBool::new(false),
        }
    }

    /// Log to `tracing` and append to the transcript at `path`.
    pub fn with_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open job log {}", path.display()))?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Mutex::new(Some(BufWriter::new(file))),
            captured: None,
            memory_error_seen: AtomicBool::new(false),
        })
    }

    /// Keep transcript lines in memory so tests can inspect them.
    #[cfg(test)]
    pub fn capturing() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
            captured: Some(Mutex::new(Vec::new())),
            memory_error_seen: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(Level::Info, message.as_ref());
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.emit(Level::Warning, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(Level::Error, message.as_ref());
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        tracing::debug!("{}", message.as_ref());
    }

    /// Emit a line verbatim, as produced by a subprocess.
    pub fn echo(&self, line: &str) {
        if line.contains(SUBPROCESS_MEMORY_MARKER) {
            self.memory_error_seen.store(true, Ordering::SeqCst);
        }
        tracing::info!(target: "caldp::subprocess", "{line}");
        self.append(line);
    }

    /// Emit a divider of `-` with `name` centered in it.
    pub fn divider(&self, level: Level, name: &str) {
        self.emit(level, &divider_line(name, '-', DIVIDER_WIDTH));
    }

    /// Whether any echoed subprocess line reported a memory error.
    pub fn memory_error_seen(&self) -> bool {
        self.memory_error_seen.load(Ordering::SeqCst)
    }

    /// Forget memory errors echoed by an earlier dataset's programs.
    pub fn reset_memory_error(&self) {
        self.memory_error_seen.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn captured_lines(&self) -> Vec<String> {
        self.captured
            .as_ref()
            .and_then(|lines| lines.lock().ok().map(|lines| lines.clone()))
            .unwrap_or_default()
    }

    /// Flush and release the transcript file.
    pub fn close(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(mut writer) = guard.take() {
                let _ = writer.flush();
            }
        }
    }

    fn emit(&self, level: Level, message: &str) {
        match level {
            Level::Info => tracing::info!("{message}"),
            Level::Warning => tracing::warn!("{message}"),
            Level::Error => tracing::error!("{message}"),
        }
        self.append(&format!("{} - {message}", level.prefix()));
    }

    fn append(&self, line: &str) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(writer) = guard.as_mut() {
                let _ = writeln!(writer, "{line}");
                let _ = writer.flush();
            }
        }
        if let Some(captured) = &self.captured {
            if let Ok(mut lines) = captured.lock() {
                lines.push(line.to_string());
            }
        }
    }
}

impl Default for JobLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobLog {
    fn drop(&mut self) {
        self.close();
    }
}

fn divider_line(name: &str, dash: char, width: usize) -> String {
    if name.is_empty() {
        return dash.to_string().repeat(width);
    }
    let side = width.saturating_sub(name.len() + 2) / 2;
    let dashes = dash.to_string().repeat(side);
    format!("{dashes} {name} {dashes}")
}
