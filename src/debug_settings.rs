//! Optional debug log file
//!
//! Logs go to `<data_dir>/ClaudeUsage/claude-usage-debug.log` (or the temp
//! dir when there is no data dir), but only while file logging is switched
//! on. The writer is installed unconditionally and drops output otherwise.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracing_subscriber::fmt::MakeWriter;

pub const DEBUG_LOG_ENV: &str = "CLAUDE_USAGE_DEBUG_LOG";

const LOG_DIR_NAME: &str = "ClaudeUsage";
const LOG_FILE_NAME: &str = "claude-usage-debug.log";

static FILE_LOGGING_ENABLED: AtomicBool = AtomicBool::new(false);

static DEBUG_LOG_FILE: Lazy<Option<Arc<Mutex<std::fs::File>>>> = Lazy::new(|| {
    open_debug_log_file()
        .or_else(|_| open_fallback_log_file())
        .ok()
        .map(|file| Arc::new(Mutex::new(file)))
});

pub fn set_file_logging(enabled: bool) {
    FILE_LOGGING_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn file_logging_enabled() -> bool {
    FILE_LOGGING_ENABLED.load(Ordering::Relaxed)
}

/// `1`, `true`, `yes` and `on` (any case) enable file logging
pub fn parse_toggle(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn file_logging_from_env() -> bool {
    std::env::var(DEBUG_LOG_ENV)
        .map(|value| parse_toggle(&value))
        .unwrap_or(false)
}

pub fn debug_log_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join(LOG_DIR_NAME).join(LOG_FILE_NAME))
}

pub fn file_writer() -> DebugFileWriter {
    DebugFileWriter {
        file: DEBUG_LOG_FILE.clone(),
    }
}

fn open_debug_log_file() -> io::Result<std::fs::File> {
    let log_path = debug_log_path()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Missing data directory"))?;
    if let Some(log_dir) = log_path.parent() {
        std::fs::create_dir_all(log_dir)?;
    }
    OpenOptions::new().create(true).append(true).open(log_path)
}

fn open_fallback_log_file() -> io::Result<std::fs::File> {
    let path = std::env::temp_dir().join(LOG_FILE_NAME);
    OpenOptions::new().create(true).append(true).open(path)
}

#[derive(Clone)]
pub struct DebugFileWriter {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl<'a> MakeWriter<'a> for DebugFileWriter {
    type Writer = DebugFileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        DebugFileWriterGuard {
            file: self.file.clone(),
        }
    }
}

pub struct DebugFileWriterGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl Write for DebugFileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !file_logging_enabled() {
            return Ok(buf.len());
        }

        match self.file.as_ref().map(|file| file.lock()) {
            Some(Ok(mut file)) => file.write(buf),
            _ => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if !file_logging_enabled() {
            return Ok(());
        }
        match self.file.as_ref().map(|file| file.lock()) {
            Some(Ok(mut file)) => file.flush(),
            _ => Ok(()),
        }
    }
}
