//! Diagnostic Log: an append-only, size-rotated log used by every
//! component, and the source of the copy-on-crash diagnostic report.
//!
//! Implemented directly against the exact on-disk format
//! (`[ISO8601] [LEVEL] [TAG] message`, 1 MiB rotation with an
//! ISO-8601-suffixed rename) since that format is fully specified and
//! narrower than a generic rolling appender's defaults.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use nextalk_core::ipc::ModelStatus;
use nextalk_core::model::{self, ModelAsset};

const ROTATE_AT_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }
}

pub struct DiagnosticLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DiagnosticLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn at_default_location() -> Self {
        Self::new(default_log_path())
    }

    /// Append one line, rotating the file first if it has grown past
    /// [`ROTATE_AT_BYTES`].
    pub fn log(&self, level: Level, tag: &str, message: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.maybe_rotate() {
            eprintln!("diagnostic log rotation failed: {e}");
        }
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let line = format!(
            "[{}] [{}] [{}] {}\n",
            Utc::now().to_rfc3339(),
            level.as_str(),
            tag,
            message
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            eprintln!("diagnostic log write failed: {e}");
        }
    }

    fn maybe_rotate(&self) -> std::io::Result<()> {
        let Ok(meta) = fs::metadata(&self.path) else {
            return Ok(());
        };
        if meta.len() <= ROTATE_AT_BYTES {
            return Ok(());
        }
        let suffix = Utc::now().to_rfc3339().replace(':', "-");
        let rotated = self.path.with_extension(format!("log.{suffix}"));
        fs::rename(&self.path, rotated)
    }

    /// Last `n` lines of the current log file, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let Ok(file) = fs::File::open(&self.path) else {
            return Vec::new();
        };
        let reader = std::io::BufReader::new(file);
        let all: Vec<String> = reader.lines().map_while(Result::ok).collect();
        let start = all.len().saturating_sub(n);
        all[start..].to_vec()
    }
}

pub fn default_log_path() -> PathBuf {
    model::data_dir().join("logs").join("diagnostic.log")
}

/// A diagnostic report: platform info, per-engine model-asset status, and
/// the last 50 log lines.
#[derive(Debug, Clone)]
pub struct DiagnosticReport {
    pub os: String,
    pub arch: String,
    pub version: String,
    pub streaming_status: ModelStatus,
    pub segmented_status: ModelStatus,
    pub vad_status: ModelStatus,
    pub recent_log_lines: Vec<String>,
}

impl DiagnosticReport {
    pub fn collect(log: &DiagnosticLog) -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            streaming_status: model::status(ModelAsset::Streaming),
            segmented_status: model::status(ModelAsset::Segmented),
            vad_status: model::status(ModelAsset::Vad),
            recent_log_lines: log.tail(50),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("platform: {} {} (nextalk {})\n", self.os, self.arch, self.version));
        out.push_str(&format!("streaming model: {:?}\n", self.streaming_status));
        out.push_str(&format!("segmented model: {:?}\n", self.segmented_status));
        out.push_str(&format!("vad model: {:?}\n", self.vad_status));
        out.push_str("--- last log lines ---\n");
        for line in &self.recent_log_lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nextalk-diag-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn log_lines_use_expected_format() {
        let path = temp_path("format.log");
        let _ = fs::remove_file(&path);
        let log = DiagnosticLog::new(path.clone());
        log.log(Level::Info, "session", "hello world");
        let lines = log.tail(10);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[INFO]"));
        assert!(lines[0].contains("[session]"));
        assert!(lines[0].ends_with("hello world"));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rotates_when_over_size_threshold() {
        let path = temp_path("rotate.log");
        let _ = fs::remove_file(&path);
        fs::write(&path, "x".repeat((ROTATE_AT_BYTES + 1) as usize)).unwrap();

        let log = DiagnosticLog::new(path.clone());
        log.log(Level::Warn, "test", "after rotation");

        // Original path now holds only the new line.
        let lines = log.tail(10);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("after rotation"));

        // A rotated sibling exists with the old content.
        let dir = path.parent().unwrap();
        let rotated_exists = fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("rotate.log."));
        assert!(rotated_exists, "expected a rotated sibling file");

        for entry in fs::read_dir(dir).unwrap().flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("rotate.log") {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    #[test]
    fn tail_returns_at_most_n_most_recent_lines() {
        let path = temp_path("tail.log");
        let _ = fs::remove_file(&path);
        let log = DiagnosticLog::new(path.clone());
        for i in 0..5 {
            log.log(Level::Debug, "t", &format!("line {i}"));
        }
        let lines = log.tail(2);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("line 3"));
        assert!(lines[1].contains("line 4"));
        let _ = fs::remove_file(&path);
    }
}
