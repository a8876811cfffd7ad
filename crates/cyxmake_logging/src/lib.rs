//! Shared logging setup for the cyxmake binaries.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "cyxmake_coordinator=info,cyxmake_worker=info,cyxmake_transport=info,cyxmake_cache=info";
const KEEP_ROTATED_FILES: usize = 3;
const ROTATE_AT_BYTES: u64 = 8 * 1024 * 1024;

/// Logging configuration shared by the coordinator and worker binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Install tracing with a stderr layer and a size-rotated file layer.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_log_dir().context("Failed to create log directory")?;
    let file_writer = LogFileWriter::open(&log_dir, config.app_name)?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        file_filter.clone()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// cyxmake home directory: `$CYXMAKE_HOME` or `~/.cyxmake`.
pub fn cyxmake_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("CYXMAKE_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".cyxmake")
}

/// Log directory: `<home>/logs`.
pub fn log_dir() -> PathBuf {
    cyxmake_home().join("logs")
}

fn ensure_log_dir() -> Result<PathBuf> {
    let dir = log_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    Ok(dir)
}

/// Append-only log file that rotates by size, keeping a bounded history
/// (`app.log`, `app.log.1`, ..).
struct RotatingLog {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RotatingLog {
    fn open(dir: &Path, app_name: &str) -> io::Result<Self> {
        let path = dir.join(format!("{}.log", sanitize(app_name)));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        // Shift app.log.N-1 -> app.log.N, dropping the oldest.
        let rotated = |idx: usize| PathBuf::from(format!("{}.{}", self.path.display(), idx));
        let oldest = rotated(KEEP_ROTATED_FILES);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for idx in (1..KEEP_ROTATED_FILES).rev() {
            let src = rotated(idx);
            if src.exists() {
                fs::rename(&src, rotated(idx + 1))?;
            }
        }
        fs::rename(&self.path, rotated(1))?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > ROTATE_AT_BYTES {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Clonable `MakeWriter` handle over the shared rotating log.
#[derive(Clone)]
struct LogFileWriter {
    inner: Arc<Mutex<RotatingLog>>,
}

impl LogFileWriter {
    fn open(dir: &Path, app_name: &str) -> Result<Self> {
        let log = RotatingLog::open(dir, app_name)
            .with_context(|| format!("Failed to open log file for {}", app_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(log)),
        })
    }
}

struct LogFileGuard {
    inner: Arc<Mutex<RotatingLog>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogFileWriter {
    type Writer = LogFileGuard;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for LogFileGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?
            .flush()
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("cyxmake-coordinator"), "cyxmake-coordinator");
        assert_eq!(sanitize("a b/c"), "a_b_c");
    }

    #[test]
    fn test_rotation_keeps_bounded_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RotatingLog::open(dir.path(), "test").unwrap();

        for _ in 0..KEEP_ROTATED_FILES + 2 {
            log.rotate().unwrap();
            log.write_all(b"line\n").unwrap();
        }

        assert!(dir.path().join("test.log").exists());
        assert!(dir.path().join(format!("test.log.{}", KEEP_ROTATED_FILES)).exists());
        assert!(!dir
            .path()
            .join(format!("test.log.{}", KEEP_ROTATED_FILES + 1))
            .exists());
    }
}
