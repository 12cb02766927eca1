//! Process logging bootstrap.
//!
//! Tracing goes to two places: a size-rotated log file under the service
//! home, and stderr. `RUST_LOG` overrides the default filter.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use stevedore_protocol::config::service_home;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "stevedore=info,stevedore_db=info,stevedore_engine=info,stevedore_scout=info";
const MAX_ROTATED_FILES: usize = 3;
const MAX_LOG_FILE_SIZE: u64 = 5 * 1024 * 1024;

/// Initialize tracing for a stevedore binary.
pub fn init_logging(app_name: &str, verbose: bool) -> Result<()> {
    let log_dir = logs_dir();
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let writer = RotatingWriter::open(log_dir.join(format!("{app_name}.log")))
        .context("failed to open log file")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let stderr_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(stderr_filter),
        )
        .init();

    Ok(())
}

/// Log directory under the service home.
pub fn logs_dir() -> PathBuf {
    service_home().join("logs")
}

/// Append-only writer that rotates `name.log` through `name.log.1..N`
/// once the current file crosses the size cap.
#[derive(Clone)]
struct RotatingWriter {
    inner: Arc<Mutex<RotatingInner>>,
}

struct RotatingInner {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RotatingWriter {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingInner {
                path,
                file,
                written,
            })),
        })
    }
}

impl RotatingInner {
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let rotated = |index: usize| PathBuf::from(format!("{}.{index}", self.path.display()));
        let oldest = rotated(MAX_ROTATED_FILES);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..MAX_ROTATED_FILES).rev() {
            let src = rotated(index);
            if src.exists() {
                fs::rename(&src, rotated(index + 1))?;
            }
        }
        if self.path.exists() {
            fs::rename(&self.path, rotated(1))?;
        }

        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;
        inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;
        inner.file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_appends_and_tracks_size() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("svc.log");

        let mut writer = RotatingWriter::open(path.clone()).unwrap();
        writer.write_all(b"first line\n").unwrap();
        writer.flush().unwrap();

        let mut reopened = RotatingWriter::open(path.clone()).unwrap();
        reopened.write_all(b"second line\n").unwrap();
        reopened.flush().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("first line"));
        assert!(content.contains("second line"));
    }

    #[test]
    fn rotation_keeps_the_newest_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("svc.log");

        let writer = RotatingWriter::open(path.clone()).unwrap();
        {
            let mut inner = writer.inner.lock().unwrap();
            inner.write(b"old content\n").unwrap();
            inner.rotate().unwrap();
            inner.write(b"new content\n").unwrap();
            inner.file.flush().unwrap();
        }

        let current = fs::read_to_string(&path).unwrap();
        assert!(current.contains("new content"));
        let rotated = fs::read_to_string(format!("{}.1", path.display())).unwrap();
        assert!(rotated.contains("old content"));
    }
}
