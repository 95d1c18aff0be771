use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::Level;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Logs go to stderr so streamed replies on stdout stay clean; with
/// `log_file` set, a size-capped copy is also written there.
pub fn init_logging(log_level: Level, log_file: Option<&str>) {
    let level_filter = LevelFilter::from_level(log_level);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    if let Some(path) = log_file {
        let log = RotatingLog::new(PathBuf::from(path), MAX_LOG_BYTES);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(move || log.clone());
        tracing_subscriber::registry()
            .with(stderr_layer.with_filter(level_filter))
            .with(file_layer.with_filter(level_filter))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(stderr_layer.with_filter(level_filter))
            .init();
    }
}

/// Appends to `path`; once it reaches `max_len` bytes it is moved to
/// `<path>.1` (replacing any older copy) and a fresh file is started.
#[derive(Clone)]
struct RotatingLog {
    path: PathBuf,
    max_len: u64,
    lock: Arc<Mutex<()>>,
}

impl RotatingLog {
    fn new(path: PathBuf, max_len: u64) -> Self {
        Self {
            path,
            max_len,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".1");
        PathBuf::from(name)
    }

    fn open(&self) -> io::Result<File> {
        let full = std::fs::metadata(&self.path)
            .map(|meta| meta.len() >= self.max_len)
            .unwrap_or(false);
        if full {
            std::fs::rename(&self.path, self.rotated_path())?;
        }
        OpenOptions::new().create(true).append(true).open(&self.path)
    }
}

impl Write for RotatingLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.open()?.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
