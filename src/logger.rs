//! Logging setup
//!
//! tracing to stderr for interactive use plus a size-rotated file at
//! `<data dir>/log/app.log`: the live file rolls over at 10 MiB, rotated
//! files are gzipped, at most 10 backups are kept, and backups older
//! than 30 days are removed. Rotation runs on the appender's worker
//! thread so the hot path never blocks on compression. The returned
//! guard must stay alive for the process lifetime or buffered file
//! output is lost.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILENAME: &str = "app.log";

/// Rotation trigger for the live file.
const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Gzipped backups kept after count-based pruning.
const MAX_LOG_BACKUPS: usize = 10;

/// Backups older than this are removed regardless of count.
const MAX_LOG_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
    let writer = RollingFileWriter::new(log_dir)
        .with_context(|| format!("failed to open log file in {}", log_dir.display()))?;
    let (file_writer, guard) = tracing_appender::non_blocking(writer);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,proxyman=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

/// Append-only log file with size-triggered rotation.
///
/// On rollover the live file is compressed into `app-<timestamp>.log.gz`
/// next to it and truncated in place, then backups beyond the count cap
/// or the retention window are pruned.
struct RollingFileWriter {
    dir: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    max_backups: usize,
}

impl RollingFileWriter {
    fn new(dir: &Path) -> io::Result<Self> {
        Self::with_limits(dir, MAX_LOG_SIZE, MAX_LOG_BACKUPS)
    }

    fn with_limits(dir: &Path, max_size: u64, max_backups: usize) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let file = open_log(dir, false)?;
        let written = file.metadata()?.len();
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            written,
            max_size,
            max_backups,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let live = self.dir.join(LOG_FILENAME);
        let backup = self.backup_path();

        let mut source = File::open(&live)?;
        let mut encoder = GzEncoder::new(File::create(&backup)?, Compression::default());
        io::copy(&mut source, &mut encoder)?;
        encoder.finish()?;

        // Truncating in place keeps the same path and inode for tailers.
        self.file = open_log(&self.dir, true)?;
        self.written = 0;

        self.prune();
        Ok(())
    }

    /// Timestamped backup name; a sequence suffix keeps same-instant
    /// rotations from clobbering each other.
    fn backup_path(&self) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%6f");
        let mut path = self.dir.join(format!("app-{stamp}.log.gz"));
        let mut seq = 1;
        while path.exists() {
            path = self.dir.join(format!("app-{stamp}-{seq}.log.gz"));
            seq += 1;
        }
        path
    }

    /// Removes the oldest backups beyond the count cap and anything past
    /// the retention window. Best-effort.
    fn prune(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let mut backups: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| is_backup(path))
            .collect();
        // Timestamped names sort chronologically.
        backups.sort();

        let excess = backups.len().saturating_sub(self.max_backups);
        for path in backups.drain(..excess) {
            let _ = fs::remove_file(path);
        }

        let now = SystemTime::now();
        for path in backups {
            let expired = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > MAX_LOG_AGE);
            if expired {
                let _ = fs::remove_file(path);
            }
        }
    }
}

impl Write for RollingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            // If rotation fails, keep appending to the live file rather
            // than dropping log lines.
            let _ = self.rotate();
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn is_backup(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with("app-") && name.ends_with(".log.gz"))
}

fn open_log(dir: &Path, truncate: bool) -> io::Result<File> {
    let path = dir.join(LOG_FILENAME);
    let mut options = OpenOptions::new();
    options.create(true);
    if truncate {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    let file = options.open(&path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o644));
    }
    Ok(file)
}
