use flate2::write::GzEncoder;
use flate2::Compression;
use log::warn;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Append-only file writer that rotates by size, keeps a bounded set of
/// numbered backups (`events.log.1` is the freshest), prunes backups by
/// age, and optionally gzips rotated files.
pub struct RotatingWriter {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
    max_backups: usize,
    max_age: Duration,
    compress: bool,
}

impl RotatingWriter {
    /// Opens (or creates) `path` for appending. `max_size_mb` is the
    /// rotation threshold; `max_age_days` of 0 keeps backups forever.
    pub fn open(
        path: &Path,
        max_size_mb: u64,
        max_backups: usize,
        max_age_days: u64,
        compress: bool,
    ) -> io::Result<Self> {
        Self::open_with_limit(
            path,
            max_size_mb.max(1) * 1024 * 1024,
            max_backups,
            Duration::from_secs(max_age_days * 24 * 60 * 60),
            compress,
        )
    }

    pub(crate) fn open_with_limit(
        path: &Path,
        max_bytes: u64,
        max_backups: usize,
        max_age: Duration,
        compress: bool,
    ) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
            max_bytes,
            max_backups,
            max_age,
            compress,
        })
    }

    fn backup_path(&self, index: usize, gz: bool) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", index));
        if gz {
            name.push(".gz");
        }
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        // shift existing backups up one slot, newest first
        for index in (1..self.max_backups).rev() {
            for gz in [false, true] {
                let from = self.backup_path(index, gz);
                if from.exists() {
                    let _ = fs::rename(&from, self.backup_path(index + 1, gz));
                }
            }
        }

        if self.max_backups > 0 {
            let first = self.backup_path(1, false);
            fs::rename(&self.path, &first)?;
            if self.compress {
                if let Err(err) = compress_file(&first) {
                    warn!("failed to compress rotated file {}: {}", first.display(), err);
                }
            }
        } else {
            fs::remove_file(&self.path)?;
        }

        self.prune_old_backups();

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn prune_old_backups(&self) {
        if self.max_age.is_zero() {
            return;
        }
        let now = SystemTime::now();
        for index in 1..=self.max_backups {
            for gz in [false, true] {
                let path = self.backup_path(index, gz);
                let Ok(metadata) = fs::metadata(&path) else {
                    continue;
                };
                let Ok(modified) = metadata.modified() else {
                    continue;
                };
                if now
                    .duration_since(modified)
                    .map(|age| age > self.max_age)
                    .unwrap_or(false)
                {
                    if let Err(err) = fs::remove_file(&path) {
                        warn!("failed to prune old backup {}: {}", path.display(), err);
                    }
                }
            }
        }
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
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

fn compress_file(path: &Path) -> io::Result<()> {
    let contents = fs::read(path)?;
    let mut gz_path = path.to_path_buf().into_os_string();
    gz_path.push(".gz");
    let gz_file = File::create(PathBuf::from(gz_path))?;
    let mut encoder = GzEncoder::new(gz_file, Compression::default());
    encoder.write_all(&contents)?;
    encoder.finish()?;
    fs::remove_file(path)
}
