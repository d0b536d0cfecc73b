//! Rotating file logger behind the `log` facade.
//!
//! Lines are either `timestamp [LEVEL] message` or, with `--json-log`, one
//! JSON object per line. When the file outgrows `max_size` it is rotated
//! into `.1`..`.3` suffixed history files, optionally gzip-compressed.
//! Every failure inside the logger degrades (the write or the rotation is
//! dropped); logging never takes the process down.

use flate2::write::GzEncoder;
use flate2::Compression;
use log::{LevelFilter, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const KEEP_ROTATED: usize = 3;

static LOGGER_ACTIVE: AtomicBool = AtomicBool::new(false);

pub fn logger_initialized() -> bool {
    LOGGER_ACTIVE.load(Ordering::SeqCst)
}

struct Sink {
    file: File,
    written: u64,
}

pub struct FileLogger {
    path: PathBuf,
    level: LevelFilter,
    json: bool,
    max_size: u64,
    compress: bool,
    sink: Mutex<Option<Sink>>,
}

impl FileLogger {
    pub fn open(
        path: PathBuf,
        level: LevelFilter,
        max_size: u64,
        json: bool,
        compress: bool,
    ) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(FileLogger {
            path,
            level,
            json,
            max_size,
            compress,
            sink: Mutex::new(Some(Sink { file, written })),
        })
    }

    fn format_line(&self, record: &Record) -> String {
        let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        if self.json {
            serde_json::json!({
                "ts": ts.to_string(),
                "level": record.level().to_string(),
                "msg": record.args().to_string(),
            })
            .to_string()
        } else {
            format!("{} [{}] {}", ts, record.level(), record.args())
        }
    }

    fn write_line(&self, line: &str) {
        let mut guard = self.sink.lock().unwrap();
        let Some(sink) = guard.as_mut() else {
            return;
        };
        if writeln!(sink.file, "{}", line).is_err() {
            return;
        }
        sink.written += line.len() as u64 + 1;
        if self.max_size > 0 && sink.written >= self.max_size {
            // Rotation failure downgrades to writing into the same file.
            if let Ok(file) = rotate(&self.path, self.compress) {
                *sink = Sink { file, written: 0 };
            }
        }
    }
}

fn rotate(path: &Path, compress: bool) -> std::io::Result<File> {
    let suffixed = |n: usize| {
        let mut os = path.as_os_str().to_owned();
        os.push(format!(".{}", n));
        PathBuf::from(os)
    };
    let gz = |p: &Path| {
        let mut os = p.as_os_str().to_owned();
        os.push(".gz");
        PathBuf::from(os)
    };
    // Shift the history window: .2 -> .3, .1 -> .2, live -> .1.
    for n in (1..KEEP_ROTATED).rev() {
        let from = suffixed(n);
        let to = suffixed(n + 1);
        let _ = std::fs::rename(gz(&from), gz(&to));
        let _ = std::fs::rename(&from, &to);
    }
    let first = suffixed(1);
    std::fs::rename(path, &first)?;
    if compress {
        if compress_file(&first, &gz(&first)).is_ok() {
            let _ = std::fs::remove_file(&first);
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn compress_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    let data = std::fs::read(src)?;
    let out = File::create(dst)?;
    let mut enc = GzEncoder::new(out, Compression::default());
    enc.write_all(&data)?;
    enc.finish()?;
    Ok(())
}

impl log::Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.write_line(&self.format_line(record));
    }

    fn flush(&self) {
        let mut guard = self.sink.lock().unwrap();
        if let Some(sink) = guard.as_mut() {
            let _ = sink.file.flush();
        }
    }
}

/// Install the rotating file logger as the global `log` backend.
pub fn init_logger(
    path: &Path,
    level: LevelFilter,
    max_size: u64,
    json: bool,
    compress: bool,
) -> anyhow::Result<()> {
    let logger = FileLogger::open(path.to_path_buf(), level, max_size, json, compress)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level);
    LOGGER_ACTIVE.store(true, Ordering::SeqCst);
    Ok(())
}
