//! Diagnostics and log file management.
//!
//! All diagnostics go through the standard [`log`] facade. The installed
//! logger prepends the current daemon phase (`[Startup]`, `[Running]`,
//! `[Shutdown]`) and writes to stderr, filtered by the console verbosity,
//! and to an optional log file with its own verbosity. Warnings and errors
//! always reach stderr regardless of the configured level.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;

/// Daemon lifecycle phase, used to label log records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Startup = 0,
    Running = 1,
    Shutdown = 2,
}

static PHASE: AtomicU8 = AtomicU8::new(Phase::Startup as u8);

/// Move the daemon to a new lifecycle phase.
pub fn set_phase(phase: Phase) {
    PHASE.store(phase as u8, Ordering::Release);
}

fn phase_label() -> &'static str {
    match PHASE.load(Ordering::Acquire) {
        0 => "[Startup]",
        2 => "[Shutdown]",
        _ => "[Running]",
    }
}

/// Map a `-v` count onto a level filter.
pub fn verbosity_to_filter(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn filter_from_usize(v: usize) -> LevelFilter {
    match v {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Phase labelled logger with independently filtered console and file
/// output.
pub struct PhaseLogger {
    console: AtomicUsize,
    file_level: AtomicUsize,
    file: Mutex<Option<File>>,
}

static LOGGER: Lazy<PhaseLogger> = Lazy::new(|| PhaseLogger {
    console: AtomicUsize::new(LevelFilter::Warn as usize),
    file_level: AtomicUsize::new(LevelFilter::Info as usize),
    file: Mutex::new(None),
});

impl PhaseLogger {
    fn console_filter(&self) -> LevelFilter {
        filter_from_usize(self.console.load(Ordering::Acquire))
    }

    fn file_filter(&self) -> LevelFilter {
        filter_from_usize(self.file_level.load(Ordering::Acquire))
    }
}

impl Log for PhaseLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn
            || metadata.level() <= self.console_filter()
            || metadata.level() <= self.file_filter()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = record.level();
        let line = format!("{:<10} {}: {}", phase_label(), level, record.args());

        // Warnings and errors are never filtered from the console
        if level <= Level::Warn || level <= self.console_filter() {
            eprintln!("{line}");
        }
        if level <= self.file_filter() {
            if let Ok(mut guard) = self.file.lock() {
                if let Some(file) = guard.as_mut() {
                    let _ = writeln!(file, "{line}");
                }
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(file) = guard.as_mut() {
                let _ = file.flush();
            }
        }
    }
}

/// Install the global logger with the given console and file verbosities.
/// Safe to call more than once; later calls only adjust the filters.
pub fn init(console_verbosity: u8, file_verbosity: u8) {
    LOGGER
        .console
        .store(verbosity_to_filter(console_verbosity) as usize, Ordering::Release);
    LOGGER
        .file_level
        .store(verbosity_to_filter(file_verbosity) as usize, Ordering::Release);
    let max = LOGGER.console_filter().max(LOGGER.file_filter()).max(LevelFilter::Warn);
    if log::set_logger(&*LOGGER).is_ok() {
        log::set_max_level(max);
    } else {
        log::set_max_level(max);
    }
}

/// Attach (or replace) the log file sink. Pass `None` to detach, e.g. while
/// rotating.
pub fn set_log_file(file: Option<File>) {
    if let Ok(mut guard) = LOGGER.file.lock() {
        if let Some(old) = guard.as_mut() {
            let _ = old.flush();
        }
        *guard = file;
    }
}

/// Flush any buffered log output.
pub fn flush() {
    LOGGER.flush();
}

/// Open a dated, serial numbered file `<prefix>YYYYMMDDXX.<extension>`.
///
/// `XX` is a two digit hexadecimal serial number starting from zero; the
/// file is opened in exclusive create mode and the serial incremented until
/// an unused name is found. Returns the open file and its stem (path
/// without the extension), which callers use to derive sibling file names.
pub fn open_stamped_file(prefix: &str, extension: &str) -> std::io::Result<(File, PathBuf)> {
    let now = time::OffsetDateTime::now_local()
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc());
    let format = time::macros::format_description!("[year][month][day]");
    let date = now
        .format(&format)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

    for serial in 0..=0xFFu32 {
        let stem = format!("{prefix}{date}{serial:02x}");
        let name = format!("{stem}.{extension}");
        match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(Path::new(&name))
        {
            Ok(file) => return Ok((file, PathBuf::from(stem))),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free serial number for prefix {prefix}{date}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_mapping() {
        assert_eq!(verbosity_to_filter(0), LevelFilter::Warn);
        assert_eq!(verbosity_to_filter(1), LevelFilter::Info);
        assert_eq!(verbosity_to_filter(2), LevelFilter::Debug);
        assert_eq!(verbosity_to_filter(9), LevelFilter::Trace);
    }

    #[test]
    fn phase_labels() {
        set_phase(Phase::Startup);
        assert_eq!(phase_label(), "[Startup]");
        set_phase(Phase::Running);
        assert_eq!(phase_label(), "[Running]");
        set_phase(Phase::Shutdown);
        assert_eq!(phase_label(), "[Shutdown]");
        set_phase(Phase::Startup);
    }

    #[test]
    fn stamped_files_are_serial_numbered() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/run", dir.path().display());
        let (_f1, stem1) = open_stamped_file(&prefix, "dat").unwrap();
        let (_f2, stem2) = open_stamped_file(&prefix, "dat").unwrap();
        assert_ne!(stem1, stem2);
        let s1 = stem1.to_string_lossy();
        let s2 = stem2.to_string_lossy();
        assert!(s1.ends_with("00"), "{s1}");
        assert!(s2.ends_with("01"), "{s2}");
        // Same date stamp, different serial
        assert_eq!(s1[..s1.len() - 2], s2[..s2.len() - 2]);
    }
}
