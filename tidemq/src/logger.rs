//! `log` records go through a `slog` logfmt drain behind an async channel.

use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};

use slog::{o, Drain, Record};
use slog_logfmt::Logfmt;

use crate::conf::logging::{Level, Log, To};
use crate::Result;

pub use slog::Logger;
pub use slog_async::AsyncGuard;

/// Installs the process wide logger described by `cfg`. Queued records are
/// written out when the returned guard is dropped.
pub fn init(cfg: &Log) -> Result<AsyncGuard> {
    let (logger, guard) = config_logger(&cfg.filename(), cfg.to, cfg.level)?;
    log::set_boxed_logger(Box::new(LoggerEx(logger)))?;
    let level = if cfg.to.off() { log::LevelFilter::Off } else { slog_to_log_level(cfg.level.inner()).to_level_filter() };
    log::set_max_level(level);
    Ok(guard)
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: r.target() };
        self.0.log(&Record::new(&s, r.args(), slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_to_log_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();
    slog::RecordLocation { file, line, column: 0, function: "", module }
}

/// Builds the drain chain: logfmt with a `date level module:line |` prefix,
/// a level filter, then an async channel that drops and reports on overflow.
pub fn config_logger(filename: &str, to: To, level: Level) -> Result<(Logger, AsyncGuard)> {
    let drain = Logfmt::new(WriteFilter::new(filename, to)?)
        .set_prefix(move |io: &mut dyn io::Write, rec: &Record| -> slog::Result {
            write!(
                io,
                "{date} {level} {module}:{line} | {msg}\t",
                date = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level = rec.level().as_short_str(),
                module = rec.module(),
                line = rec.line(),
                msg = rec.msg(),
            )?;
            Ok(())
        })
        .build()
        .fuse();

    let drain = drain.filter_level(level.inner()).fuse();

    let (drain, guard) = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build_with_guard();

    Ok((Logger::root(drain.ignore_res(), o!()), guard))
}

struct WriteFilter {
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(filename: &str, to: To) -> Result<Self> {
        let file = if to.file() { Some(open_file(filename)?) } else { None };
        Ok(Self { to, file, console: io::stdout() })
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.to.console() {
            self.console.write_all(buf)?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> Result<File> {
    if let Some(dir) = std::path::Path::new(filename).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .map_err(|e| anyhow::anyhow!("logger file config error, filename: {}, {:?}", filename, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_to_the_configured_file() {
        let dir = std::env::temp_dir().join(format!("tidemq-log-{}", uuid::Uuid::new_v4().simple()));
        let filename = dir.join("t.log").to_string_lossy().into_owned();
        let (logger, guard) = config_logger(&filename, To::File, Level::new(slog::Level::Info)).unwrap();
        slog::info!(logger, "kept");
        slog::debug!(logger, "filtered");
        drop(guard);

        let text = std::fs::read_to_string(&filename).unwrap();
        assert!(text.contains("kept"));
        assert!(!text.contains("filtered"));
        assert!(text.contains(" INFO "));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn levels_map_both_ways() {
        assert_eq!(log_to_slog_level(log::Level::Warn), slog::Level::Warning);
        assert_eq!(slog_to_log_level(slog::Level::Critical), log::Level::Error);
    }
}
