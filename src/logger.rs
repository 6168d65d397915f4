//! Stderr logger for `lttctl`.
//!
//! Lines carry the time since the logger was installed:
//! `    1.204 - [ WARN] ltt::output: ...`

use std::io::Write;
use std::time::Instant;

use conquer_once::spin::OnceCell;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

static LOGGER: OnceCell<StderrLogger> = OnceCell::uninit();

pub struct StderrLogger {
    start: Instant,
    /// Serializes lines from concurrent threads.
    out: Mutex<()>,
}

impl StderrLogger {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            out: Mutex::new(()),
        }
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let elapsed = self.start.elapsed();
        let _guard = self.out.lock();
        let _ = writeln!(
            std::io::stderr().lock(),
            "{:>5}.{:03} - [{:>5}] {}: {}",
            elapsed.as_secs(),
            elapsed.subsec_millis(),
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the logger at `level`. Fails if another logger is installed.
pub fn init(level: LevelFilter) -> anyhow::Result<()> {
    let logger = LOGGER.get_or_init(StderrLogger::new);
    log::set_logger(logger).map_err(|_| anyhow::anyhow!("a logger is already installed"))?;
    log::set_max_level(level);
    Ok(())
}
