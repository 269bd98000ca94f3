use std::fmt;
use std::sync::{Arc, Once};

use log::{Level, Log, Metadata, Record};

static INIT: Once = Once::new();

// TODO: makes tests pass for now, maybe find better way later
pub fn setup_logger() {
    INIT.call_once(|| {
        pretty_env_logger::init_timed();
    });
}

/// Logging capability handed to each component at construction.
///
/// The default sink drops everything. [`LogSink::global`] forwards to whatever
/// logger is installed in the `log` facade (e.g. by [`setup_logger`]).
#[derive(Clone, Default)]
pub struct LogSink {
    inner: Option<Arc<dyn Log>>,
}

impl LogSink {
    pub fn disabled() -> LogSink {
        LogSink { inner: None }
    }

    pub fn new(logger: Arc<dyn Log>) -> LogSink {
        LogSink { inner: Some(logger) }
    }

    pub fn global() -> LogSink {
        LogSink::new(Arc::new(GlobalLogger))
    }

    pub fn enabled(&self, level: Level, target: &str) -> bool {
        match &self.inner {
            Some(logger) => logger.enabled(&Metadata::builder().level(level).target(target).build()),
            None => false,
        }
    }

    pub fn emit(&self, level: Level, target: &str, args: fmt::Arguments<'_>) {
        if let Some(logger) = &self.inner {
            let record = Record::builder()
                .args(args)
                .level(level)
                .target(target)
                .build();
            if logger.enabled(record.metadata()) {
                logger.log(&record);
            }
        }
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink")
            .field("enabled", &self.inner.is_some())
            .finish()
    }
}

struct GlobalLogger;

impl Log for GlobalLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        log::logger().enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        log::logger().log(record)
    }

    fn flush(&self) {
        log::logger().flush()
    }
}

macro_rules! sink_log {
    ($sink:expr, $lvl:expr, $($arg:tt)+) => {
        $sink.emit($lvl, module_path!(), format_args!($($arg)+))
    };
}

macro_rules! sink_trace {
    ($sink:expr, $($arg:tt)+) => { sink_log!($sink, ::log::Level::Trace, $($arg)+) };
}

macro_rules! sink_debug {
    ($sink:expr, $($arg:tt)+) => { sink_log!($sink, ::log::Level::Debug, $($arg)+) };
}

macro_rules! sink_info {
    ($sink:expr, $($arg:tt)+) => { sink_log!($sink, ::log::Level::Info, $($arg)+) };
}

macro_rules! sink_warn {
    ($sink:expr, $($arg:tt)+) => { sink_log!($sink, ::log::Level::Warn, $($arg)+) };
}

macro_rules! sink_error {
    ($sink:expr, $($arg:tt)+) => { sink_log!($sink, ::log::Level::Error, $($arg)+) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CaptureLog;

    #[test]
    fn disabled_sink_drops_everything() {
        let sink = LogSink::default();
        assert!(!sink.enabled(Level::Error, "pseye"));
        sink_error!(sink, "nobody hears this {}", 1);
    }

    #[test]
    fn capture_log_records_messages() {
        let capture = Arc::new(CaptureLog::default());
        let sink = LogSink::new(capture.clone());
        sink_warn!(sink, "bad header: {} {}", 1, 12);
        sink_debug!(sink, "frame overflow");
        assert_eq!(capture.messages(Level::Warn), vec!["bad header: 1 12".to_string()]);
        assert!(capture.contains("overflow"));
    }
}
