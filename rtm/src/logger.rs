//! Per-client logging.

use std::fmt;

use tracing::{dispatcher, Dispatch, Level};

/// Set this environment variable to get debug output from [`Logger::from_env`].
pub const DEBUG_ENV: &str = "DEBUG_RTM_SDK";

/// Where a client sends its `tracing` events.
///
/// The default logger uses whatever subscriber is current for the calling
/// thread. A logger built with [`Logger::new`] or [`Logger::std`] is scoped
/// to the client that owns it and leaves the global default untouched.
#[derive(Clone, Default)]
pub struct Logger {
    dispatch: Option<Dispatch>,
}

impl Logger {
    pub fn new(dispatch: Dispatch) -> Self {
        Logger {
            dispatch: Some(dispatch),
        }
    }

    /// Human readable log lines on stderr, up to `level`.
    pub fn std(level: Level) -> Self {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .finish();
        Logger::new(Dispatch::new(subscriber))
    }

    pub fn from_env() -> Self {
        if std::env::var_os(DEBUG_ENV).is_some() {
            Logger::std(Level::DEBUG)
        } else {
            Logger::std(Level::WARN)
        }
    }

    /// Runs `f` with this logger as the current subscriber.
    pub fn scope<T>(&self, f: impl FnOnce() -> T) -> T {
        match self.dispatch {
            Some(ref d) => dispatcher::with_default(d, f),
            None => f(),
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Logger")
            .field("scoped", &self.dispatch.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
        }
    }

    #[test]
    fn scoped_logger_captures_only_its_scope() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let logger = Logger::new(Dispatch::new(subscriber));

        tracing::info!("outside");
        let v = logger.scope(|| {
            tracing::info!("inside");
            tracing::debug!("too verbose");
            42
        });

        assert_eq!(v, 42);
        let text = capture.text();
        assert!(text.contains("inside"));
        assert!(!text.contains("outside"));
        assert!(!text.contains("too verbose"));
    }

    #[test]
    fn default_logger_runs_closure() {
        let logger = Logger::default();
        assert_eq!(logger.scope(|| "ok"), "ok");
        assert_eq!(format!("{:?}", logger), "Logger { scoped: false }");
    }
}
