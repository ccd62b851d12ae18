//! Structured logging: console plus a daily rolling file.

use std::path::PathBuf;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::diagnostics;
use crate::settings::DEFAULT_LOG_FILTER;

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Used when `RUST_LOG` is unset.
    pub filter: String,
    pub log_dir: PathBuf,
    /// Console output; the file layer is always on.
    pub console: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            log_dir: diagnostics::get_log_dir(),
            console: true,
        }
    }
}

/// Console-only subscriber for the steps that run before [`init`]: opening
/// the database and reading the log settings out of it. Use it scoped with
/// `tracing::subscriber::with_default`.
///
/// With `console` off only warnings get through, since the log file is not
/// open yet and a database reset must not go unreported.
pub fn startup_subscriber<W>(console: bool, writer: W) -> impl Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = if console {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(writer)
        .finish()
}

/// Install the global subscriber. Keep the returned guard alive until exit;
/// dropping it flushes the file writer.
pub fn init(opts: &LogOptions) -> Result<WorkerGuard, String> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&opts.filter))
        .map_err(|e| format!("Invalid log filter '{}': {e}", opts.filter))?;

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs(&opts.log_dir);
    std::fs::create_dir_all(&opts.log_dir)
        .map_err(|e| format!("Failed to create log dir {}: {e}", opts.log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&opts.log_dir, diagnostics::LOG_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    // stdout carries command output, so the console layer writes to stderr.
    let console_layer = opts
        .console
        .then(|| fmt::layer().with_target(true).with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("Logging already initialized: {e}"))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_startup_subscriber_reports_database_reset() {
        let dir = std::env::temp_dir().join(format!("gatescan-log-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("gatescan.db"), "not a sqlite database ".repeat(200)).unwrap();

        let out = Captured::default();
        let sink = out.clone();
        let state = tracing::subscriber::with_default(
            startup_subscriber(false, move || sink.clone()),
            || crate::db::init(&dir),
        );
        assert!(state.is_ok());

        let text = out.text();
        assert!(text.contains("deleting and retrying"), "got: {text}");
        assert!(!text.contains("Opening database"), "info leaked: {text}");

        drop(state);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
