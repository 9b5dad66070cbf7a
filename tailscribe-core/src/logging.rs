//! Logging for tailscribe
//!
//! Logs roll daily under the XDG state directory as
//! `tailscribe.YYYY-MM-DD.log`. Every parse pass runs inside a
//! [`pass_span`], so decode warnings, truncation resets and pairing
//! anomalies carry the session and the byte offset the pass started at.

use crate::config::{Config, LoggingConfig};
use crate::types::SessionId;
use chrono::Utc;
use std::path::PathBuf;
use tracing::Span;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_PREFIX: &str = "tailscribe";
const LOG_SUFFIX: &str = "log";

/// Install the file subscriber.
///
/// `RUST_LOG` overrides `config.level`. At most `config.max_files` daily
/// files are kept; older ones are pruned by the appender.
pub fn init(config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix(LOG_SUFFIX)
        .max_log_files(config.max_files.max(1))
        .build(&log_dir)
        .map_err(|e| crate::error::Error::Config(format!("failed to create log file: {e}")))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    // Span fields (session, pass start offset) prefix every event
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::NONE);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .init();

    tracing::info!(
        log_file = %log_file_path().display(),
        level = %config.level,
        max_files = config.max_files,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

/// Test subscriber writing through the harness, with span close timings.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Span wrapping one read → parse → merge pass over a session.
pub fn pass_span(session: &SessionId, from: u64) -> Span {
    tracing::info_span!("parse_pass", session_id = %session, from)
}

/// Flushes buffered log lines when dropped.
pub struct LoggingGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// The file today's log lines go to.
pub fn log_file_path() -> PathBuf {
    Config::log_path(Utc::now().date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn test_log_file_is_dated() {
        let date = NaiveDate::from_ymd_opt(2025, 11, 25).unwrap();
        let path = Config::log_path(date);
        assert!(path.ends_with("tailscribe.2025-11-25.log"));
        assert!(log_file_path()
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("tailscribe.") && n.ends_with(".log")));
    }

    #[test]
    fn test_events_inside_a_pass_carry_its_context() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let _pass = pass_span(&SessionId::new("s1"), 512).entered();
            tracing::warn!(line = 3, "Skipping undecodable line");
        });

        let text = captured.text();
        assert!(text.contains("parse_pass{session_id=s1 from=512}"), "{text}");
        assert!(text.contains("Skipping undecodable line"));
    }
}
