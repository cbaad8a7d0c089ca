//! Tracing subscriber setup: stderr always, plus a daily-rolling file when a log dir is set.

use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;

/// Base name of the rolling log file; the appender adds a date suffix.
pub const LOG_FILE_PREFIX: &str = "sms-relay.log";

/// Build the daemon's subscriber.
///
/// The returned guard must be held for the life of the process; dropping it
/// flushes and stops the file writer.
pub fn subscriber(
    filter: EnvFilter,
    log_dir: Option<&Path>,
) -> std::io::Result<(impl Subscriber + Send + Sync + 'static, Option<WorkerGuard>)> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer);

    Ok((subscriber, guard))
}
