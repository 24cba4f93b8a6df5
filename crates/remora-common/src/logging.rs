use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::remora_dir;

/// Initialize file-based logging. Stdout belongs to the wrapped terminal
/// session, so everything goes to a daily-rotated file under ~/.remora/logs.
///
/// The returned guard must stay alive for the duration of the process or
/// buffered log lines are lost.
pub fn init(verbose: u8) -> Result<WorkerGuard> {
    let dir = remora_dir().join("logs");
    std::fs::create_dir_all(&dir)?;

    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("remora={default_level}")));

    let appender = tracing_appender::rolling::daily(&dir, "remora.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}
