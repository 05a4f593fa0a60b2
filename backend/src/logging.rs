use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

static LOG_FILE: Mutex<Option<File>> = Mutex::new(None);

/// Open today's log file under `<data_dir>/logs` for appending. Later
/// `log_*!` calls mirror into it alongside the tracing subscriber.
///
/// Every `log_*!` call names a target so the tracing filter can select one
/// layer at a time:
///
/// | target            | emitted by                                  |
/// |-------------------|---------------------------------------------|
/// | `lmchat`          | process start and shutdown                  |
/// | `lmchat.db`       | migrations and state wiring                 |
/// | `lmchat.provider` | HTTP calls to the completion server         |
/// | `lmchat.models`   | model sync, default switches, deletes       |
/// | `lmchat.chat`     | stream open, outcome and persistence        |
/// | `lmchat.fanout`   | topic lifecycle                             |
/// | `lmchat.command`  | command entry points                        |
pub fn init_logging(data_dir: &Path) -> Result<PathBuf, std::io::Error> {
    let logs_dir = data_dir.join("logs");
    fs::create_dir_all(&logs_dir)?;

    let path = logs_dir.join(format!("lmchat_{}.log", Local::now().format("%Y-%m-%d")));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }

    tracing::info!(target: "lmchat", "File logging to {}", path.display());
    Ok(path)
}

pub fn log_to_file(level: &str, target: &str, message: &str) {
    let Ok(mut guard) = LOG_FILE.lock() else {
        return;
    };
    if let Some(file) = guard.as_mut() {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(file, "{timestamp} {level:<5} {target}: {message}");
    }
}

#[macro_export]
macro_rules! log_info {
    ($target:expr, $($arg:tt)*) => ({
        let msg = format!($($arg)*);
        $crate::logging::log_to_file("INFO", $target, &msg);
        tracing::info!(target: $target, "{}", msg);
    });
}

#[macro_export]
macro_rules! log_warn {
    ($target:expr, $($arg:tt)*) => ({
        let msg = format!($($arg)*);
        $crate::logging::log_to_file("WARN", $target, &msg);
        tracing::warn!(target: $target, "{}", msg);
    });
}

#[macro_export]
macro_rules! log_error {
    ($target:expr, $($arg:tt)*) => ({
        let msg = format!($($arg)*);
        $crate::logging::log_to_file("ERROR", $target, &msg);
        tracing::error!(target: $target, "{}", msg);
    });
}

/// Install the global subscriber. `RUST_LOG` wins over the configured filter.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();
}
