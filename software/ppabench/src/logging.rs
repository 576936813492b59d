//! Terminal and per-op file logging.
//!
//! Each op logs to `<op_dir>/logs/<op_name>.log` as well as stderr. Readings are
//! logged at `info`, setpoint writes at `debug`, and instrument traffic at `trace`.

use std::fs::{self, File, OpenOptions};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

type FileLayer = fmt::Layer<
    Registry,
    fmt::format::DefaultFields,
    fmt::format::Format<fmt::format::Full, fmt::time::ChronoUtc>,
    NonBlocking,
>;

static LOG_TARGETS: OnceLock<LogTargets> = OnceLock::new();

/// Writer threads for the active log targets.
/// Dropping a guard flushes whatever its writer still holds.
struct LogTargets {
    _stderr: WorkerGuard,

    /// Guard for the current op's file; replaced when the op changes
    file: Mutex<WorkerGuard>,
    file_reload: reload::Handle<FileLayer, Registry>,
}

/// Filter directive used when `RUST_LOG` is not set.
/// Other crates stay at `info` so that extra verbosity only applies to the bench.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "info,ppabench=debug",
        _ => "info,ppabench=trace",
    }
}

/// Location of the log file for an op
pub fn log_path(op_dir: &Path, op_name: &str) -> PathBuf {
    op_dir.join("logs").join(format!("{op_name}.log"))
}

fn open_log_file(path: &Path) -> Result<File, String> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| format!("Failed to create log directory: {e}"))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("Failed to open log file {path:?}: {e}"))
}

fn file_layer(file: File) -> (FileLayer, WorkerGuard) {
    let (writer, guard) = tracing_appender::non_blocking(file);
    let layer = fmt::layer::<Registry>()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(writer)
        .with_ansi(false);
    (layer, guard)
}

/// Start logging for an op, returning the path of its log file.
///
/// The first call installs the global subscriber with the level from `RUST_LOG`,
/// or from [default_directive] if unset. Later calls only move file output to the
/// new op's log, flushing the previous file; the level is fixed by the first call.
pub fn init_logging(op_dir: &Path, op_name: &str, verbosity: u8) -> Result<PathBuf, String> {
    let path = log_path(op_dir, op_name);
    let (layer, guard) = file_layer(open_log_file(&path)?);

    if let Some(targets) = LOG_TARGETS.get() {
        let mut current = targets
            .file
            .lock()
            .map_err(|_| "Log file guard lock poisoned".to_string())?;
        targets
            .file_reload
            .modify(|l| *l = layer)
            .map_err(|e| format!("Failed to switch log file: {e}"))?;

        // Drops the previous guard, flushing the old file
        *current = guard;
        drop(current);

        info!("Logging op `{op_name}` to {path:?}");
        return Ok(path);
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(verbosity)))
        .map_err(|e| format!("Failed to set up log filter: {e}"))?;

    // Logs share the terminal with plots on stdout, so they go to stderr
    let stderr = std::io::stderr();
    let ansi = stderr.is_terminal();
    let (stderr_writer, stderr_guard) = tracing_appender::non_blocking(stderr);
    let stderr_layer = fmt::layer()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(stderr_writer)
        .with_ansi(ansi)
        .with_target(false);

    let (layer, file_reload) = reload::Layer::<FileLayer, Registry>::new(layer);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| format!("Failed to initialize logging: {e}"))?;

    LOG_TARGETS.get_or_init(|| LogTargets {
        _stderr: stderr_guard,
        file: Mutex::new(guard),
        file_reload,
    });

    info!("Logging op `{op_name}` to {path:?}");
    Ok(path)
}
