//! Tracing setup for Undertow
//!
//! The console shows Undertow's own crates at the level picked on the
//! command line and keeps dependencies at `warn`. A second layer writes a
//! trace-level record of the last run to disk.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the per-run log file written under the logs directory.
pub const LOG_FILE_NAME: &str = "undertow-last-run.log";

/// Overrides the default logs directory.
pub const LOG_DIR_ENV: &str = "UNDERTOW_LOG_DIR";

const UNDERTOW_TARGETS: [&str; 3] = ["undertow_core", "undertow_web", "undertow_cli"];

/// Filter directives for the console layer.
///
/// Dependencies stay at `warn` unless the chosen level is quieter.
pub fn console_directives(level: Level) -> String {
    let level = level.as_str().to_lowercase();
    let base = if level == "error" { "error" } else { "warn" };
    let mut directives = vec![base.to_string()];
    directives.extend(UNDERTOW_TARGETS.iter().map(|t| format!("{t}={level}")));
    directives.join(",")
}

/// Filter directives for the trace file.
///
/// Every Undertow target is recorded in full; HTTP plumbing is kept at
/// `debug` so request spans show up without per-frame noise.
pub fn file_directives() -> String {
    let mut directives = vec![
        "info".to_string(),
        "tower_http=debug".to_string(),
        "reqwest=debug".to_string(),
    ];
    directives.extend(UNDERTOW_TARGETS.iter().map(|t| format!("{t}=trace")));
    directives.join(",")
}

/// Where the trace file goes: the argument, then `UNDERTOW_LOG_DIR`, then `./logs`.
pub fn resolve_logs_dir(logs_dir: Option<&Path>) -> PathBuf {
    match logs_dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::var_os(LOG_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("logs")),
    }
}

/// Installs the console and trace-file layers.
///
/// `RUST_LOG` replaces the console directives when set. The trace file is
/// truncated on every start.
///
/// # Errors
///
/// - `std::io::Error` - logs directory cannot be created or the log file cannot be opened
/// - `tracing_subscriber::util::TryInitError` - a global subscriber is already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let logs_path = resolve_logs_dir(logs_dir);
    create_dir_all(&logs_path)?;
    let log_file_path = logs_path.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path)?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_directives(console_level)));
    let console_layer = fmt::layer()
        .with_target(console_level >= Level::DEBUG)
        .compact()
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new(file_directives()));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(
        "Logging {} to console, trace file at {}",
        console_level,
        log_file_path.display()
    );
    Ok(())
}

/// Console verbosity picked with `--log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    /// Includes per-cell tunnel tracing
    Trace,
}

impl CliLogLevel {
    /// # Examples
    /// ```
    /// use undertow_core::tracing_setup::CliLogLevel;
    ///
    /// assert_eq!(CliLogLevel::Info.as_tracing_level(), tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::ValueEnum;

    use super::*;

    #[test]
    fn test_console_directives_scope_level_to_own_crates() {
        assert_eq!(
            console_directives(Level::DEBUG),
            "warn,undertow_core=debug,undertow_web=debug,undertow_cli=debug"
        );
        assert!(console_directives(Level::ERROR).starts_with("error,"));
        assert!(EnvFilter::try_new(console_directives(Level::TRACE)).is_ok());
    }

    #[test]
    fn test_file_directives_parse() {
        let directives = file_directives();
        assert!(directives.contains("undertow_core=trace"));
        assert!(EnvFilter::try_new(directives).is_ok());
    }

    #[test]
    fn test_explicit_logs_dir_wins() {
        let dir = Path::new("/var/log/undertow");
        assert_eq!(resolve_logs_dir(Some(dir)), dir.to_path_buf());
    }

    #[test]
    fn test_cli_level_parses_case_insensitively() {
        let level = CliLogLevel::from_str("WARN", true).unwrap();
        assert_eq!(level.as_tracing_level(), Level::WARN);
        assert!(CliLogLevel::from_str("loud", true).is_err());
    }
}
