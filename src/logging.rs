//! Tracing setup shared by the HTTP server and `domainctl`.
//!
//! Events go to stdout in compact form and to a log file. `RAGDOMAINS_LOG_FILE` pins the file to
//! an explicit path (appended, never rotated); otherwise logs roll daily under `logs/`.
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_FILE_VAR: &str = "RAGDOMAINS_LOG_FILE";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_PREFIX: &str = "ragdomains.log";
/// HTTP client internals are only interesting when explicitly requested via `RUST_LOG`.
const DEFAULT_FILTER: &str = "info,hyper=warn,reqwest=warn";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Where file logs are written.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogTarget {
    /// Single file chosen by the operator.
    File(PathBuf),
    /// Daily-rotated files `<dir>/<prefix>.YYYY-MM-DD`.
    Rolling { dir: PathBuf, prefix: &'static str },
}

fn resolve_log_target(explicit: Option<String>) -> LogTarget {
    match explicit.filter(|path| !path.trim().is_empty()) {
        Some(path) => LogTarget::File(PathBuf::from(path)),
        None => LogTarget::Rolling {
            dir: PathBuf::from(DEFAULT_LOG_DIR),
            prefix: DEFAULT_LOG_PREFIX,
        },
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default filter. Calling this more than once is harmless; later
/// calls leave the first subscriber in place.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let stdout_layer = fmt::layer().with_target(false).compact();
    let file_layer = open_writer(&resolve_log_target(std::env::var(LOG_FILE_VAR).ok())).map(
        |writer| {
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false)
                .compact()
        },
    );

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();
}

/// Open a non-blocking writer for `target`, or `None` when the file cannot be prepared.
fn open_writer(target: &LogTarget) -> Option<NonBlocking> {
    let (writer, guard) = match target {
        LogTarget::File(path) => {
            ensure_parent(path)?;
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => tracing_appender::non_blocking(file),
                Err(err) => {
                    eprintln!("Failed to open log file {}: {err}", path.display());
                    return None;
                }
            }
        }
        LogTarget::Rolling { dir, prefix } => {
            if let Err(err) = std::fs::create_dir_all(dir) {
                eprintln!("Failed to create log directory {}: {err}", dir.display());
                return None;
            }
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, prefix))
        }
    };
    // Only the first guard is kept; a second writer would be dropped along with its subscriber.
    let _ = LOG_GUARD.set(guard);
    Some(writer)
}

fn ensure_parent(path: &Path) -> Option<()> {
    match path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        Some(parent) => std::fs::create_dir_all(parent)
            .map_err(|err| eprintln!("Failed to create log directory {}: {err}", parent.display()))
            .ok(),
        None => Some(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins_over_rolling_default() {
        assert_eq!(
            resolve_log_target(Some("/var/log/rag.log".into())),
            LogTarget::File(PathBuf::from("/var/log/rag.log"))
        );
    }

    #[test]
    fn blank_or_missing_path_rolls_under_logs_dir() {
        let expected = LogTarget::Rolling {
            dir: PathBuf::from("logs"),
            prefix: "ragdomains.log",
        };
        assert_eq!(resolve_log_target(None), expected);
        assert_eq!(resolve_log_target(Some("  ".into())), expected);
    }

    #[test]
    fn explicit_file_gets_its_parent_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/server.log");
        assert!(open_writer(&LogTarget::File(path.clone())).is_some());
        assert!(path.is_file());
    }
}
