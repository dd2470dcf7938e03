//! # Logging Setup
//!
//! Installs the process-wide `tracing` subscriber: an `EnvFilter` (with
//! `RUST_LOG` taking precedence over the configured level), a console layer
//! and, when a log directory is given, a non-blocking file layer. Every run
//! writes a fresh `<app>_<timestamp>.log`; older files of the same app are
//! pruned so that only the newest few remain.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log directory {path}: {source}")]
    Dir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid log filter '{0}'")]
    Filter(String),

    #[error("a global subscriber is already installed: {0}")]
    Install(String),
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub app_name: String,
    /// Default filter directive when `RUST_LOG` is unset, e.g. `info`.
    pub level: String,
    /// Console output as JSON lines instead of human-readable text.
    pub json: bool,
    /// Where log files go. No file output when `None`.
    pub log_dir: Option<PathBuf>,
    /// Log files of this app kept after pruning, the new one included.
    pub keep_files: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            app_name: "peer_client".to_string(),
            level: "info".to_string(),
            json: false,
            log_dir: None,
            keep_files: 1,
        }
    }
}

/// Installs the global subscriber. Hold on to the returned guard for the
/// life of the process, otherwise buffered file output is lost.
pub fn init_tracing(options: &LogOptions) -> Result<Option<WorkerGuard>, LogError> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(&directives).map_err(|_| LogError::Filter(directives))?,
        _ => EnvFilter::try_new(&options.level).map_err(|_| LogError::Filter(options.level.clone()))?,
    };

    let console = if options.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let mut pruned = Pruned::default();
    let (file, guard) = match &options.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir).map_err(|source| LogError::Dir {
                path: dir.clone(),
                source,
            })?;
            pruned = prune_old_logs(dir, &options.app_name, options.keep_files.saturating_sub(1));
            let appender = tracing_appender::rolling::never(dir, log_file_name(&options.app_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer).boxed()), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| LogError::Install(e.to_string()))?;

    // Pruning ran before the subscriber existed.
    for (path, error) in &pruned.failed {
        tracing::warn!(path = %path.display(), %error, "failed to delete old log file");
    }
    if pruned.removed > 0 {
        tracing::debug!(removed = pruned.removed, "old log files pruned");
    }
    Ok(guard)
}

fn log_file_name(app_name: &str) -> String {
    format!("{}_{}.log", app_name, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"))
}

/// What [`prune_old_logs`] did.
#[derive(Debug, Default)]
pub struct Pruned {
    pub removed: usize,
    /// Files that could not be deleted.
    pub failed: Vec<(PathBuf, std::io::Error)>,
}

/// Deletes `<app>_*.log` files in `dir`, keeping the `keep` newest.
pub fn prune_old_logs(dir: &Path, app_name: &str, keep: usize) -> Pruned {
    let prefix = format!("{app_name}_");
    let mut pruned = Pruned::default();
    let Ok(entries) = fs::read_dir(dir) else {
        return pruned;
    };
    let mut logs: Vec<_> = entries
        .filter_map(Result::ok)
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with(&prefix) && name.ends_with(".log")
        })
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Newest first.
    logs.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

    for (_, path) in logs.into_iter().skip(keep) {
        match fs::remove_file(&path) {
            Ok(()) => pruned.removed += 1,
            Err(e) => pruned.failed.push((path, e)),
        }
    }
    pruned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_carry_app_and_timestamp() {
        let name = log_file_name("peer_client");
        assert!(name.starts_with("peer_client_"));
        assert!(name.ends_with(".log"));
    }

    #[test]
    fn pruning_keeps_only_the_newest_files_of_the_app() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "peer_client_2024-01-01_00-00-00.log",
            "peer_client_2024-01-02_00-00-00.log",
            "peer_client_2024-01-03_00-00-00.log",
            "other_2024-01-01_00-00-00.log",
            "peer_client_notes.txt",
        ] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let pruned = prune_old_logs(dir.path(), "peer_client", 1);
        assert_eq!(pruned.removed, 2);
        assert!(pruned.failed.is_empty());

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec![
                "other_2024-01-01_00-00-00.log",
                "peer_client_2024-01-03_00-00-00.log",
                "peer_client_notes.txt",
            ]
        );
    }

    #[test]
    fn undeletable_entries_are_reported_not_printed() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("peer_client_2024-01-01_00-00-00.log")).unwrap();
        fs::write(dir.path().join("peer_client_2024-01-02_00-00-00.log"), b"x").unwrap();

        let pruned = prune_old_logs(dir.path(), "peer_client", 0);
        assert_eq!(pruned.removed, 1);
        assert_eq!(pruned.failed.len(), 1);
        assert!(pruned.failed[0].0.ends_with("peer_client_2024-01-01_00-00-00.log"));
    }

    #[test]
    fn missing_directory_prunes_nothing() {
        let pruned = prune_old_logs(Path::new("/definitely/not/here"), "app", 0);
        assert_eq!(pruned.removed, 0);
        assert!(pruned.failed.is_empty());
    }
}
