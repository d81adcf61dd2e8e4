use crate::{config::LoggingConfig, paths::AppDirs};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_FILE: &str = "tenshi.log";

/// Keeps the non-blocking file writer flushing until dropped.
pub struct LoggingGuard {
    _file_guard: WorkerGuard,
}

pub fn init_logging(config: &LoggingConfig, dirs: &AppDirs) -> Result<LoggingGuard, LoggingError> {
    let log_dir = dirs.log_dir();
    fs::create_dir_all(log_dir).map_err(|source| LoggingError::CreateDirectory {
        path: log_dir.to_path_buf(),
        source,
    })?;

    let directive = config.level.as_filter_directive();
    let env_filter = EnvFilter::try_new(directive).map_err(|source| LoggingError::ParseLevel {
        level: directive.to_string(),
        source,
    })?;

    let (file, file_guard) = file_writer(config, log_dir)?;
    let writer = if config.stdout {
        BoxMakeWriter::new(
            std::io::stdout
                .with_max_level(tracing::Level::TRACE)
                .and(file),
        )
    } else {
        BoxMakeWriter::new(file)
    };

    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(config.stdout)
        .with_writer(writer)
        .try_init()
        .map_err(LoggingError::SubscriberInstall)?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

fn file_writer(
    config: &LoggingConfig,
    log_dir: &Path,
) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    let file_stem = config.file_name.as_deref().unwrap_or(DEFAULT_LOG_FILE);
    prune_old_logs(log_dir, file_stem, config.max_log_files.max(1))?;

    let appender = tracing_appender::rolling::daily(log_dir, file_stem);
    Ok(tracing_appender::non_blocking(appender))
}

fn prune_old_logs(dir: &Path, file_stem: &str, keep: usize) -> Result<(), LoggingError> {
    let mut logs: Vec<_> = fs::read_dir(dir)
        .map_err(|source| LoggingError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(file_stem))
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((entry.path(), modified))
        })
        .collect();

    if logs.len() <= keep {
        return Ok(());
    }

    logs.sort_by_key(|(_, modified)| *modified);
    let excess = logs.len() - keep;
    for (path, _) in logs.into_iter().take(excess) {
        fs::remove_file(&path).map_err(|source| LoggingError::Cleanup { path, source })?;
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse log level {level}: {source}")]
    ParseLevel {
        level: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("failed to install tracing subscriber: {0}")]
    SubscriberInstall(Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to list log directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove old log file {path}: {source}")]
    Cleanup {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use std::time::{Duration, SystemTime};

    #[test]
    fn filter_directive_is_lowercase() {
        assert_eq!(LogLevel::Warn.as_filter_directive(), "warn");
    }

    #[test]
    fn prune_keeps_newest_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let base = SystemTime::now() - Duration::from_secs(3600);
        for (i, name) in ["tenshi.log.1", "tenshi.log.2", "tenshi.log.3"]
            .iter()
            .enumerate()
        {
            let path = tmp.path().join(name);
            let file = fs::File::create(&path).unwrap();
            file.set_modified(base + Duration::from_secs(i as u64 * 60))
                .unwrap();
        }
        fs::write(tmp.path().join("unrelated.txt"), "keep").unwrap();

        prune_old_logs(tmp.path(), "tenshi.log", 2).unwrap();

        assert!(!tmp.path().join("tenshi.log.1").exists());
        assert!(tmp.path().join("tenshi.log.2").exists());
        assert!(tmp.path().join("tenshi.log.3").exists());
        assert!(tmp.path().join("unrelated.txt").exists());
    }
}
