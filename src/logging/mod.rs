use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

use crate::config::{Config, LoggingSection};

const LOG_FILE_PREFIX: &str = "audio-output-coordinator.log";

/// Logging configuration
pub struct LoggingConfig {
    pub level: Level,
    pub file_output: bool,
    pub console_output: bool,
    pub log_dir: Option<PathBuf>,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_output: true,
            console_output: true,
            log_dir: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Build from the config file. `verbose` forces debug level.
    pub fn from_config(config: &Config, verbose: bool) -> Self {
        let LoggingSection {
            file_output,
            json_format,
            log_dir,
            ..
        } = config.logging.clone();

        let level = if verbose {
            Level::DEBUG
        } else {
            config.general.log_level.parse().unwrap_or(Level::INFO)
        };

        Self {
            level,
            file_output,
            console_output: true,
            log_dir,
            json_format,
        }
    }

    /// Console-only logging for one-shot CLI commands
    pub fn console_only(verbose: bool) -> Self {
        Self {
            level: if verbose { Level::DEBUG } else { Level::WARN },
            file_output: false,
            ..Self::default()
        }
    }
}

/// Initialize logging with file rotation and structured output
///
/// Returns a tuple of (WorkerGuard, log_dir) for optional startup message
pub fn initialize_logging(config: LoggingConfig) -> Result<(Option<WorkerGuard>, Option<PathBuf>)> {
    let mut layers = Vec::new();
    let mut guard = None;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "audio_output_coordinator={}",
            config.level.as_str().to_lowercase()
        ))
    });

    if config.console_output {
        let console_layer = if config.json_format {
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .boxed()
        };
        layers.push(console_layer);
    }

    // File output layer with daily rotation
    let log_dir = if config.file_output {
        let dir = match config.log_dir.clone() {
            Some(dir) => dir,
            None => get_default_log_dir()?,
        };
        std::fs::create_dir_all(&dir)?;

        let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(worker_guard);

        let file_layer = if config.json_format {
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(non_blocking)
                .boxed()
        } else {
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(non_blocking)
                .boxed()
        };
        layers.push(file_layer);

        Some(dir)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    Ok((guard, log_dir))
}

/// Get the default log directory path
pub fn get_default_log_dir() -> Result<PathBuf> {
    let home_dir =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Failed to get home directory"))?;
    Ok(home_dir.join(".local/share/audio-output-coordinator/logs"))
}

/// Remove rotated log files last modified more than `keep_days` ago.
///
/// Returns how many files were removed.
pub fn cleanup_old_logs(log_dir: &Path, keep_days: u64) -> Result<usize> {
    let cutoff_time = SystemTime::now() - Duration::from_secs(60 * 60 * 24 * keep_days);

    if !log_dir.exists() {
        return Ok(0);
    }

    let mut cleaned_count = 0;
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        let is_log = path.is_file()
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }

        let modified = entry.metadata().and_then(|metadata| metadata.modified());
        if !matches!(modified, Ok(time) if time < cutoff_time) {
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                cleaned_count += 1;
                tracing::debug!("Removed old log file: {}", path.display());
            }
            Err(e) => tracing::warn!("Failed to remove old log file {}: {}", path.display(), e),
        }
    }

    if cleaned_count > 0 {
        tracing::info!(
            "Cleaned up {} old log files from {}",
            cleaned_count,
            log_dir.display()
        );
    }

    Ok(cleaned_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_config_parses_level() {
        let mut config = Config::default();
        config.general.log_level = "trace".to_string();
        config.logging.file_output = false;

        let logging = LoggingConfig::from_config(&config, false);
        assert_eq!(logging.level, Level::TRACE);
        assert!(!logging.file_output);

        let verbose = LoggingConfig::from_config(&config, true);
        assert_eq!(verbose.level, Level::DEBUG);
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        let mut config = Config::default();
        config.general.log_level = "chatty".to_string();
        assert_eq!(LoggingConfig::from_config(&config, false).level, Level::INFO);
    }

    #[test]
    fn test_cleanup_keeps_recent_and_foreign_files() {
        let dir = TempDir::new().unwrap();
        let recent = dir.path().join(format!("{}.2026-10-18", LOG_FILE_PREFIX));
        let other = dir.path().join("notes.txt");
        std::fs::write(&recent, "recent").unwrap();
        std::fs::write(&other, "other").unwrap();

        let removed = cleanup_old_logs(dir.path(), 7).unwrap();

        assert_eq!(removed, 0);
        assert!(recent.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_cleanup_missing_dir_is_ok() {
        let dir = TempDir::new().unwrap();
        assert_eq!(cleanup_old_logs(&dir.path().join("missing"), 7).unwrap(), 0);
    }
}
