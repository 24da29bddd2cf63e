//! Logging bootstrap for scout
//!
//! Console output plus a date-rolled log file, both using the bracketed
//! `timestamp [LEVEL] message` layout. Respects `RUST_LOG` when set.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{
        self,
        format::{FmtSpan, Writer},
        FmtContext, FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment variable overriding the log directory
pub const LOG_DIR_ENV: &str = "SCOUT_LOG_DIR";

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter producing `timestamp [LEVEL] message key=value ...`
///
/// Example output: `2026-10-16T08:12:44.809123Z [INFO] Operate accepted device="ied1"`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// ============================================================================
// Log directory
// ============================================================================

/// Resolve the log directory
///
/// Priority: `SCOUT_LOG_DIR` env > configured dir > `logs`
pub fn resolve_log_dir(configured: Option<&str>) -> PathBuf {
    std::env::var(LOG_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            configured
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs"))
        })
}

// ============================================================================
// Date-rolled file writer
// ============================================================================

/// File writer naming its target `{YYYYMMDD}_{service}.log`, reopened when the
/// date changes or the file disappears underneath us.
struct DailyRollingWriter {
    service_name: String,
    log_dir: PathBuf,
    state: Arc<Mutex<RollingState>>,
}

struct RollingState {
    date: String,
    file: File,
}

impl DailyRollingWriter {
    fn new(service_name: String, log_dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&log_dir)?;
        let date = today();
        let file = open_append(&log_dir, &date, &service_name)?;
        Ok(Self {
            service_name,
            log_dir,
            state: Arc::new(Mutex::new(RollingState { date, file })),
        })
    }

    fn with_current<R>(
        &self,
        f: impl FnOnce(&mut File) -> std::io::Result<R>,
    ) -> std::io::Result<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| std::io::Error::other(format!("Mutex poisoned: {}", e)))?;

        let now = today();
        let path = self
            .log_dir
            .join(format!("{}_{}.log", state.date, self.service_name));
        if state.date != now || !path.exists() {
            fs::create_dir_all(&self.log_dir)?;
            state.file = open_append(&self.log_dir, &now, &self.service_name)?;
            state.date = now;
        }

        f(&mut state.file)
    }
}

fn today() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

fn open_append(dir: &std::path::Path, date: &str, service: &str) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{}_{}.log", date, service)))
}

impl Write for DailyRollingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.with_current(|file| file.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.with_current(|file| file.flush())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Logging section of the service configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset (e.g. `info`, `debug`)
    pub level: String,
    /// Log directory (overridden by `SCOUT_LOG_DIR`)
    pub dir: Option<String>,
    /// Write the log file at all
    pub file: bool,
    /// Use JSON lines in the log file
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            file: true,
            json: false,
        }
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used in file names and the default filter
    pub service_name: String,
    /// Base directory for logs; `None` disables the file sink
    pub log_dir: Option<PathBuf>,
    /// Default filter level
    pub level: String,
    /// Enable JSON format for the file sink
    pub enable_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "scout".to_string(),
            log_dir: Some(resolve_log_dir(None)),
            level: "info".to_string(),
            enable_json: false,
        }
    }
}

impl LogConfig {
    pub fn from_settings(service_name: &str, settings: &LoggingConfig) -> Self {
        Self {
            service_name: service_name.to_string(),
            log_dir: settings
                .file
                .then(|| resolve_log_dir(settings.dir.as_deref())),
            level: settings.level.clone(),
            enable_json: settings.json,
        }
    }

    fn filter(&self) -> EnvFilter {
        match std::env::var("RUST_LOG") {
            Ok(env_str) => EnvFilter::new(env_str),
            Err(_) => EnvFilter::new(format!(
                "{},{}=debug",
                self.level,
                self.service_name.replace('-', "_")
            )),
        }
    }
}

/// Keeps the non-blocking file writer flushing; drop it at process exit
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<LogGuard, Box<dyn std::error::Error>> {
    let console_layer = fmt::layer()
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .event_format(BracketedLevelFormat)
        .boxed();

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let writer = DailyRollingWriter::new(config.service_name.clone(), dir.clone())?;
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_level(true)
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(config.filter())
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    match &config.log_dir {
        Some(dir) => tracing::info!("Logging: {} @ {:?}", config.service_name, dir),
        None => tracing::info!("Logging: {} (console only)", config.service_name),
    }

    Ok(LogGuard { _file: guard })
}

/// Console-only init with a level string
pub fn init(level: &str) -> Result<LogGuard, Box<dyn std::error::Error>> {
    init_with_config(LogConfig {
        log_dir: None,
        level: level.to_string(),
        ..Default::default()
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_rolling_writer_creates_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            DailyRollingWriter::new("scout".to_string(), dir.path().to_path_buf()).unwrap();
        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();

        let expected = dir.path().join(format!("{}_scout.log", today()));
        let content = fs::read_to_string(expected).unwrap();
        assert_eq!(content, "hello\n");
    }

    #[test]
    fn test_rolling_writer_recreates_deleted_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            DailyRollingWriter::new("scout".to_string(), dir.path().to_path_buf()).unwrap();
        let path = dir.path().join(format!("{}_scout.log", today()));
        fs::remove_file(&path).unwrap();

        writer.write_all(b"again\n").unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "again\n");
    }

    #[test]
    fn test_log_config_from_settings() {
        let settings = LoggingConfig {
            level: "debug".into(),
            dir: Some("/tmp/scout-logs".into()),
            file: false,
            json: true,
        };
        let config = LogConfig::from_settings("scout", &settings);
        assert!(config.log_dir.is_none());
        assert!(config.enable_json);
        assert_eq!(config.level, "debug");
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: LoggingConfig = serde_yaml::from_str("level: warn").unwrap();
        assert_eq!(config.level, "warn");
        assert!(config.file);
        assert!(!config.json);
    }
}
