use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::constants::file;
use crate::error::Result;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    pub enable_file_logging: bool,
    pub log_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: Level::INFO,
            format: LogFormat::Compact,
            enable_file_logging: false,
            log_directory: None,
        }
    }
}

/// Installs the global subscriber. The returned guard must be kept alive for
/// the file writer to flush.
pub fn init_logging(config: LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let fmt_layer = match config.format {
        LogFormat::Compact => fmt::layer().compact().with_span_events(FmtSpan::CLOSE).boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_span_events(FmtSpan::CLOSE).boxed(),
        LogFormat::Json => fmt::layer().json().with_span_events(FmtSpan::CLOSE).boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    if config.enable_file_logging {
        let log_dir = config.log_directory.unwrap_or_else(|| PathBuf::from("logs"));
        fs::create_dir_all(&log_dir)?;

        let file_appender = rolling::daily(&log_dir, file::LOG_FILE);
        let (writer, guard) = non_blocking(file_appender);

        let file_layer = fmt::layer().json().with_writer(writer).with_span_events(FmtSpan::CLOSE);

        subscriber.with(file_layer).try_init()?;
        Ok(Some(guard))
    } else {
        subscriber.try_init()?;
        Ok(None)
    }
}

/// Running mean of a scalar, reset at the start of every epoch.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    pub val: f32,
    pub sum: f32,
    pub count: usize,
    pub avg: f32,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, val: f32) {
        self.update_n(val, 1);
    }

    pub fn update_n(&mut self, val: f32, n: usize) {
        self.val = val;
        self.sum += val * n as f32;
        self.count += n;
        self.avg = self.sum / self.count as f32;
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ScalarRecord {
    pub tag: String,
    pub value: f32,
    pub step: usize,
    pub wall_time: String,
}

/// Appends scalar time series as JSON lines to `{log_dir}/scalars.jsonl`.
pub struct ScalarWriter {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl ScalarWriter {
    pub fn create(log_dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(log_dir.as_ref())?;
        let path = log_dir.as_ref().join(file::SCALARS_FILE);
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(ScalarWriter {
            path,
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_scalar(&mut self, tag: &str, value: f32, step: usize) -> Result<()> {
        let record = ScalarRecord {
            tag: tag.to_string(),
            value,
            step,
            wall_time: chrono::Utc::now().to_rfc3339(),
        };
        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, &record)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.writer = None;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

impl Drop for ScalarWriter {
    fn drop(&mut self) {
        self.flush().ok();
    }
}

/// Reads back every record written by a [`ScalarWriter`].
pub fn read_scalars(path: impl AsRef<Path>) -> Result<Vec<ScalarRecord>> {
    let text = fs::read_to_string(path)?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_meter_tracks_mean() {
        let mut meter = AverageMeter::new();
        meter.update(1.0);
        meter.update(3.0);
        assert_eq!(meter.sum, 4.0);
        assert_eq!(meter.avg, 2.0);
        meter.reset();
        assert_eq!(meter.count, 0);
    }

    #[test]
    fn scalar_writer_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ScalarWriter::create(dir.path()).unwrap();
        writer.add_scalar("avg_validation_loss", 0.25, 3).unwrap();
        writer.add_scalar("avg_validation_metric", 1.5, 3).unwrap();
        writer.close().unwrap();
        assert!(writer.is_closed());

        let records = read_scalars(dir.path().join(file::SCALARS_FILE)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tag, "avg_validation_loss");
        assert_eq!(records[1].step, 3);
    }
}
