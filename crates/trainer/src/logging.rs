//! Scalar bookkeeping for a training run.
//!
//! Every value passed to [`TrainLogger::add_value`] is kept in memory (and
//! can be dumped as JSON), echoed through the `log` facade when stdout is
//! enabled, and appended to a TensorBoard event file when a directory is
//! configured.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{config::LoggingConfig, TrainingError};

pub struct TrainLogger {
    enable_stdout: bool,
    history: BTreeMap<String, Vec<(usize, f64)>>,
    tensorboard: Option<EventFileWriter>,
}

impl TrainLogger {
    pub fn new(config: &LoggingConfig) -> Result<Self, TrainingError> {
        let tensorboard = match config.tensorboard_dir.as_ref() {
            Some(dir) => Some(EventFileWriter::create(dir, config.tensorboard_flush_every_n)?),
            None => None,
        };
        Ok(Self {
            enable_stdout: config.enable_stdout,
            history: BTreeMap::new(),
            tensorboard,
        })
    }

    /// In-memory only; nothing is printed or written.
    pub fn silent() -> Self {
        Self {
            enable_stdout: false,
            history: BTreeMap::new(),
            tensorboard: None,
        }
    }

    pub fn add_value(&mut self, name: &str, value: f64, step: usize) {
        self.history
            .entry(name.to_string())
            .or_default()
            .push((step, value));

        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.write_scalar(name, step as i64, value) {
                log::warn!("dropping scalar '{name}' at step {step}: {err}");
            }
        }
    }

    /// Records every result under `<prefix><key>` and echoes them as one line.
    pub fn log_results(&mut self, prefix: &str, results: &BTreeMap<String, f64>, step: usize) {
        if self.enable_stdout && !results.is_empty() {
            let line = results
                .iter()
                .map(|(key, value)| format!("{key}={value:.5}"))
                .collect::<Vec<_>>()
                .join(" ");
            log::info!("{prefix}step={step} {line}");
        }
        for (key, value) in results {
            self.add_value(&format!("{prefix}{key}"), *value, step);
        }
    }

    pub fn info(&self, message: &str) {
        if self.enable_stdout {
            log::info!("{message}");
        }
    }

    pub fn history(&self, name: &str) -> &[(usize, f64)] {
        self.history.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn latest(&self, name: &str) -> Option<f64> {
        self.history(name).last().map(|(_, value)| *value)
    }

    /// Writes the full scalar history as JSON.
    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(&self.history).map_err(|err| {
            TrainingError::runtime(format!("failed to serialize training history: {err}"))
        })?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!("{err}");
            }
        }
    }
}

struct EventFileWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl EventFileWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let path = event_file_path(dir);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        log::debug!("writing tensorboard events to {}", path.display());
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };

        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        // TFRecord framing: len, masked crc(len), payload, masked crc(payload).
        let len_bytes = (data.len() as u64).to_le_bytes();
        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&masked_crc32(&len_bytes).to_le_bytes()))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&masked_crc32(&data).to_le_bytes()))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for EventFileWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn event_file_path(dir: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    dir.join(format!("events.out.tfevents.{timestamp}.{host}"))
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_history_and_writes_event_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            enable_stdout: false,
            tensorboard_dir: Some(dir.path().join("tb")),
            ..LoggingConfig::default()
        };
        let mut logger = TrainLogger::new(&config).unwrap();
        logger.add_value("loss", 0.5, 1);
        logger.add_value("loss", 0.25, 2);
        logger.log_results(
            "eval_",
            &BTreeMap::from([("mcc".to_string(), 0.75)]),
            2,
        );
        logger.flush();

        assert_eq!(logger.history("loss"), &[(1, 0.5), (2, 0.25)]);
        assert_eq!(logger.latest("eval_mcc"), Some(0.75));
        assert!(logger.history("missing").is_empty());

        let events: Vec<_> = fs::read_dir(dir.path().join("tb")).unwrap().collect();
        assert_eq!(events.len(), 1);
        let path = events[0].as_ref().unwrap().path();
        assert!(fs::metadata(path).unwrap().len() > 0);

        let history_path = dir.path().join("history.json");
        logger.save(&history_path).unwrap();
        let saved: BTreeMap<String, Vec<(usize, f64)>> =
            serde_json::from_slice(&fs::read(history_path).unwrap()).unwrap();
        assert_eq!(saved["loss"].len(), 2);
    }
}
