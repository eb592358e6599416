use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{metrics::EvaluationSummary, TrainingError};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    /// Directory for TensorBoard event files; `None` disables summaries.
    pub summary_dir: Option<PathBuf>,
    pub flush_every_n: usize,
}

impl LoggingSettings {
    pub fn new(enable_stdout: bool, summary_dir: Option<PathBuf>, flush_every: usize) -> Self {
        Self {
            enable_stdout,
            summary_dir,
            flush_every_n: flush_every.max(1),
        }
    }
}

/// One evaluation report: the train/test pair is always present, the
/// validation summary only when a held-out split is being tracked.
pub struct EvaluationReport<'a> {
    pub train: &'a EvaluationSummary,
    pub test: &'a EvaluationSummary,
    pub validation: Option<&'a EvaluationSummary>,
}

/// Formats the periodic metrics line printed during training.
pub fn format_metrics_line(step: usize, report: &EvaluationReport<'_>) -> String {
    match report.validation {
        Some(validation) => format!(
            "Iter {}, training set accuracy {:.4}, loss {:.4}; validation set accuracy {:.4}, loss {:.4}; test accuracy {:.4}, loss {:.4}",
            step,
            report.train.accuracy,
            report.train.mean_loss,
            validation.accuracy,
            validation.mean_loss,
            report.test.accuracy,
            report.test.mean_loss
        ),
        None => format!(
            "Iter {}, training set accuracy {:.4}, loss {:.4}; test accuracy {:.4}, loss {:.4}",
            step,
            report.train.accuracy,
            report.train.mean_loss,
            report.test.accuracy,
            report.test.mean_loss
        ),
    }
}

pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = if let Some(dir) = settings.summary_dir.as_ref() {
            Some(TensorBoardWriter::create(dir, settings.flush_every_n)?)
        } else {
            None
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    /// Records the loss of the training step itself, as opposed to the
    /// full-split means reported by `log_evaluation`.
    pub fn log_training_step(&mut self, step: usize, loss: f64) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.write_scalar("train/step_loss", step as i64, loss);
        }
    }

    pub fn log_evaluation(&mut self, step: usize, report: &EvaluationReport<'_>) {
        if self.settings.enable_stdout {
            println!("{}", format_metrics_line(step, report));
            let _ = io::stdout().flush();
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step_i64 = step as i64;
            let _ = writer.write_scalar("train/accuracy", step_i64, report.train.accuracy);
            let _ = writer.write_scalar("train/loss", step_i64, report.train.mean_loss);
            let _ = writer.write_scalar("test/accuracy", step_i64, report.test.accuracy);
            let _ = writer.write_scalar("test/loss", step_i64, report.test.mean_loss);
            if let Some(validation) = report.validation {
                let _ = writer.write_scalar("validation/accuracy", step_i64, validation.accuracy);
                let _ = writer.write_scalar("validation/loss", step_i64, validation.mean_loss);
            }
        }
    }

    pub fn log_checkpoint(&mut self, step: usize, path: &Path) {
        if self.settings.enable_stdout {
            println!("Saved checkpoint at {} (global_step {})", path.display(), step);
            let _ = io::stdout().flush();
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create summary directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create summary file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    // TFRecord framing: length, masked crc of length, payload, masked crc
    // of payload.
    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode summary event: {err}"))
        })?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write summary event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush summary file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
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

    fn summary(accuracy: f64, loss: f64) -> EvaluationSummary {
        EvaluationSummary {
            accuracy,
            mean_loss: loss,
            examples: 100,
        }
    }

    #[test]
    fn metrics_line_without_validation() {
        let train = summary(0.91234, 0.4567);
        let test = summary(0.8, 0.9);
        let line = format_metrics_line(
            500,
            &EvaluationReport {
                train: &train,
                test: &test,
                validation: None,
            },
        );
        assert_eq!(
            line,
            "Iter 500, training set accuracy 0.9123, loss 0.4567; test accuracy 0.8000, loss 0.9000"
        );
    }

    #[test]
    fn metrics_line_with_validation_clause() {
        let train = summary(0.9, 0.5);
        let test = summary(0.8, 0.9);
        let validation = summary(0.85, 0.7);
        let line = format_metrics_line(
            1000,
            &EvaluationReport {
                train: &train,
                test: &test,
                validation: Some(&validation),
            },
        );
        assert_eq!(
            line,
            "Iter 1000, training set accuracy 0.9000, loss 0.5000; validation set accuracy 0.8500, loss 0.7000; test accuracy 0.8000, loss 0.9000"
        );
    }

    #[test]
    fn event_files_are_created_under_the_summary_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LoggingSettings::new(false, Some(dir.path().to_path_buf()), 1);
        let mut logger = Logger::new(settings).unwrap();
        let train = summary(0.5, 1.0);
        let test = summary(0.4, 1.2);
        logger.log_training_step(1, 1.7);
        logger.log_evaluation(
            1,
            &EvaluationReport {
                train: &train,
                test: &test,
                validation: None,
            },
        );
        logger.flush();

        let events: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("events.out.tfevents.")
            })
            .collect();
        assert_eq!(events.len(), 1);
        assert!(events[0].metadata().unwrap().len() > 0);
    }
}
